use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub cluster: ClusterConfig,
    pub replication: ReplicationConfig,
    pub lockout: LockoutConfig,
    pub mfa: MfaConfig,
    pub control_group: ControlGroupConfig,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

/// Whether the node runs alone or as a member of a cluster.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    Standalone,
    Clustered,
}

/// HA role inside the local cluster.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Active,
    Standby,
}

/// Role of the local cluster in cross-cluster replication.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationRole {
    Primary,
    PerformanceSecondary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    pub node_id: String,
    /// Role at startup; changes later through promote/demote.
    pub node_role: NodeRole,
    pub replication_role: ReplicationRole,
    /// Base URL of the active node's internal listener.
    pub active_node_addr: Option<String>,
    /// Base URL of the primary cluster, for identity writes from a secondary.
    pub primary_cluster_addr: Option<String>,
    pub forward_timeout_ms: u64,
    pub forward_max_retries: u32,
    /// Listener for the node-to-node endpoints, separate from the client one.
    pub listen_addr: SocketAddr,
    /// Presented by every peer call; required in clustered mode.
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    pub threshold: u32,
    pub duration_seconds: u64,
    pub counter_reset_seconds: u64,
    pub disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlGroupConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub required_approvals: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
}

impl ClusterConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

impl ReplicationConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl LockoutConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    pub fn counter_reset(&self) -> Duration {
        Duration::from_secs(self.counter_reset_seconds)
    }
}

impl MfaConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl SecretsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = SecretsConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("secrets-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            cluster: ClusterConfig {
                mode: parse_env("CLUSTER_MODE", "standalone")?,
                node_id: get_env("NODE_ID", Some("node-1"), is_prod)?,
                node_role: parse_env("NODE_ROLE", "active")?,
                replication_role: parse_env("REPLICATION_ROLE", "primary")?,
                active_node_addr: get_optional_env("ACTIVE_NODE_ADDR"),
                primary_cluster_addr: get_optional_env("PRIMARY_CLUSTER_ADDR"),
                forward_timeout_ms: parse_env("FORWARD_TIMEOUT_MS", "5000")?,
                forward_max_retries: parse_env("FORWARD_MAX_RETRIES", "2")?,
                listen_addr: parse_env("CLUSTER_LISTEN_ADDR", DEFAULT_CLUSTER_LISTEN_ADDR)?,
                shared_secret: get_optional_env("CLUSTER_SHARED_SECRET"),
            },
            replication: ReplicationConfig {
                wait_timeout_ms: parse_env("REPLICATION_WAIT_TIMEOUT_MS", "2000")?,
            },
            lockout: LockoutConfig {
                threshold: parse_env("LOCKOUT_THRESHOLD", "5")?,
                duration_seconds: parse_env("LOCKOUT_DURATION_SECONDS", "900")?,
                counter_reset_seconds: parse_env("LOCKOUT_COUNTER_RESET_SECONDS", "900")?,
                disabled: parse_env("LOCKOUT_DISABLED", "false")?,
            },
            mfa: MfaConfig {
                cache_ttl_seconds: parse_env("MFA_CACHE_TTL_SECONDS", "300")?,
            },
            control_group: ControlGroupConfig {
                enabled: parse_env("CONTROL_GROUPS_ENABLED", "false")?,
                ttl_seconds: parse_env("CONTROL_GROUP_TTL_SECONDS", "86400")?,
                required_approvals: parse_env("CONTROL_GROUP_REQUIRED_APPROVALS", "1")?,
            },
            redis: RedisConfig {
                url: get_optional_env("REDIS_URL"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Single active node with in-process caches and default tunables.
    pub fn standalone() -> Self {
        SecretsConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "secrets-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            cluster: ClusterConfig {
                mode: ClusterMode::Standalone,
                node_id: "node-1".to_string(),
                node_role: NodeRole::Active,
                replication_role: ReplicationRole::Primary,
                active_node_addr: None,
                primary_cluster_addr: None,
                forward_timeout_ms: 5000,
                forward_max_retries: 2,
                listen_addr: SocketAddr::from(([0, 0, 0, 0], 8201)),
                shared_secret: None,
            },
            replication: ReplicationConfig {
                wait_timeout_ms: 2000,
            },
            lockout: LockoutConfig {
                threshold: 5,
                duration_seconds: 900,
                counter_reset_seconds: 900,
                disabled: false,
            },
            mfa: MfaConfig {
                cache_ttl_seconds: 300,
            },
            control_group: ControlGroupConfig {
                enabled: false,
                ttl_seconds: 86400,
                required_approvals: 1,
            },
            redis: RedisConfig { url: None },
        }
    }

    /// Clustered node in the given role, forwarding to `active_node_addr`.
    pub fn clustered(node_id: &str, role: NodeRole, active_node_addr: Option<&str>) -> Self {
        let mut config = Self::standalone();
        config.cluster.mode = ClusterMode::Clustered;
        config.cluster.node_id = node_id.to_string();
        config.cluster.node_role = role;
        config.cluster.active_node_addr = active_node_addr.map(|s| s.to_string());
        config
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(config_error("PORT must be greater than 0"));
        }

        if self.cluster.mode == ClusterMode::Standalone {
            if self.cluster.node_role != NodeRole::Active {
                return Err(config_error("a standalone node must start as active"));
            }
            if self.cluster.replication_role != ReplicationRole::Primary {
                return Err(config_error(
                    "REPLICATION_ROLE=performance_secondary requires CLUSTER_MODE=clustered",
                ));
            }
        }

        if self.cluster.mode == ClusterMode::Clustered
            && self.cluster.node_role == NodeRole::Standby
            && self.cluster.active_node_addr.is_none()
        {
            return Err(config_error(
                "ACTIVE_NODE_ADDR is required for a clustered standby node",
            ));
        }

        if self.cluster.mode == ClusterMode::Clustered {
            match self.cluster.shared_secret.as_deref() {
                None => {
                    return Err(config_error(
                        "CLUSTER_SHARED_SECRET is required in clustered mode",
                    ))
                }
                Some(secret) if secret.len() < MIN_SHARED_SECRET_LEN => {
                    return Err(config_error(&format!(
                        "CLUSTER_SHARED_SECRET must be at least {} characters",
                        MIN_SHARED_SECRET_LEN
                    )))
                }
                Some(_) => {}
            }
            if self.cluster.listen_addr == self.common.listen_addr() {
                return Err(config_error(
                    "CLUSTER_LISTEN_ADDR must differ from the client listener",
                ));
            }
        }

        if self.cluster.forward_timeout_ms == 0 {
            return Err(config_error("FORWARD_TIMEOUT_MS must be positive"));
        }

        if self.replication.wait_timeout_ms == 0 {
            return Err(config_error("REPLICATION_WAIT_TIMEOUT_MS must be positive"));
        }

        if self.lockout.threshold == 0 {
            return Err(config_error("LOCKOUT_THRESHOLD must be positive"));
        }

        if self.lockout.duration_seconds == 0 || self.lockout.counter_reset_seconds == 0 {
            return Err(config_error(
                "LOCKOUT_DURATION_SECONDS and LOCKOUT_COUNTER_RESET_SECONDS must be positive",
            ));
        }

        if self.mfa.cache_ttl_seconds == 0 {
            return Err(config_error("MFA_CACHE_TTL_SECONDS must be positive"));
        }

        if self.control_group.ttl_seconds == 0 {
            return Err(config_error("CONTROL_GROUP_TTL_SECONDS must be positive"));
        }

        if self.control_group.required_approvals == 0 {
            return Err(config_error(
                "CONTROL_GROUP_REQUIRED_APPROVALS must be at least 1",
            ));
        }

        if self.environment == Environment::Prod {
            if self.lockout.disabled {
                tracing::error!("Login lockout is disabled in production");
            }

            if self.cluster.replication_role == ReplicationRole::PerformanceSecondary
                && self.cluster.primary_cluster_addr.is_none()
            {
                tracing::error!(
                    "PRIMARY_CLUSTER_ADDR not set; new identities cannot be created on this secondary"
                );
            }
        }

        Ok(())
    }
}

const DEFAULT_CLUSTER_LISTEN_ADDR: &str = "0.0.0.0:8201";
const MIN_SHARED_SECRET_LEN: usize = 16;

fn config_error(msg: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(msg.to_string()))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("invalid value for {}: {}", key, e))
    })
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for ClusterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standalone" => Ok(ClusterMode::Standalone),
            "clustered" => Ok(ClusterMode::Clustered),
            _ => Err(format!("Invalid cluster mode: {}", s)),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(NodeRole::Active),
            "standby" => Ok(NodeRole::Standby),
            _ => Err(format!("Invalid node role: {}", s)),
        }
    }
}

impl FromStr for ReplicationRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(ReplicationRole::Primary),
            "performance_secondary" | "performance-secondary" => {
                Ok(ReplicationRole::PerformanceSecondary)
            }
            _ => Err(format!("Invalid replication role: {}", s)),
        }
    }
}
