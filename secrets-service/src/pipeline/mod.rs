//! Per-request decision pipeline.
//!
//! Each stage is a component built from a shared [`NodeContext`]. Stages that
//! differ between a standalone node and a cluster member are traits with one
//! implementation per topology, picked once in [`Core::new`].

pub mod context;
pub mod control_group;
pub mod core;
pub mod forwarding;
pub mod identity;
pub mod lockout;
pub mod mfa;
pub mod registrar;
pub mod replication;

pub use self::context::{NodeContext, NodeState};
pub use self::control_group::{
    ControlGroupGate, DisabledControlGroupGate, GateOutcome, PersistentControlGroupGate,
};
pub use self::core::{Collaborators, Core};
pub use self::forwarding::{
    ClusterDispatcher, ForwardError, ForwardReply, ForwardingChannel, ForwardingClient,
    ForwardingDispatcher, StandaloneDispatcher,
};
pub use self::identity::{
    ForwardedIdentityWrites, IdentityResolver, IdentityWrites, LocalIdentityWrites,
};
pub use self::lockout::LockoutTracker;
pub use self::mfa::{MfaCache, MfaValidator};
pub use self::registrar::{AuthRegisterFunc, ExpirationManager, LeaseRegisterFunc, Registrars};
pub use self::replication::{
    ClusterBarrier, ReplicationBarrier, ReplicationSource, StandaloneBarrier,
    WatchReplicationSource,
};

/// Result of a stage that may have nothing to do for a request.
///
/// Keeps "this stage does not apply" apart from "this stage ran and
/// produced a value", so neither can be mistaken for a silent failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    NotApplicable,
    Applied(T),
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Outcome::Applied(value) => Some(value),
            Outcome::NotApplicable => None,
        }
    }
}
