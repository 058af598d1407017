//! End-to-end pipeline behavior on a standalone node.

mod common;

use common::{handle, login, standalone, standalone_config, MFA_MOUNT, PASSCODE, PASSWORD};
use secrets_service::models::{FailedLoginUser, Operation, Request};
use secrets_service::services::{CoreError, PathPolicyEngine};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn concurrent_first_logins_create_one_entity() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let core = node.core.clone();
            tokio::spawn(async move { handle(&core, login("userpass", "alice", PASSWORD)).await })
        })
        .collect();

    let mut entity_ids = HashSet::new();
    for h in handles {
        let response = h.await.unwrap().expect("login failed");
        entity_ids.insert(response.auth.unwrap().entity_id.expect("no entity attached"));
    }

    assert_eq!(entity_ids.len(), 1);
    assert_eq!(node.storage.keys_under("identity/entity/").await.len(), 1);
}

#[tokio::test]
async fn login_registers_token_with_entity() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    let auth = handle(&node.core, login("userpass", "dana", PASSWORD))
        .await
        .unwrap()
        .auth
        .unwrap();

    let entry = node
        .core
        .registrars()
        .lookup_token(&auth.client_token)
        .await
        .unwrap()
        .expect("token not registered");
    assert_eq!(entry.accessor, auth.accessor);
    assert_eq!(entry.entity_id, auth.entity_id);
}

#[tokio::test(start_paused = true)]
async fn mfa_result_is_reused_until_it_expires() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());
    let request = || login(MFA_MOUNT, "alice", PASSWORD).with_field("passcode", PASSCODE);

    let first = handle(&node.core, request()).await.unwrap().auth.unwrap();
    assert_eq!(node.mfa.calls(), 1);

    let second = handle(&node.core, request()).await.unwrap().auth.unwrap();
    assert_eq!(second.client_token, first.client_token);
    assert_eq!(node.mfa.calls(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;

    let third = handle(&node.core, request()).await.unwrap().auth.unwrap();
    assert_ne!(third.client_token, first.client_token);
    assert_eq!(node.mfa.calls(), 2);
}

#[tokio::test]
async fn failed_mfa_counts_toward_lockout() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    let err = handle(
        &node.core,
        login(MFA_MOUNT, "bob", PASSWORD).with_field("passcode", "000000"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::MfaValidationFailed(_)));

    let info = node
        .core
        .lockout()
        .get_user_failed_login_info(&FailedLoginUser::new(MFA_MOUNT, "bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.count, 1);
}

#[tokio::test]
async fn repeated_failures_lock_the_user_out() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    for _ in 0..3 {
        let err = handle(&node.core, login("userpass", "mallory", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::InvalidCredentials);
    }

    // Correct password no longer helps, and the backend is not consulted
    let err = handle(&node.core, login("userpass", "mallory", PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::LockedOut { retry_after_secs } if retry_after_secs > 0));
    assert_eq!(node.backend.executions(), 3);
}

#[tokio::test]
async fn successful_login_resets_failures() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());
    let user = FailedLoginUser::new("userpass", "carol");

    for _ in 0..2 {
        handle(&node.core, login("userpass", "carol", "wrong"))
            .await
            .unwrap_err();
    }
    handle(&node.core, login("userpass", "carol", PASSWORD))
        .await
        .unwrap();

    assert_eq!(
        node.core.lockout().get_user_failed_login_info(&user).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn secrets_get_a_registered_lease() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    let response = handle(&node.core, Request::new(Operation::Read, "database/creds/app"))
        .await
        .unwrap();

    let lease_id = response.secret.unwrap().lease_id.expect("lease not registered");
    assert!(lease_id.starts_with("database/creds/app/"));
    assert_eq!(node.storage.keys_under("sys/expire/id/").await.len(), 1);
}

#[tokio::test]
async fn failed_lease_registration_revokes_the_secret() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());
    node.storage.fail_writes_under("sys/expire/");

    let err = handle(&node.core, Request::new(Operation::Read, "database/creds/app"))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::RegistrationFailed(_)));
    assert_eq!(node.backend.revoked(), 1);
}

#[tokio::test]
async fn failed_auth_registration_fails_the_login() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());
    node.storage.fail_writes_under("sys/token/");

    let err = handle(&node.core, login("userpass", "erin", PASSWORD))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::RegistrationFailed(_)));
    assert!(node.storage.keys_under("sys/token/").await.is_empty());
}

#[tokio::test]
async fn denied_policy_never_reaches_the_backend() {
    let node = standalone(standalone_config(), PathPolicyEngine::new().deny("kv/locked"));

    let err = handle(
        &node.core,
        Request::new(Operation::Update, "kv/locked/db").with_field("password", "x"),
    )
    .await
    .unwrap_err();

    assert_eq!(err, CoreError::PermissionDenied);
    assert_eq!(node.backend.executions(), 0);
}

#[tokio::test]
async fn unknown_client_token_is_denied() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    let err = handle(
        &node.core,
        Request::new(Operation::Update, "kv/app")
            .with_field("password", "x")
            .with_client_token("s.does-not-exist"),
    )
    .await
    .unwrap_err();

    assert_eq!(err, CoreError::PermissionDenied);
    assert_eq!(node.backend.executions(), 0);
}

#[tokio::test]
async fn health_is_answered_locally() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    let response = handle(&node.core, Request::new(Operation::Read, "sys/health"))
        .await
        .unwrap();

    assert_eq!(response.data["standby"], false);
    assert_eq!(response.data["sealed"], false);
    assert_eq!(node.backend.executions(), 0);
}

#[tokio::test]
async fn merged_entities_share_future_logins() {
    let node = standalone(standalone_config(), PathPolicyEngine::new());

    let alice = handle(&node.core, login("userpass", "alice", PASSWORD))
        .await
        .unwrap()
        .auth
        .unwrap()
        .entity_id
        .unwrap();
    let bob = handle(&node.core, login("userpass", "bob", PASSWORD))
        .await
        .unwrap()
        .auth
        .unwrap()
        .entity_id
        .unwrap();
    assert_ne!(alice, bob);

    let merged = handle(
        &node.core,
        Request::new(Operation::Update, "identity/entity/merge")
            .with_field("from_entity_id", bob.as_str())
            .with_field("to_entity_id", alice.as_str()),
    )
    .await
    .unwrap();
    assert_eq!(merged.data["id"], alice.as_str());

    let again = handle(&node.core, login("userpass", "bob", PASSWORD))
        .await
        .unwrap()
        .auth
        .unwrap();
    assert_eq!(again.entity_id.as_deref(), Some(alice.as_str()));

    let read = handle(
        &node.core,
        Request::new(Operation::Read, format!("identity/entity/id/{}", bob)),
    )
    .await
    .unwrap_err();
    assert!(matches!(read, CoreError::UnsupportedPath(_)));
}
