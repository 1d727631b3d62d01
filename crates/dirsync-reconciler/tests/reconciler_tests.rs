//! Finalizer state machine tests against in-memory collaborators.

mod common;

use std::sync::Arc;

use common::{bob, bob_key, group, has_finalizer, user, Call, MemoryStore, ScriptedDirectory};
use dirsync_connector::error::DirectoryError;
use dirsync_ldap::memory::{Fault, MemoryDirectory, Operation};
use dirsync_ldap::{DirectoryClient, LdapConfig};
use dirsync_reconciler::{
    LdapGroup, LdapUser, ReconcileAction, ReconcileError, Reconciler, ResourceKey, FINALIZER_NAME,
};

fn reconciler(
    store: &Arc<MemoryStore<LdapUser>>,
    directory: &Arc<ScriptedDirectory>,
) -> Reconciler<LdapUser> {
    Reconciler::new(store.clone(), directory.clone())
}

// =============================================================================
// Active records
// =============================================================================

#[tokio::test]
async fn test_first_pass_adds_finalizer_and_applies() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());

    let action = reconciler(&store, &directory)
        .reconcile(&bob_key())
        .await
        .unwrap();

    assert_eq!(action, ReconcileAction::Done);
    assert_eq!(directory.calls(), vec![Call::UpsertUser("bob".to_string())]);

    let record = store.record(&bob_key()).unwrap();
    assert_eq!(record.metadata.finalizers, vec![FINALIZER_NAME.to_string()]);
    assert!(record.status.created_on.is_some());
    assert_eq!(record.status.created_on, record.status.updated_on);
    let outcome = record.status.last_outcome.unwrap();
    assert!(outcome.succeeded);
    assert_eq!(outcome.observed_generation, 1);
}

#[tokio::test]
async fn test_later_pass_keeps_created_on() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    let reconciler = reconciler(&store, &directory);

    reconciler.reconcile(&bob_key()).await.unwrap();
    let created_on = store.record(&bob_key()).unwrap().status.created_on;
    store.edit(&bob_key(), |r| r.spec.shell = Some("/bin/zsh".to_string()));
    reconciler.reconcile(&bob_key()).await.unwrap();

    let record = store.record(&bob_key()).unwrap();
    assert_eq!(record.status.created_on, created_on);
    assert_eq!(record.status.last_outcome.unwrap().observed_generation, 2);
    assert_eq!(directory.count(&Call::UpsertUser("bob".to_string())), 2);
}

#[tokio::test]
async fn test_finalizer_persist_failure_has_no_directory_effect() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    store.fail_next_updates(1);

    let err = reconciler(&store, &directory)
        .reconcile(&bob_key())
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::FinalizerPersistence { .. }));
    assert!(err.is_retryable());
    assert!(directory.calls().is_empty());
    assert!(!has_finalizer(&store.record(&bob_key()).unwrap()));
}

#[tokio::test]
async fn test_directory_failure_is_recorded_and_returned() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    directory.fail_next_upserts(1);

    let err = reconciler(&store, &directory)
        .reconcile(&bob_key())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Directory {
            source: DirectoryError::ConnectionFailed { .. },
            ..
        }
    ));
    assert!(err.is_retryable());

    let record = store.record(&bob_key()).unwrap();
    assert!(has_finalizer(&record));
    assert!(record.status.created_on.is_none());
    let outcome = record.status.last_outcome.unwrap();
    assert!(!outcome.succeeded);
    assert!(outcome.message.unwrap().contains("unreachable"));
}

#[tokio::test]
async fn test_rejected_credentials_are_not_retryable() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    directory.reject_credentials(true);

    let err = reconciler(&store, &directory)
        .reconcile(&bob_key())
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(err.error_code(), "AUTH_FAILED");
}

#[tokio::test]
async fn test_status_persist_failure_after_apply() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    let mut record = bob();
    record.metadata.add_finalizer(FINALIZER_NAME);
    store.insert(record);
    store.fail_next_updates(1);

    let err = reconciler(&store, &directory)
        .reconcile(&bob_key())
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::StatusPersistence { .. }));
    assert_eq!(directory.calls().len(), 1);
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn test_failed_delete_keeps_finalizer() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    let reconciler = reconciler(&store, &directory);
    reconciler.reconcile(&bob_key()).await.unwrap();

    store.request_deletion(&bob_key());
    directory.fail_next_deletes(1);
    let err = reconciler.reconcile(&bob_key()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Cleanup { .. }));
    assert!(err.is_retryable());
    let record = store.record(&bob_key()).unwrap();
    assert!(has_finalizer(&record));
    assert!(record.metadata.deletion_requested());

    // Next attempt succeeds and releases the record.
    let action = reconciler.reconcile(&bob_key()).await.unwrap();
    assert_eq!(action, ReconcileAction::Removed);
    assert!(!store.contains(&bob_key()));
    assert_eq!(directory.count(&Call::DeleteUser("bob".to_string())), 2);
}

#[tokio::test]
async fn test_rejected_delete_is_reported_in_status() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    let reconciler = reconciler(&store, &directory);
    reconciler.reconcile(&bob_key()).await.unwrap();

    store.request_deletion(&bob_key());
    directory.fail_next_deletes(1);
    let err = reconciler.reconcile(&bob_key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cleanup { .. }));

    let record = store.record(&bob_key()).unwrap();
    assert!(has_finalizer(&record));
    let outcome = record.status.last_outcome.unwrap();
    assert!(!outcome.succeeded);
    assert!(outcome
        .message
        .as_deref()
        .is_some_and(|m| m.contains("insufficient access")));
    assert!(record.status.created_on.is_some());
}

#[tokio::test]
async fn test_cleanup_status_write_failure_keeps_cleanup_error() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    let reconciler = reconciler(&store, &directory);
    reconciler.reconcile(&bob_key()).await.unwrap();

    store.request_deletion(&bob_key());
    directory.fail_next_deletes(1);
    store.fail_next_updates(1);
    let err = reconciler.reconcile(&bob_key()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Cleanup { .. }));
    assert!(has_finalizer(&store.record(&bob_key()).unwrap()));
}

#[tokio::test]
async fn test_successful_delete_clears_finalizer() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    let reconciler = reconciler(&store, &directory);
    reconciler.reconcile(&bob_key()).await.unwrap();

    store.request_deletion(&bob_key());
    let action = reconciler.reconcile(&bob_key()).await.unwrap();

    assert_eq!(action, ReconcileAction::Removed);
    assert!(!store.contains(&bob_key()));
    assert_eq!(
        directory.calls(),
        vec![
            Call::UpsertUser("bob".to_string()),
            Call::DeleteUser("bob".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_finalizer_persist_failure_during_deletion_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    let reconciler = reconciler(&store, &directory);
    reconciler.reconcile(&bob_key()).await.unwrap();

    store.request_deletion(&bob_key());
    store.fail_next_updates(1);
    let err = reconciler.reconcile(&bob_key()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::FinalizerPersistence { .. }));
    assert!(has_finalizer(&store.record(&bob_key()).unwrap()));

    reconciler.reconcile(&bob_key()).await.unwrap();
    assert!(!store.contains(&bob_key()));
}

#[tokio::test]
async fn test_deletion_without_finalizer_has_no_side_effects() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    let mut record = bob();
    record.metadata.deletion_timestamp = Some(chrono::Utc::now());
    store.insert(record);

    let action = reconciler(&store, &directory)
        .reconcile(&bob_key())
        .await
        .unwrap();

    assert_eq!(action, ReconcileAction::Removed);
    assert!(directory.calls().is_empty());
    assert_eq!(store.update_count(), 0);
}

// =============================================================================
// Store failures
// =============================================================================

#[tokio::test]
async fn test_missing_record_is_noop() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();

    let action = reconciler(&store, &directory)
        .reconcile(&ResourceKey::new("default", "ghost"))
        .await
        .unwrap();

    assert_eq!(action, ReconcileAction::Removed);
    assert!(directory.calls().is_empty());
}

#[tokio::test]
async fn test_fetch_error_never_deletes() {
    let store = Arc::new(MemoryStore::new());
    let directory = ScriptedDirectory::new();
    store.insert(bob());
    let reconciler = reconciler(&store, &directory);
    reconciler.reconcile(&bob_key()).await.unwrap();

    store.fail_gets(true);
    let err = reconciler.reconcile(&bob_key()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Store { .. }));
    assert!(err.is_retryable());
    assert_eq!(directory.calls(), vec![Call::UpsertUser("bob".to_string())]);
}

// =============================================================================
// End to end over the in-memory directory
// =============================================================================

fn ldap(directory: &MemoryDirectory) -> Arc<DirectoryClient> {
    let config = LdapConfig::new("localhost", "dc=digitalis,dc=io", "cn=admin");
    Arc::new(DirectoryClient::new(&config, Arc::new(directory.clone())))
}

#[tokio::test]
async fn test_bob_lifecycle() {
    let directory = MemoryDirectory::new();
    let store: Arc<MemoryStore<LdapUser>> = Arc::new(MemoryStore::new());
    store.insert(bob());
    let reconciler: Reconciler<LdapUser> = Reconciler::new(store.clone(), ldap(&directory));

    reconciler.reconcile(&bob_key()).await.unwrap();
    reconciler.reconcile(&bob_key()).await.unwrap();

    assert_eq!(directory.len(), 1);
    let entry = directory
        .entry("uid=bob,ou=People,dc=digitalis,dc=io")
        .unwrap();
    assert_eq!(entry.first("uidNumber"), Some("2001"));
    assert_eq!(entry.first("loginShell"), Some("/bin/bash"));
    assert_eq!(entry.first("homeDirectory"), Some("/home/bob"));
    assert!(has_finalizer(&store.record(&bob_key()).unwrap()));

    store.request_deletion(&bob_key());
    let action = reconciler.reconcile(&bob_key()).await.unwrap();

    assert_eq!(action, ReconcileAction::Removed);
    assert!(directory.is_empty());
    assert!(!store.contains(&bob_key()));
}

#[tokio::test]
async fn test_unreachable_directory_during_deletion_keeps_record() {
    let directory = MemoryDirectory::new();
    let store: Arc<MemoryStore<LdapUser>> = Arc::new(MemoryStore::new());
    store.insert(bob());
    let reconciler: Reconciler<LdapUser> = Reconciler::new(store.clone(), ldap(&directory));
    reconciler.reconcile(&bob_key()).await.unwrap();

    store.request_deletion(&bob_key());
    directory.inject(Operation::Open, Fault::Unreachable);
    let err = reconciler.reconcile(&bob_key()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Cleanup { .. }));
    assert!(has_finalizer(&store.record(&bob_key()).unwrap()));
    assert_eq!(directory.len(), 1);
}

#[tokio::test]
async fn test_group_waits_for_member_to_exist() {
    let directory = MemoryDirectory::new();
    let users: Arc<MemoryStore<LdapUser>> = Arc::new(MemoryStore::new());
    let groups: Arc<MemoryStore<LdapGroup>> = Arc::new(MemoryStore::new());
    let client = ldap(&directory);
    let user_reconciler: Reconciler<LdapUser> = Reconciler::new(users.clone(), client.clone());
    let group_reconciler: Reconciler<LdapGroup> = Reconciler::new(groups.clone(), client);

    let ops = ResourceKey::new("default", "ops");
    groups.insert(group("ops", 3000, &["1001", "alice"]));

    let err = group_reconciler.reconcile(&ops).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Directory {
            source: DirectoryError::MembershipResolution { .. },
            ..
        }
    ));
    assert!(err.is_retryable());
    assert!(directory.is_empty());
    let outcome = groups.record(&ops).unwrap().status.last_outcome.unwrap();
    assert!(outcome.message.unwrap().contains("alice"));

    users.insert(user("alice", 1002));
    user_reconciler
        .reconcile(&ResourceKey::new("default", "alice"))
        .await
        .unwrap();
    group_reconciler.reconcile(&ops).await.unwrap();

    let entry = directory.entry("cn=ops,ou=Groups,dc=digitalis,dc=io").unwrap();
    assert_eq!(entry.values("memberUid"), ["1001", "1002"]);
    assert!(groups.record(&ops).unwrap().status.last_outcome.unwrap().succeeded);
}
