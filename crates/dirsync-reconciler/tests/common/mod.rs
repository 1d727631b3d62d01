//! Shared test doubles: an in-memory record store and a scriptable directory.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dirsync_connector::error::{DirectoryError, DirectoryResult};
use dirsync_ldap::{AccountDirectory, GroupSpec, UserSpec};
use dirsync_reconciler::{
    LdapGroup, LdapUser, ListSelector, ManagedResource, ObjectMeta, ResourceKey, ResourceStore,
    StoreError, FINALIZER_NAME,
};

pub fn bob_key() -> ResourceKey {
    ResourceKey::new("default", "bob")
}

pub fn bob() -> LdapUser {
    LdapUser::new(
        ObjectMeta::new("default", "bob"),
        UserSpec::new("bob", 2001, 2001)
            .with_password("pw")
            .with_shell("/bin/bash"),
    )
}

pub fn user(name: &str, uid: u32) -> LdapUser {
    LdapUser::new(ObjectMeta::new("default", name), UserSpec::new(name, uid, uid))
}

pub fn group(name: &str, gid: u32, members: &[&str]) -> LdapGroup {
    LdapGroup::new(
        ObjectMeta::new("default", name),
        GroupSpec::new(name, gid).with_members(members.iter().copied()),
    )
}

/// Wait until `condition` holds, polling for up to two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Store keeping records in memory with optimistic versioning.
///
/// A record with deletion requested and no finalizers left is removed on
/// update, as an API server would.
pub struct MemoryStore<R> {
    records: Mutex<BTreeMap<ResourceKey, R>>,
    version: AtomicU64,
    fail_gets: AtomicBool,
    failing_updates: AtomicUsize,
    updates: AtomicUsize,
}

impl<R: ManagedResource> MemoryStore<R> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(1),
            fail_gets: AtomicBool::new(false),
            failing_updates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    fn next_version(&self) -> Option<String> {
        Some(self.version.fetch_add(1, Ordering::SeqCst).to_string())
    }

    pub fn insert(&self, mut record: R) {
        record.metadata_mut().resource_version = self.next_version();
        let key = record.metadata().key();
        self.records.lock().unwrap().insert(key, record);
    }

    pub fn record(&self, key: &ResourceKey) -> Option<R> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.record(key).is_some()
    }

    /// Apply a spec change, advancing the generation.
    pub fn edit(&self, key: &ResourceKey, change: impl FnOnce(&mut R)) -> i64 {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(key).expect("record exists");
        change(record);
        let meta = record.metadata_mut();
        meta.generation += 1;
        meta.resource_version = Some(self.version.fetch_add(1, Ordering::SeqCst).to_string());
        meta.generation
    }

    /// Request deletion. Records without finalizers are removed at once.
    pub fn request_deletion(&self, key: &ResourceKey) {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(key) else {
            return;
        };
        if record.metadata().finalizers.is_empty() {
            records.remove(key);
            return;
        }
        let meta = record.metadata_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version = Some(self.version.fetch_add(1, Ordering::SeqCst).to_string());
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` updates fail as unavailable.
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: ManagedResource> ResourceStore<R> for MemoryStore<R> {
    async fn get(&self, key: &ResourceKey) -> Result<Option<R>, StoreError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected get failure"));
        }
        Ok(self.record(key))
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<R>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| selector.matches(key))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn update(&self, record: &R) -> Result<R, StoreError> {
        if self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::unavailable("injected update failure"));
        }

        let key = record.metadata().key();
        let mut records = self.records.lock().unwrap();
        let stored = records.get(&key).ok_or_else(|| StoreError::Conflict {
            key: key.clone(),
            message: "record no longer exists".to_string(),
        })?;

        if stored.metadata().resource_version != record.metadata().resource_version {
            return Err(StoreError::Conflict {
                key,
                message: "stale resource version".to_string(),
            });
        }

        let mut updated = record.clone();
        let meta = updated.metadata_mut();
        meta.generation = stored.metadata().generation;
        meta.deletion_timestamp = stored.metadata().deletion_timestamp;
        meta.resource_version = Some(self.version.fetch_add(1, Ordering::SeqCst).to_string());

        self.updates.fetch_add(1, Ordering::SeqCst);
        if meta.deletion_requested() && meta.finalizers.is_empty() {
            records.remove(&key);
        } else {
            records.insert(key, updated.clone());
        }
        Ok(updated)
    }
}

/// Directory call as seen by [`ScriptedDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    UpsertUser(String),
    UpsertGroup(String),
    DeleteUser(String),
    DeleteGroup(String),
}

/// Directory double with scripted failures and per-name concurrency tracking.
#[derive(Default)]
pub struct ScriptedDirectory {
    calls: Mutex<Vec<Call>>,
    failing_upserts: AtomicUsize,
    failing_deletes: AtomicUsize,
    reject_credentials: AtomicBool,
    hanging_calls: AtomicUsize,
    delay_ms: AtomicU64,
    active: Mutex<HashMap<String, usize>>,
    max_active_per_name: AtomicUsize,
}

struct ActiveGuard<'a> {
    directory: &'a ScriptedDirectory,
    name: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.directory.active.lock().unwrap().get_mut(&self.name) {
            *count -= 1;
        }
    }
}

impl ScriptedDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` upserts fail with a transient error.
    pub fn fail_next_upserts(&self, count: usize) {
        self.failing_upserts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` deletes fail with a protocol error.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.reject_credentials.store(reject, Ordering::SeqCst);
    }

    /// Make the next `count` calls never return.
    pub fn hang_next(&self, count: usize) {
        self.hanging_calls.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn max_active_per_name(&self) -> usize {
        self.max_active_per_name.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn enter(&self, call: Call, name: &str) -> ActiveGuard<'_> {
        self.calls.lock().unwrap().push(call);
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(name.to_string()).or_insert(0);
            *count += 1;
            self.max_active_per_name.fetch_max(*count, Ordering::SeqCst);
        }
        let guard = ActiveGuard {
            directory: self,
            name: name.to_string(),
        };

        if Self::take(&self.hanging_calls) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        guard
    }

    fn upsert_outcome(&self) -> DirectoryResult<()> {
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(DirectoryError::AuthenticationFailed {
                bind_dn: "cn=admin".to_string(),
            });
        }
        if Self::take(&self.failing_upserts) {
            return Err(DirectoryError::connection_failed("directory unreachable"));
        }
        Ok(())
    }

    fn delete_outcome(&self) -> DirectoryResult<()> {
        if Self::take(&self.failing_deletes) {
            return Err(DirectoryError::protocol("delete", 50, "insufficient access"));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountDirectory for ScriptedDirectory {
    async fn upsert_user(&self, user: &UserSpec) -> DirectoryResult<()> {
        let _guard = self.enter(Call::UpsertUser(user.username.clone()), &user.username).await;
        self.upsert_outcome()
    }

    async fn upsert_group(&self, group: &GroupSpec) -> DirectoryResult<()> {
        let _guard = self.enter(Call::UpsertGroup(group.name.clone()), &group.name).await;
        self.upsert_outcome()
    }

    async fn delete_user(&self, user: &UserSpec) -> DirectoryResult<()> {
        let _guard = self.enter(Call::DeleteUser(user.username.clone()), &user.username).await;
        self.delete_outcome()
    }

    async fn delete_group(&self, group: &GroupSpec) -> DirectoryResult<()> {
        let _guard = self.enter(Call::DeleteGroup(group.name.clone()), &group.name).await;
        self.delete_outcome()
    }
}

pub fn has_finalizer<R: ManagedResource>(record: &R) -> bool {
    record.metadata().has_finalizer(FINALIZER_NAME)
}
