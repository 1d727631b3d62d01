//! POSIX account client
//!
//! Builds entries from account specs and applies them with delete-then-add
//! upserts. Every public operation opens one session and releases it when done.

use std::sync::Arc;

use async_trait::async_trait;
use dirsync_connector::error::{DirectoryError, DirectoryResult};
use tracing::{debug, info, instrument, warn};

use crate::account::{DirectoryGroup, DirectoryUser, GroupSpec, MemberRef, UserSpec};
use crate::config::LdapConfig;
use crate::escape::{escape_dn_value, escape_filter_value};
use crate::session::{
    DirectoryEntry, DirectorySession, LdapSessionFactory, NewEntry, SearchRequest, SessionFactory,
};

const USER_OBJECT_CLASSES: &[&str] = &["top", "posixAccount", "shadowAccount", "account"];
const GROUP_OBJECT_CLASSES: &[&str] = &["posixGroup"];

/// Account operations the reconciler drives.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Create or replace the user entry.
    async fn upsert_user(&self, user: &UserSpec) -> DirectoryResult<()>;

    /// Create or replace the group entry, resolving members first.
    async fn upsert_group(&self, group: &GroupSpec) -> DirectoryResult<()>;

    /// Delete the user entry; succeeds when it is already gone.
    async fn delete_user(&self, user: &UserSpec) -> DirectoryResult<()>;

    /// Delete the group entry; succeeds when it is already gone.
    async fn delete_group(&self, group: &GroupSpec) -> DirectoryResult<()>;
}

/// Client for user and group entries under a base DN.
pub struct DirectoryClient {
    sessions: Arc<dyn SessionFactory>,
    base_dn: String,
    user_base: String,
    group_base: String,
}

impl DirectoryClient {
    /// Create a client opening sessions through `sessions`.
    pub fn new(config: &LdapConfig, sessions: Arc<dyn SessionFactory>) -> Self {
        Self {
            sessions,
            base_dn: config.base_dn.clone(),
            user_base: config.user_base(),
            group_base: config.group_base(),
        }
    }

    /// Create a client that dials the configured LDAP server.
    pub fn connect_with(config: LdapConfig) -> DirectoryResult<Self> {
        let sessions = Arc::new(LdapSessionFactory::new(config.clone())?);
        Ok(Self::new(&config, sessions))
    }

    /// DN of a user entry: `uid=<username>,<user container>,<base>`.
    pub fn user_dn(&self, username: &str) -> String {
        format!("uid={},{}", escape_dn_value(username), self.user_base)
    }

    /// DN of a group entry: `cn=<name>,<group container>,<base>`.
    pub fn group_dn(&self, name: &str) -> String {
        format!("cn={},{}", escape_dn_value(name), self.group_base)
    }

    /// Single-result lookup of `(key=value)` anywhere under the base DN.
    ///
    /// Returns `Ok(None)` when nothing matches; errors are reserved for
    /// connection and protocol failures.
    pub async fn search(
        &self,
        key: &str,
        value: &str,
        attributes: &[&str],
    ) -> DirectoryResult<Option<DirectoryEntry>> {
        let request = SearchRequest::new(
            self.base_dn.as_str(),
            format!("({key}={})", escape_filter_value(value)),
            attributes,
        );
        let mut session = self.sessions.open().await?;
        let result = find_one(session.as_mut(), &request).await;
        session.close().await;
        result
    }

    /// Look up a user by username.
    #[instrument(skip(self))]
    pub async fn get_user(&self, username: &str) -> DirectoryResult<Option<DirectoryUser>> {
        let mut session = self.sessions.open().await?;
        let result = self.find_user(session.as_mut(), username).await;
        session.close().await;
        result
    }

    /// Look up a group by name.
    #[instrument(skip(self))]
    pub async fn get_group(&self, name: &str) -> DirectoryResult<Option<DirectoryGroup>> {
        let mut session = self.sessions.open().await?;
        let result = self.find_group(session.as_mut(), name).await;
        session.close().await;
        result
    }

    /// Translate member references into `memberUid` values.
    ///
    /// Numeric references pass through verbatim; usernames are replaced by
    /// their `uidNumber`. The first unresolvable reference fails the whole list.
    pub async fn resolve_members(&self, group: &GroupSpec) -> DirectoryResult<Vec<String>> {
        let mut session = self.sessions.open().await?;
        let result = self.resolve_members_in(session.as_mut(), group).await;
        session.close().await;
        result
    }

    fn user_search(&self, username: &str) -> SearchRequest {
        SearchRequest::new(
            self.user_base.as_str(),
            format!(
                "(&(objectClass=posixAccount)(uid={}))",
                escape_filter_value(username)
            ),
            DirectoryUser::ATTRIBUTES,
        )
    }

    fn group_search(&self, name: &str) -> SearchRequest {
        SearchRequest::new(
            self.group_base.as_str(),
            format!(
                "(&(objectClass=posixGroup)(cn={}))",
                escape_filter_value(name)
            ),
            DirectoryGroup::ATTRIBUTES,
        )
    }

    async fn find_user(
        &self,
        session: &mut dyn DirectorySession,
        username: &str,
    ) -> DirectoryResult<Option<DirectoryUser>> {
        find_one(session, &self.user_search(username))
            .await?
            .map(|entry| DirectoryUser::from_entry(&entry))
            .transpose()
    }

    async fn find_group(
        &self,
        session: &mut dyn DirectorySession,
        name: &str,
    ) -> DirectoryResult<Option<DirectoryGroup>> {
        find_one(session, &self.group_search(name))
            .await?
            .map(|entry| DirectoryGroup::from_entry(&entry))
            .transpose()
    }

    async fn resolve_members_in(
        &self,
        session: &mut dyn DirectorySession,
        group: &GroupSpec,
    ) -> DirectoryResult<Vec<String>> {
        let mut member_uids = Vec::with_capacity(group.members.len());

        for member in group.member_refs() {
            match member {
                MemberRef::Uid(uid) => member_uids.push(uid.to_string()),
                MemberRef::Username(username) => {
                    let user = self.find_user(session, username).await?.ok_or_else(|| {
                        DirectoryError::MembershipResolution {
                            reference: username.to_string(),
                        }
                    })?;
                    debug!(member = %username, uid_number = user.uid_number, "Resolved group member");
                    member_uids.push(user.uid_number.to_string());
                }
            }
        }

        Ok(member_uids)
    }

    /// The full entry written for a user.
    pub fn user_entry(&self, user: &UserSpec) -> NewEntry {
        NewEntry::new(self.user_dn(&user.username))
            .with("objectClass", strings(USER_OBJECT_CLASSES))
            .with("uid", single(&user.username))
            .with("cn", single(&user.username))
            .with("uidNumber", vec![user.uid.to_string()])
            .with("gidNumber", vec![user.gid.to_string()])
            .with("homeDirectory", vec![user.home_directory()])
            .with("gecos", single(&user.username))
            .with("userPassword", single(&user.password))
            .with("loginShell", single(user.shell.as_deref().unwrap_or("")))
    }

    /// The full entry written for a group with already resolved members.
    pub fn group_entry(&self, group: &GroupSpec, member_uids: Vec<String>) -> NewEntry {
        NewEntry::new(self.group_dn(&group.name))
            .with("objectClass", strings(GROUP_OBJECT_CLASSES))
            .with("cn", single(&group.name))
            .with("gidNumber", vec![group.gid.to_string()])
            .with("memberUid", member_uids)
    }

    async fn upsert_user_in(
        &self,
        session: &mut dyn DirectorySession,
        user: &UserSpec,
    ) -> DirectoryResult<()> {
        let dn = self.user_dn(&user.username);

        if self.find_user(session, &user.username).await?.is_some() {
            debug!(dn = %dn, "Replacing existing user entry");
            session.delete(&dn).await?;
        }

        session.add(&self.user_entry(user)).await?;
        info!(dn = %dn, "LDAP user entry written");
        Ok(())
    }

    async fn upsert_group_in(
        &self,
        session: &mut dyn DirectorySession,
        group: &GroupSpec,
    ) -> DirectoryResult<()> {
        // Resolve before touching the existing entry so a failure writes nothing.
        let member_uids = self.resolve_members_in(session, group).await?;
        let dn = self.group_dn(&group.name);

        if self.find_group(session, &group.name).await?.is_some() {
            debug!(dn = %dn, "Replacing existing group entry");
            session.delete(&dn).await?;
        }

        session.add(&self.group_entry(group, member_uids)).await?;
        info!(dn = %dn, "LDAP group entry written");
        Ok(())
    }

    async fn delete_user_in(
        &self,
        session: &mut dyn DirectorySession,
        user: &UserSpec,
    ) -> DirectoryResult<()> {
        if self.find_user(session, &user.username).await?.is_none() {
            debug!(username = %user.username, "User entry already absent");
            return Ok(());
        }

        let dn = self.user_dn(&user.username);
        session.delete(&dn).await?;
        info!(dn = %dn, "LDAP user entry deleted");
        Ok(())
    }

    async fn delete_group_in(
        &self,
        session: &mut dyn DirectorySession,
        group: &GroupSpec,
    ) -> DirectoryResult<()> {
        if self.find_group(session, &group.name).await?.is_none() {
            debug!(group = %group.name, "Group entry already absent");
            return Ok(());
        }

        let dn = self.group_dn(&group.name);
        session.delete(&dn).await?;
        info!(dn = %dn, "LDAP group entry deleted");
        Ok(())
    }
}

#[async_trait]
impl AccountDirectory for DirectoryClient {
    #[instrument(skip(self, user), fields(username = %user.username))]
    async fn upsert_user(&self, user: &UserSpec) -> DirectoryResult<()> {
        let mut session = self.sessions.open().await?;
        let result = self.upsert_user_in(session.as_mut(), user).await;
        session.close().await;
        result
    }

    #[instrument(skip(self, group), fields(group = %group.name))]
    async fn upsert_group(&self, group: &GroupSpec) -> DirectoryResult<()> {
        let mut session = self.sessions.open().await?;
        let result = self.upsert_group_in(session.as_mut(), group).await;
        session.close().await;
        result
    }

    #[instrument(skip(self, user), fields(username = %user.username))]
    async fn delete_user(&self, user: &UserSpec) -> DirectoryResult<()> {
        let mut session = self.sessions.open().await?;
        let result = self.delete_user_in(session.as_mut(), user).await;
        session.close().await;
        result
    }

    #[instrument(skip(self, group), fields(group = %group.name))]
    async fn delete_group(&self, group: &GroupSpec) -> DirectoryResult<()> {
        let mut session = self.sessions.open().await?;
        let result = self.delete_group_in(session.as_mut(), group).await;
        session.close().await;
        result
    }
}

impl std::fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("base_dn", &self.base_dn)
            .field("user_base", &self.user_base)
            .field("group_base", &self.group_base)
            .finish()
    }
}

async fn find_one(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
) -> DirectoryResult<Option<DirectoryEntry>> {
    let mut entries = session.search(request).await?;
    if entries.len() > 1 {
        warn!(
            filter = %request.filter,
            matches = entries.len(),
            "Lookup matched several entries, using the first"
        );
    }
    Ok(if entries.is_empty() {
        None
    } else {
        Some(entries.swap_remove(0))
    })
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

/// Single-valued attribute; empty strings are not written.
fn single(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value.to_string()]
    }
}
