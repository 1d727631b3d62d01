//! POSIX account definitions
//!
//! Desired-state account specs as declared by operators, and their
//! directory-side projections.

use dirsync_connector::error::{DirectoryError, DirectoryResult};
use serde::{Deserialize, Deserializer, Serialize};

use crate::session::DirectoryEntry;

/// Desired state of a POSIX user account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Login name; the directory key of the account.
    pub username: String,
    #[serde(deserialize_with = "numeric_id")]
    pub uid: u32,
    #[serde(deserialize_with = "numeric_id")]
    pub gid: u32,
    /// Opaque secret stored as `userPassword`.
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homedir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl UserSpec {
    pub fn new(username: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            username: username.into(),
            uid,
            gid,
            password: String::new(),
            homedir: None,
            shell: None,
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_homedir(mut self, homedir: impl Into<String>) -> Self {
        self.homedir = Some(homedir.into());
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Home directory, defaulting to `/home/<username>`.
    pub fn home_directory(&self) -> String {
        match self.homedir.as_deref() {
            Some(dir) if !dir.is_empty() => dir.to_string(),
            _ => format!("/home/{}", self.username),
        }
    }
}

impl std::fmt::Debug for UserSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSpec")
            .field("username", &self.username)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("password", &"***REDACTED***")
            .field("homedir", &self.homedir)
            .field("shell", &self.shell)
            .finish()
    }
}

/// Desired state of a POSIX group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    pub name: String,
    #[serde(deserialize_with = "numeric_id")]
    pub gid: u32,
    /// Member references, each a uid number or a username.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>, gid: u32) -> Self {
        Self {
            name: name.into(),
            gid,
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn member_refs(&self) -> impl Iterator<Item = MemberRef<'_>> {
        self.members.iter().map(|m| MemberRef::parse(m))
    }
}

/// A group member reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRef<'a> {
    /// Numeric reference, used verbatim as the `memberUid` value.
    Uid(&'a str),
    /// Username to look up.
    Username(&'a str),
}

impl<'a> MemberRef<'a> {
    pub fn parse(reference: &'a str) -> Self {
        if reference.parse::<i64>().is_ok() {
            MemberRef::Uid(reference)
        } else {
            MemberRef::Username(reference)
        }
    }
}

/// Accepts ids written either as JSON numbers or as numeric strings.
fn numeric_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(u32),
        Text(String),
    }

    match Id::deserialize(deserializer)? {
        Id::Number(n) => Ok(n),
        Id::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid numeric id: {s}"))),
    }
}

/// A `posixAccount` entry as found in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUser {
    pub dn: String,
    pub username: String,
    pub uid_number: u32,
    pub gid_number: u32,
    pub home_directory: Option<String>,
    pub login_shell: Option<String>,
}

impl DirectoryUser {
    pub(crate) const ATTRIBUTES: &'static [&'static str] = &[
        "uid",
        "cn",
        "uidNumber",
        "gidNumber",
        "homeDirectory",
        "loginShell",
    ];

    pub fn from_entry(entry: &DirectoryEntry) -> DirectoryResult<Self> {
        Ok(Self {
            dn: entry.dn.clone(),
            username: required(entry, "uid")?.to_string(),
            uid_number: numeric(entry, "uidNumber")?,
            gid_number: numeric(entry, "gidNumber")?,
            home_directory: entry.first("homeDirectory").map(str::to_string),
            login_shell: entry.first("loginShell").map(str::to_string),
        })
    }
}

/// A `posixGroup` entry as found in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryGroup {
    pub dn: String,
    pub name: String,
    pub gid_number: u32,
    pub member_uids: Vec<String>,
}

impl DirectoryGroup {
    pub(crate) const ATTRIBUTES: &'static [&'static str] = &["cn", "gidNumber", "memberUid"];

    pub fn from_entry(entry: &DirectoryEntry) -> DirectoryResult<Self> {
        Ok(Self {
            dn: entry.dn.clone(),
            name: required(entry, "cn")?.to_string(),
            gid_number: numeric(entry, "gidNumber")?,
            member_uids: entry.values("memberUid").to_vec(),
        })
    }
}

fn required<'e>(entry: &'e DirectoryEntry, name: &str) -> DirectoryResult<&'e str> {
    entry.first(name).ok_or_else(|| DirectoryError::InvalidData {
        message: format!("{} has no {name} attribute", entry.dn),
    })
}

fn numeric(entry: &DirectoryEntry, name: &str) -> DirectoryResult<u32> {
    let value = required(entry, name)?;
    value.parse().map_err(|_| DirectoryError::InvalidData {
        message: format!("{} has non-numeric {name}: {value}", entry.dn),
    })
}
