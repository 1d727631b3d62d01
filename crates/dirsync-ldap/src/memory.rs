//! In-memory directory for tests
//!
//! Implements [`SessionFactory`] over a shared entry map. Filters are limited
//! to equality assertions, optionally combined with `&`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dirsync_connector::error::{DirectoryError, DirectoryResult};

use crate::session::{DirectoryEntry, DirectorySession, NewEntry, SearchRequest, SessionFactory};

/// Operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Open,
    Search,
    Add,
    Delete,
}

/// Failure returned by a faulted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Server cannot be reached.
    Unreachable,
    /// Bind rejected.
    InvalidCredentials,
    /// Server answered with a result code.
    Protocol(u32),
}

impl Fault {
    fn to_error(self, operation: Operation) -> DirectoryError {
        match self {
            Fault::Unreachable => DirectoryError::connection_failed("directory unreachable"),
            Fault::InvalidCredentials => DirectoryError::AuthenticationFailed {
                bind_dn: "cn=admin".to_string(),
            },
            Fault::Protocol(code) => DirectoryError::protocol(
                operation.name(),
                code,
                format!("injected result code {code}"),
            ),
        }
    }
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Open => "bind",
            Operation::Search => "search",
            Operation::Add => "add",
            Operation::Delete => "delete",
        }
    }
}

/// Operation counters. Writes count only when applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub opens: usize,
    pub closes: usize,
    pub searches: usize,
    pub adds: usize,
    pub deletes: usize,
}

impl Stats {
    /// Writes that reached the directory.
    pub fn mutations(&self) -> usize {
        self.adds + self.deletes
    }
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by lower-cased DN.
    entries: BTreeMap<String, DirectoryEntry>,
    faults: BTreeMap<Operation, Fault>,
    stats: Stats,
}

/// Shared in-memory directory. Clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<State>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an entry without counting it as a mutation.
    pub fn insert(&self, entry: NewEntry) {
        self.state()
            .entries
            .insert(entry.dn.to_ascii_lowercase(), to_stored(&entry));
    }

    pub fn entry(&self, dn: &str) -> Option<DirectoryEntry> {
        self.state().entries.get(&dn.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, dn: &str) -> bool {
        self.entry(dn).is_some()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every later `operation` fail with `fault` until cleared.
    pub fn inject(&self, operation: Operation, fault: Fault) {
        self.state().faults.insert(operation, fault);
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    pub fn stats(&self) -> Stats {
        self.state().stats
    }

    pub fn reset_stats(&self) {
        self.state().stats = Stats::default();
    }
}

#[async_trait]
impl SessionFactory for MemoryDirectory {
    async fn open(&self) -> DirectoryResult<Box<dyn DirectorySession>> {
        let mut state = self.state();
        state.stats.opens += 1;
        if let Some(fault) = state.faults.get(&Operation::Open) {
            return Err(fault.to_error(Operation::Open));
        }
        Ok(Box::new(MemorySession {
            directory: self.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    directory: MemoryDirectory,
    closed: bool,
}

impl MemorySession {
    fn begin(&self, operation: Operation) -> DirectoryResult<MutexGuard<'_, State>> {
        if self.closed {
            return Err(DirectoryError::connection_failed("session already closed"));
        }
        let mut state = self.directory.state();
        if operation == Operation::Search {
            state.stats.searches += 1;
        }
        if let Some(fault) = state.faults.get(&operation) {
            return Err(fault.to_error(operation));
        }
        Ok(state)
    }
}

#[async_trait]
impl DirectorySession for MemorySession {
    async fn search(&mut self, request: &SearchRequest) -> DirectoryResult<Vec<DirectoryEntry>> {
        let state = self.begin(Operation::Search)?;
        let base = request.base.to_ascii_lowercase();
        let clauses = parse_filter(&request.filter)?;

        Ok(state
            .entries
            .iter()
            .filter(|(dn, _)| dn.as_str() == base || dn.ends_with(&format!(",{base}")))
            .filter(|(_, entry)| {
                clauses.iter().all(|(attr, value)| {
                    entry
                        .values(attr)
                        .iter()
                        .any(|v| v.eq_ignore_ascii_case(value))
                })
            })
            .map(|(_, entry)| project(entry, &request.attributes))
            .collect())
    }

    async fn add(&mut self, entry: &NewEntry) -> DirectoryResult<()> {
        let mut state = self.begin(Operation::Add)?;
        let key = entry.dn.to_ascii_lowercase();
        if state.entries.contains_key(&key) {
            return Err(DirectoryError::protocol("add", 68, "Entry already exists"));
        }
        state.entries.insert(key, to_stored(entry));
        state.stats.adds += 1;
        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> DirectoryResult<()> {
        let mut state = self.begin(Operation::Delete)?;
        if state.entries.remove(&dn.to_ascii_lowercase()).is_none() {
            return Err(DirectoryError::protocol("delete", 32, "No such object"));
        }
        state.stats.deletes += 1;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.directory.state().stats.closes += 1;
        }
    }
}

fn to_stored(entry: &NewEntry) -> DirectoryEntry {
    DirectoryEntry {
        dn: entry.dn.clone(),
        attrs: entry.attributes.iter().cloned().collect(),
    }
}

fn project(entry: &DirectoryEntry, attributes: &[String]) -> DirectoryEntry {
    if attributes.is_empty() {
        return entry.clone();
    }
    DirectoryEntry {
        dn: entry.dn.clone(),
        attrs: entry
            .attrs
            .iter()
            .filter(|(name, _)| attributes.iter().any(|a| a.eq_ignore_ascii_case(name)))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect(),
    }
}

/// Parse `(a=b)` or `(&(a=b)(c=d))` into equality clauses with values unescaped.
fn parse_filter(filter: &str) -> DirectoryResult<Vec<(String, String)>> {
    let invalid = || DirectoryError::protocol("search", 87, format!("bad search filter {filter}"));

    let inner = filter
        .strip_prefix('(')
        .and_then(|f| f.strip_suffix(')'))
        .ok_or_else(invalid)?;

    let terms: Vec<&str> = match inner.strip_prefix('&') {
        Some(rest) => rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(invalid)?
            .split(")(")
            .collect(),
        None => vec![inner],
    };

    terms
        .into_iter()
        .map(|term| {
            let (attr, value) = term.split_once('=').ok_or_else(invalid)?;
            Ok((attr.to_string(), unescape(value).ok_or_else(invalid)?))
        })
        .collect()
}

fn unescape(value: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(value.len());
    let mut iter = value.bytes();
    while let Some(b) = iter.next() {
        if b == b'\\' {
            let hex = [iter.next()?, iter.next()?];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}
