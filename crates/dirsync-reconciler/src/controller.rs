//! Reconcile Controller
//!
//! Turns the notification stream into reconcile passes:
//! - notifications already processed at their generation are dropped
//! - passes for different identities run concurrently, up to a limit
//! - an identity has at most one pass in flight; later notifications are
//!   coalesced and run once that pass finishes
//! - each pass is bounded by a deadline
//! - retryable failures are re-delivered with exponential backoff

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dirsync_connector::retry::RetryConfig;
use dirsync_ldap::AccountDirectory;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::filter::{GenerationFilter, Notification};
use crate::reconciler::{ReconcileAction, Reconciler};
use crate::resource::{ManagedResource, ResourceKey};
use crate::store::{ListSelector, ResourceStore, StoreError};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of passes allowed to run at once.
    pub concurrency: usize,

    /// Upper bound for a single pass.
    pub reconcile_timeout: Duration,

    /// Backoff for re-delivered passes.
    pub retry: RetryConfig,

    /// Namespace to resync; `None` covers all.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            reconcile_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            namespace: None,
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Dispatches reconcile passes for records of one kind.
pub struct Controller<R> {
    reconciler: Arc<Reconciler<R>>,
    store: Arc<dyn ResourceStore<R>>,
    config: ControllerConfig,
    shutdown: CancellationToken,
}

impl<R: ManagedResource> Controller<R> {
    pub fn new(
        store: Arc<dyn ResourceStore<R>>,
        directory: Arc<dyn AccountDirectory>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(Arc::clone(&store), directory)),
            store,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelling [`run`](Self::run) when triggered.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!(kind = R::KIND, "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Queue one notification per stored record.
    ///
    /// Returns the number of records listed.
    #[instrument(skip(self, notifications), fields(kind = R::KIND))]
    pub async fn resync(
        &self,
        notifications: &mpsc::Sender<Notification>,
    ) -> Result<usize, StoreError> {
        let selector = match &self.config.namespace {
            Some(ns) => ListSelector::in_namespace(ns.clone()),
            None => ListSelector::all(),
        };
        let records = self.store.list(&selector).await?;

        for record in &records {
            if notifications
                .send(Notification::for_record(record))
                .await
                .is_err()
            {
                warn!("Notification channel closed during resync");
                break;
            }
        }

        info!(count = records.len(), "Resync queued");
        Ok(records.len())
    }

    /// Process notifications until shutdown or until the stream ends.
    ///
    /// Passes already running are allowed to finish; pending retries are dropped.
    #[instrument(skip(self, notifications), fields(kind = R::KIND))]
    pub async fn run(&self, mut notifications: mpsc::Receiver<Notification>) {
        info!(
            concurrency = self.config.concurrency,
            timeout_secs = self.config.reconcile_timeout.as_secs(),
            "Starting controller"
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel();
        let mut dispatch = Dispatch {
            reconciler: Arc::clone(&self.reconciler),
            semaphore: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            done: done_tx,
            requeue: requeue_tx,
            filter: GenerationFilter::new(),
            in_flight: HashSet::new(),
            pending: HashMap::new(),
            attempts: HashMap::new(),
        };

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Controller shutdown requested, stopping dispatch");
                    break;
                }
                received = notifications.recv() => match received {
                    Some(notification) => dispatch.submit(notification, false),
                    None => {
                        info!("Notification stream closed");
                        break;
                    }
                },
                Some(completion) = done_rx.recv() => dispatch.complete(completion),
                Some(notification) = requeue_rx.recv() => dispatch.submit(notification, true),
            }
        }

        info!(in_flight = dispatch.in_flight.len(), "Waiting for in-flight passes to complete...");
        while !dispatch.in_flight.is_empty() {
            match done_rx.recv().await {
                Some(completion) => {
                    dispatch.in_flight.remove(&completion.key);
                }
                None => break,
            }
        }
        info!("Controller stopped");
    }
}

struct Completion {
    key: ResourceKey,
    generation: i64,
    /// `None` when shutdown arrived before the pass got a permit.
    result: Option<ReconcileResult<ReconcileAction>>,
}

/// Dispatch bookkeeping owned by the run loop.
struct Dispatch<R> {
    reconciler: Arc<Reconciler<R>>,
    semaphore: Arc<Semaphore>,
    config: ControllerConfig,
    shutdown: CancellationToken,
    done: mpsc::UnboundedSender<Completion>,
    requeue: mpsc::UnboundedSender<Notification>,
    filter: GenerationFilter,
    in_flight: HashSet<ResourceKey>,
    /// Coalesced notification per busy identity; the flag bypasses the filter.
    pending: HashMap<ResourceKey, (Notification, bool)>,
    attempts: HashMap<ResourceKey, u32>,
}

impl<R: ManagedResource> Dispatch<R> {
    /// `forced` notifications are retries and skip the generation filter.
    fn submit(&mut self, notification: Notification, forced: bool) {
        if !forced && !self.filter.admit(&notification) {
            debug!(
                key = %notification.key,
                generation = notification.generation,
                observed = ?self.filter.observed(&notification.key),
                "Generation already processed, skipping"
            );
            return;
        }

        if self.in_flight.contains(&notification.key) {
            debug!(key = %notification.key, "Pass in flight, coalescing notification");
            self.pending
                .entry(notification.key.clone())
                .and_modify(|(queued, queued_forced)| {
                    queued.generation = queued.generation.max(notification.generation);
                    queued.deletion_requested |= notification.deletion_requested;
                    *queued_forced |= forced;
                })
                .or_insert((notification, forced));
            return;
        }

        self.spawn_pass(notification);
    }

    fn spawn_pass(&mut self, notification: Notification) {
        self.in_flight.insert(notification.key.clone());

        let reconciler = Arc::clone(&self.reconciler);
        let semaphore = Arc::clone(&self.semaphore);
        let done = self.done.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.config.reconcile_timeout;

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = if shutdown.is_cancelled() {
                debug!(key = %notification.key, "Shutdown requested, pass skipped");
                None
            } else {
                Some(run_pass(&reconciler, &notification.key, timeout).await)
            };
            let _ = done.send(Completion {
                key: notification.key,
                generation: notification.generation,
                result,
            });
        });
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            key,
            generation,
            result,
        } = completion;
        self.in_flight.remove(&key);

        let Some(result) = result else {
            return;
        };

        match result {
            Ok(ReconcileAction::Done) => {
                self.filter.observe(&key, generation);
                self.attempts.remove(&key);
                debug!(key = %key, generation, "Reconcile succeeded");
            }
            Ok(ReconcileAction::Removed) => {
                self.filter.forget(&key);
                self.attempts.remove(&key);
                debug!(key = %key, "Identity removed");
            }
            Err(e) if e.is_retryable() => self.schedule_retry(key.clone(), generation, &e),
            Err(e) => {
                self.attempts.remove(&key);
                error!(
                    key = %key,
                    error = %e,
                    code = e.error_code(),
                    "Reconcile failed, waiting for the next change"
                );
            }
        }

        if let Some((next, forced)) = self.pending.remove(&key) {
            self.submit(next, forced);
        }
    }

    fn schedule_retry(&mut self, key: ResourceKey, generation: i64, error: &ReconcileError) {
        let attempt = self.attempts.entry(key.clone()).or_insert(0);
        let delay = self.config.retry.delay_for_attempt(*attempt);
        *attempt += 1;

        warn!(
            key = %key,
            error = %error,
            code = error.error_code(),
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconcile failed, requeueing"
        );

        let requeue = self.requeue.clone();
        let shutdown = self.shutdown.clone();
        let notification = Notification::new(key, generation);

        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = requeue.send(notification);
                }
            }
        });
    }
}

async fn run_pass<R: ManagedResource>(
    reconciler: &Reconciler<R>,
    key: &ResourceKey,
    timeout: Duration,
) -> ReconcileResult<ReconcileAction> {
    match tokio::time::timeout(timeout, reconciler.reconcile(key)).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::DeadlineExceeded {
            key: key.clone(),
            timeout,
        }),
    }
}
