//! Sync orchestrator: drains the offline queue through a transport.
//!
//! A drain pass attempts every queued operation in timestamp order,
//! independently of each other. Acknowledged operations are removed from the
//! queue; failed ones stay, together with anything queued while the pass was
//! running, and the next pass is pushed back by an exponential backoff.
//!
//! Status follows `Idle -> Syncing -> Success | Error -> Idle` and can be
//! observed through a `watch` channel.

use crate::config::SyncConfig;
use crate::events::{ActivitySource, EventBus, SessionActivity};
use crate::operation::{OfflineOperation, now_millis};
use crate::queue::{OperationQueue, QueueError};
use crate::retry::{Backoff, RetryDecision, RetryPolicy};
use crate::transport::{PushUpdateRequest, SyncTransport, TransportError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Observable state of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    #[serde(rename_all = "camelCase")]
    Success { synced: usize },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        failed: usize,
        /// Estimated wall-clock time of the next attempt (ms since epoch).
        retry_at_ms: u64,
    },
}

/// Why a drain call did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Disconnected,
    NoWorkspace,
    /// Another pass is still running.
    InFlight,
    BackingOff { remaining: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
    pub id: String,
    pub doc_id: String,
    pub error: TransportError,
}

/// Result of one completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedOperation>,
    /// Operations left in the queue after reconciliation.
    pub retained: usize,
    /// Backoff applied after a failed pass.
    pub retry_in: Option<Duration>,
}

impl DrainReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    /// Nothing was queued.
    Empty,
    Completed(DrainReport),
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator {
    queue: Arc<OperationQueue>,
    transport: Arc<dyn SyncTransport>,
    activity: Arc<EventBus<SessionActivity>>,
    config: SyncConfig,
    policy: RetryPolicy,
    enabled: AtomicBool,
    workspace_id: RwLock<Option<String>>,
    backoff: Mutex<Backoff>,
    in_flight: AtomicBool,
    last_skip_log: Mutex<Option<Instant>>,
    status: Arc<watch::Sender<SyncStatus>>,
    /// Bumped on every status change so stale reset timers do nothing.
    generation: Arc<AtomicU64>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<OperationQueue>,
        transport: Arc<dyn SyncTransport>,
        activity: Arc<EventBus<SessionActivity>>,
        config: SyncConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            queue,
            transport,
            activity,
            policy: RetryPolicy::from_config(&config),
            enabled: AtomicBool::new(config.enabled),
            workspace_id: RwLock::new(config.workspace_id.clone()),
            config,
            backoff: Mutex::new(Backoff::new()),
            in_flight: AtomicBool::new(false),
            last_skip_log: Mutex::new(None),
            status: Arc::new(status),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_workspace(&self, workspace_id: Option<String>) {
        *self.workspace_id.write().unwrap_or_else(|e| e.into_inner()) = workspace_id;
    }

    pub fn workspace_id(&self) -> Option<String> {
        self.workspace_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Consecutive failed passes, capped at the backoff exponent.
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).failures()
    }

    /// Time left in the current backoff window, if any.
    pub fn retry_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_retry_at()
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    fn set_status(&self, status: SyncStatus) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(status);
        generation
    }

    /// Revert to `Idle` after `delay` unless the status changed meanwhile.
    fn schedule_idle(&self, generation: u64, delay: Duration) {
        let status = Arc::clone(&self.status);
        let current = Arc::clone(&self.generation);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) == generation {
                status.send_replace(SyncStatus::Idle);
            }
        });
    }

    fn check_preconditions(&self) -> Option<SkipReason> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Some(SkipReason::Disabled);
        }
        if !self.transport.is_connected() {
            return Some(SkipReason::Disconnected);
        }
        if self.workspace_id().is_none() {
            return Some(SkipReason::NoWorkspace);
        }
        None
    }

    fn log_backoff_skip(&self, now: Instant, remaining: Duration) {
        let mut last = self.last_skip_log.lock().unwrap_or_else(|e| e.into_inner());
        let due = last.is_none_or(|at| now.duration_since(at) >= self.config.skip_log_interval);
        if due {
            info!("Sync backing off, next attempt in {:?}", remaining);
            *last = Some(now);
        }
    }

    /// Run one drain pass if the preconditions allow it.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if let Some(reason) = self.check_preconditions() {
            debug!("Skipping drain: {:?}", reason);
            return Ok(DrainOutcome::Skipped(reason));
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Skipping drain: pass already in flight");
            return Ok(DrainOutcome::Skipped(SkipReason::InFlight));
        };

        let now = Instant::now();
        let waiting = {
            let backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
            backoff
                .next_retry_at()
                .filter(|_| backoff.is_waiting(now))
                .map(|at| at - now)
        };
        if let Some(remaining) = waiting {
            self.log_backoff_skip(now, remaining);
            return Ok(DrainOutcome::Skipped(SkipReason::BackingOff { remaining }));
        }

        let ops = self.queue.list().await?;
        if ops.is_empty() {
            return Ok(DrainOutcome::Empty);
        }

        self.set_status(SyncStatus::Syncing);
        info!("Draining {} queued operations", ops.len());

        let mut succeeded = HashSet::new();
        let mut failed = Vec::new();
        for op in &ops {
            match self.attempt(op).await {
                Ok(()) => {
                    succeeded.insert(op.id.clone());
                }
                Err(error) => {
                    warn!("Failed to sync operation {} for {}: {}", op.id, op.doc_id, error);
                    failed.push(FailedOperation {
                        id: op.id.clone(),
                        doc_id: op.doc_id.clone(),
                        error,
                    });
                }
            }
        }

        let retained = match self.reconcile(&succeeded).await {
            Ok(retained) => retained,
            Err(e) => {
                self.fail_pass(succeeded.len(), &failed, Some(&e));
                return Err(e);
            }
        };

        let mut report = DrainReport {
            attempted: ops.len(),
            succeeded: succeeded.len(),
            failed,
            retained,
            retry_in: None,
        };

        if report.is_success() {
            self.backoff
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reset();
            let generation = self.set_status(SyncStatus::Success {
                synced: report.succeeded,
            });
            self.schedule_idle(generation, self.config.success_display_delay);
            info!("Synced {} operations", report.succeeded);
        } else {
            report.retry_in = Some(self.fail_pass(report.succeeded, &report.failed, None));
        }

        Ok(DrainOutcome::Completed(report))
    }

    /// Re-read the queue and delete the acknowledged operations.
    ///
    /// Whatever else is queued now (failed, unattempted, or added during the
    /// pass) stays. Returns the number of retained operations.
    async fn reconcile(&self, succeeded: &HashSet<String>) -> Result<usize> {
        let current = self.queue.list().await?;
        let acknowledged: Vec<String> = current
            .iter()
            .filter(|op| succeeded.contains(&op.id))
            .map(|op| op.id.clone())
            .collect();
        self.queue.delete_many(&acknowledged).await?;
        Ok(current.len() - acknowledged.len())
    }

    /// Record a failed pass: bump the backoff and publish `Error`.
    fn fail_pass(&self, succeeded: usize, failed: &[FailedOperation], extra: Option<&SyncError>) -> Duration {
        let delay = self
            .backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_failure(Instant::now(), &self.policy);

        let mut message = format!(
            "{} of {} operations failed to sync",
            failed.len(),
            failed.len() + succeeded
        );
        if let Some(first) = failed.first() {
            message.push_str(&format!(" ({}: {})", first.doc_id, first.error));
        }
        if let Some(e) = extra {
            message.push_str(&format!("; {e}"));
        }
        warn!("{}, retrying in {:?}", message, delay);

        let generation = self.set_status(SyncStatus::Error {
            message,
            failed: failed.len(),
            retry_at_ms: now_millis() + delay.as_millis() as u64,
        });
        self.schedule_idle(generation, delay);
        delay
    }

    /// Send one operation, retrying per the policy.
    async fn attempt(&self, op: &OfflineOperation) -> std::result::Result<(), TransportError> {
        self.activity.emit(SessionActivity {
            session_id: op.session_id.clone(),
            client_id: op.client_id.clone(),
            source: ActivitySource::SyncAttempt,
        });

        let request = PushUpdateRequest::from(op);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(
                self.config.request_timeout,
                self.transport.push_update(request.clone()),
            )
            .await
            {
                Ok(Ok(ack)) => ack.into_result(),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TransportError::Timeout),
            };

            let Err(error) = result else {
                debug!("Synced operation {} for {}", op.id, op.doc_id);
                return Ok(());
            };
            match self.policy.decide(attempt, &error) {
                RetryDecision::Retry(delay) => {
                    debug!("Attempt {} for {} failed ({}), retrying", attempt, op.id, error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::events::EventLog;
    use crate::operation::SpaceType;
    use crate::storage::MemoryBackend;
    use crate::transport::{MockFailure, MockTransport};

    struct Harness {
        queue: Arc<OperationQueue>,
        transport: Arc<MockTransport>,
        orchestrator: Arc<SyncOrchestrator>,
        activity: EventLog<SessionActivity>,
    }

    fn harness(config: SyncConfig) -> Harness {
        let queue = Arc::new(OperationQueue::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::named("fallback")),
            QueueConfig::default(),
            Arc::new(EventBus::new()),
        ));
        let transport = Arc::new(MockTransport::new());
        let bus = Arc::new(EventBus::new());
        let activity = EventLog::attach(&bus);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&queue),
            transport.clone(),
            bus,
            config,
        ));
        Harness {
            queue,
            transport,
            orchestrator,
            activity,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default().with_workspace("ws")
    }

    fn op(doc_id: &str) -> OfflineOperation {
        OfflineOperation::new(SpaceType::Workspace, "ws", doc_id, vec![1], "s1", Some("c1")).unwrap()
    }

    async fn queue_ops(h: &Harness, docs: &[&str]) -> Vec<OfflineOperation> {
        let mut ops = Vec::new();
        for doc in docs {
            let o = op(doc);
            h.queue.save(o.clone()).await.unwrap();
            ops.push(o);
        }
        ops
    }

    fn report(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_success_empties_queue() {
        let h = harness(config());
        queue_ops(&h, &["a", "b", "a"]).await;

        let report = report(h.orchestrator.drain().await.unwrap());
        assert!(report.is_success());
        assert_eq!(report.succeeded, 3);
        assert!(h.queue.list().await.unwrap().is_empty());
        assert_eq!(h.transport.request_count(), 3);
        assert_eq!(h.orchestrator.status(), SyncStatus::Success { synced: 3 });

        let activity = h.activity.events();
        assert_eq!(activity.len(), 3);
        assert!(activity.iter().all(|a| a.source == ActivitySource::SyncAttempt
            && a.session_id == "s1"
            && a.client_id.as_deref() == Some("c1")));

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(h.orchestrator.status(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_sent_in_timestamp_order() {
        let h = harness(config());
        let ops = queue_ops(&h, &["a", "b", "a", "c"]).await;
        h.orchestrator.drain().await.unwrap();

        let sent: Vec<_> = h.transport.requests().into_iter().map(|r| r.doc_id).collect();
        let expected: Vec<_> = ops.into_iter().map(|o| o.doc_id).collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_keeps_failed_and_new_operations() {
        let h = harness(config());
        let ops = queue_ops(&h, &["ok-1", "bad", "ok-2"]).await;
        h.transport.fail_doc("bad", MockFailure::Reject("denied".into()));
        h.transport.set_delay(Some(Duration::from_millis(100)));

        let orchestrator = Arc::clone(&h.orchestrator);
        let pass = tokio::spawn(async move { orchestrator.drain().await });

        // Queued while the pass is running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.orchestrator.is_in_flight());
        let late = op("late");
        h.queue.save(late.clone()).await.unwrap();

        let report = report(pass.await.unwrap().unwrap());
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, ops[1].id);
        assert_eq!(report.retained, 2);

        let remaining: Vec<_> = h.queue.list().await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(remaining, vec![ops[1].id.clone(), late.id]);

        match h.orchestrator.status() {
            SyncStatus::Error { failed, message, .. } => {
                assert_eq!(failed, 1);
                assert!(message.contains("1 of 3"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_windows_are_non_decreasing() {
        let h = harness(config().with_backoff(Duration::from_millis(100), Duration::from_secs(1)));
        queue_ops(&h, &["bad"]).await;
        h.transport.fail_doc("bad", MockFailure::Reject("denied".into()));

        let mut previous = Duration::ZERO;
        for _ in 0..6 {
            let report = report(h.orchestrator.drain().await.unwrap());
            let window = report.retry_in.unwrap();
            assert!(window >= previous);
            assert!(window <= Duration::from_secs(1));
            previous = window;

            assert!(matches!(
                h.orchestrator.drain().await.unwrap(),
                DrainOutcome::Skipped(SkipReason::BackingOff { .. })
            ));
            tokio::time::sleep(window).await;
        }
        assert_eq!(previous, Duration::from_secs(1));

        // Recovery resets the counter.
        h.transport.heal_doc("bad");
        assert!(report(h.orchestrator.drain().await.unwrap()).is_success());
        assert_eq!(h.orchestrator.consecutive_failures(), 0);
        assert_eq!(h.orchestrator.retry_in(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trigger_while_in_flight_is_suppressed() {
        let h = harness(config());
        queue_ops(&h, &["a"]).await;
        h.transport.set_delay(Some(Duration::from_secs(1)));

        let orchestrator = Arc::clone(&h.orchestrator);
        let pass = tokio::spawn(async move { orchestrator.drain().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            h.orchestrator.drain().await.unwrap(),
            DrainOutcome::Skipped(SkipReason::InFlight)
        );
        assert_eq!(h.orchestrator.status(), SyncStatus::Syncing);

        assert!(report(pass.await.unwrap().unwrap()).is_success());
        assert!(!h.orchestrator.is_in_flight());
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preconditions_skip_without_side_effects() {
        let h = harness(SyncConfig::default());
        queue_ops(&h, &["a"]).await;

        assert_eq!(
            h.orchestrator.drain().await.unwrap(),
            DrainOutcome::Skipped(SkipReason::NoWorkspace)
        );

        h.orchestrator.set_workspace(Some("ws".into()));
        h.transport.set_connected(false);
        assert_eq!(
            h.orchestrator.drain().await.unwrap(),
            DrainOutcome::Skipped(SkipReason::Disconnected)
        );

        h.transport.set_connected(true);
        h.orchestrator.set_enabled(false);
        assert_eq!(
            h.orchestrator.drain().await.unwrap(),
            DrainOutcome::Skipped(SkipReason::Disabled)
        );

        assert_eq!(h.transport.request_count(), 0);
        assert_eq!(h.queue.list().await.unwrap().len(), 1);
        assert_eq!(h.orchestrator.status(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried_then_counted_as_failures() {
        let h = harness(
            config()
                .with_request_timeout(Duration::from_millis(100))
                .with_request_attempts(2),
        );
        queue_ops(&h, &["slow"]).await;
        h.transport.fail_doc("slow", MockFailure::Hang);

        let report = report(h.orchestrator.drain().await.unwrap());
        assert_eq!(report.failed[0].error, TransportError::Timeout);
        assert_eq!(h.transport.request_count(), 2);
        assert_eq!(h.queue.list().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_is_a_no_op() {
        let h = harness(config());
        assert_eq!(h.orchestrator.drain().await.unwrap(), DrainOutcome::Empty);
        assert_eq!(h.orchestrator.status(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_returns_to_idle_after_backoff_window() {
        let h = harness(config().with_backoff(Duration::from_secs(1), Duration::from_secs(60)));
        queue_ops(&h, &["bad"]).await;
        h.transport.fail_doc("bad", MockFailure::Reject("denied".into()));

        let window = report(h.orchestrator.drain().await.unwrap()).retry_in.unwrap();
        assert!(matches!(h.orchestrator.status(), SyncStatus::Error { .. }));

        tokio::time::sleep(window - Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(matches!(h.orchestrator.status(), SyncStatus::Error { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(h.orchestrator.status(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_idle_reset_leaves_newer_status() {
        let h = harness(
            config()
                .with_backoff(Duration::from_secs(1), Duration::from_secs(60))
                .with_success_display_delay(Duration::from_secs(2)),
        );
        queue_ops(&h, &["a"]).await;
        assert!(report(h.orchestrator.drain().await.unwrap()).is_success());

        // A failed pass lands before the success reset fires.
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue_ops(&h, &["bad"]).await;
        h.transport.fail_doc("bad", MockFailure::Reject("denied".into()));
        let window = report(h.orchestrator.drain().await.unwrap()).retry_in.unwrap();
        assert!(window > Duration::from_secs(1));

        // Past the success reset, still inside the backoff window.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;
        assert!(matches!(h.orchestrator.status(), SyncStatus::Error { .. }));

        tokio::time::sleep(window).await;
        tokio::task::yield_now().await;
        assert_eq!(h.orchestrator.status(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_channel_reports_transitions() {
        let h = harness(config());
        queue_ops(&h, &["a"]).await;
        let mut rx = h.orchestrator.subscribe();

        h.orchestrator.drain().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SyncStatus::Success { synced: 1 });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SyncStatus::Idle);
    }
}
