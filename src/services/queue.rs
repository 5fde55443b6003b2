//! Asynchronous receipt processing queue.
//!
//! The scheduler owns the job list and drives each receipt image through
//! AI extraction with retry, timeout-with-user-choice, and offline OCR
//! fallback semantics. Up to `concurrent_limit` attempts have I/O in
//! flight at once; batches are drawn by priority rank and awaited as a
//! whole before the next draw. Every mutation is followed by a full
//! snapshot write and a synchronous observer notification.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::models::job::{JobPriority, JobStatus, QueueItem};
use crate::models::receipt::{ReceiptResult, ServiceId};
use crate::services::ai_parser::{self, ParseError};
use crate::services::heuristic;
use crate::services::persistence::SnapshotStore;
use crate::services::providers::ReceiptProviders;

/// Resolution of the timeout dialog: keep waiting on the in-flight AI
/// call, or abandon it and go straight to the offline fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutChoice {
    ContinueWaiting,
    SwitchToOffline,
}

/// Human-in-the-loop hook called when an AI attempt hits its first
/// timeout. Receives `(job_id, seconds_waited)`; invoked at most once per
/// attempt and never blocks another job's progress.
pub type TimeoutHandler = Arc<
    dyn Fn(Uuid, u64) -> Pin<Box<dyn Future<Output = TimeoutChoice> + Send>> + Send + Sync,
>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn() + Send + Sync>;

/// The persisted snapshot document: the whole job list, dates as ISO-8601.
#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    items: Vec<QueueItem>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {0} is not in a failed state")]
    NotRetryable(Uuid),
}

/// Why a single AI attempt failed. Feeds the retry/fallback decision and
/// the terminal error message.
#[derive(Debug, thiserror::Error)]
enum AttemptFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("AI request timed out after {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("user chose offline processing")]
    SwitchedOffline,

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Register metric descriptions with the installed recorder, if any.
///
/// Invoked by [`ReceiptQueue::new`]; callers that install a recorder after
/// constructing the queue can call it again themselves. A no-op without a
/// recorder, safe to repeat.
pub fn describe_metrics() {
    metrics::describe_counter!("receipt_jobs_total", "Total receipt jobs submitted");
    metrics::describe_counter!("receipt_jobs_completed", "Total receipt jobs completed");
    metrics::describe_counter!("receipt_jobs_failed", "Total receipt jobs that failed terminally");
    metrics::describe_counter!("receipt_jobs_retried", "Total AI attempts requeued for retry");
    metrics::describe_counter!(
        "receipt_jobs_fallback_total",
        "Total jobs routed through the offline OCR fallback"
    );
    metrics::describe_histogram!(
        "receipt_attempt_seconds",
        "Duration of a successful AI extraction attempt"
    );
}

/// The receipt processing queue scheduler.
pub struct ReceiptQueue {
    config: QueueConfig,
    providers: Arc<dyn ReceiptProviders>,
    store: Arc<dyn SnapshotStore>,
    items: Mutex<Vec<QueueItem>>,
    is_processing: AtomicBool,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    timeout_handler: Mutex<Option<TimeoutHandler>>,
}

impl ReceiptQueue {
    pub fn new(
        config: QueueConfig,
        providers: Arc<dyn ReceiptProviders>,
        store: Arc<dyn SnapshotStore>,
    ) -> Arc<Self> {
        describe_metrics();
        Arc::new(Self {
            config,
            providers,
            store,
            items: Mutex::new(Vec::new()),
            is_processing: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            timeout_handler: Mutex::new(None),
        })
    }

    /// Hydrate queue state from the durable snapshot.
    ///
    /// Any job found `processing` is coerced back to `pending`: an
    /// interrupted attempt is indistinguishable from a crash and must not
    /// be left stuck. Corrupt or missing state degrades to an empty queue.
    /// The corrected snapshot is persisted before this returns.
    pub async fn initialize(self: &Arc<Self>) {
        let loaded = match self.store.load(&self.config.snapshot_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<QueueSnapshot>(&raw) {
                Ok(snapshot) => snapshot.items,
                Err(e) => {
                    tracing::warn!(error = %e, "Stored queue snapshot is corrupt, starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load queue snapshot, starting empty");
                Vec::new()
            }
        };

        let mut recovered = 0;
        {
            let mut items = self.items.lock().unwrap();
            *items = loaded;
            for job in items.iter_mut() {
                if job.status == JobStatus::Processing {
                    job.status = JobStatus::Pending;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Reset interrupted jobs to pending");
        }

        self.persist_and_notify().await;
        self.ensure_processing();
    }

    /// Enqueue a receipt image. Starts the processing loop if idle.
    pub async fn add_item(
        self: &Arc<Self>,
        image_uri: impl Into<String>,
        service_id: ServiceId,
        priority: JobPriority,
    ) -> Uuid {
        let job = QueueItem::new(image_uri, service_id, priority);
        let id = job.id;

        tracing::info!(job_id = %id, service = %service_id, ?priority, "Receipt queued");
        metrics::counter!("receipt_jobs_total").increment(1);

        self.items.lock().unwrap().push(job);
        self.persist_and_notify().await;
        self.ensure_processing();
        id
    }

    pub fn get_item(&self, id: Uuid) -> Option<QueueItem> {
        self.items.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }

    pub fn get_all_items(&self) -> Vec<QueueItem> {
        self.items.lock().unwrap().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.count_by_status(JobStatus::Pending)
    }

    pub fn completed_count(&self) -> usize {
        self.count_by_status(JobStatus::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count_by_status(JobStatus::Failed)
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.items
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == status)
            .count()
    }

    /// True while the scheduling loop is drawing batches.
    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    /// Drop a job unconditionally. Returns whether it was present.
    pub async fn remove_item(&self, id: Uuid) -> bool {
        let removed = {
            let mut items = self.items.lock().unwrap();
            let before = items.len();
            items.retain(|j| j.id != id);
            items.len() < before
        };
        if removed {
            tracing::info!(job_id = %id, "Job removed");
            self.persist_and_notify().await;
        }
        removed
    }

    /// Drop every completed job. Returns how many were removed.
    pub async fn clear_completed(&self) -> usize {
        let removed = {
            let mut items = self.items.lock().unwrap();
            let before = items.len();
            items.retain(|j| j.status != JobStatus::Completed);
            before - items.len()
        };
        if removed > 0 {
            tracing::info!(removed, "Cleared completed jobs");
        }
        self.persist_and_notify().await;
        removed
    }

    /// Manually retry a failed job with a fresh attempt budget.
    pub async fn retry_item(self: &Arc<Self>, id: Uuid) -> Result<(), QueueError> {
        {
            let mut items = self.items.lock().unwrap();
            let job = items
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or(QueueError::NotFound(id))?;
            if job.status != JobStatus::Failed {
                return Err(QueueError::NotRetryable(id));
            }
            job.status = JobStatus::Pending;
            job.retry_count = 0;
            job.error = None;
            // A fresh manual attempt gets the full budget again.
            job.timeout_extended = false;
            job.switch_to_offline = false;
        }
        tracing::info!(job_id = %id, "Manual retry requested");
        self.persist_and_notify().await;
        self.ensure_processing();
        Ok(())
    }

    /// Register an observer. Listeners are invoked synchronously, in
    /// subscription order, once per mutation, with no payload; they re-read
    /// state through `get_all_items` / `get_item`.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    /// Remove an observer. Idempotent; other listeners are unaffected.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id.0);
    }

    /// Install the timeout dialog hook.
    pub fn set_timeout_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Uuid, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TimeoutChoice> + Send + 'static,
    {
        *self.timeout_handler.lock().unwrap() =
            Some(Arc::new(move |id, secs| Box::pin(handler(id, secs))));
    }

    /// Block until the scheduling loop goes idle and no eligible work
    /// remains. Test/UI convenience.
    pub async fn wait_until_idle(&self) {
        while self.is_processing() || self.has_eligible_pending() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ── Scheduling loop ──────────────────────────────────────────────

    fn ensure_processing(self: &Arc<Self>) {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.run_loop().await });
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let batch = self.draw_batch();
            if batch.is_empty() {
                self.is_processing.store(false, Ordering::SeqCst);
                // An item may have arrived between the draw and the flag
                // going down; reclaim the loop if so.
                if self.has_eligible_pending()
                    && self
                        .is_processing
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                break;
            }

            let mut tasks = JoinSet::new();
            for id in batch {
                let queue = Arc::clone(&self);
                tasks.spawn(async move { queue.process_item(id).await });
            }
            // Batch members may complete in any order; the next batch is
            // drawn only once the whole batch has settled.
            while tasks.join_next().await.is_some() {}
        }
    }

    fn has_eligible_pending(&self) -> bool {
        self.items.lock().unwrap().iter().any(|j| j.is_eligible())
    }

    /// Select up to `concurrent_limit` pending jobs by priority rank,
    /// stable with respect to arrival order within equal rank.
    fn draw_batch(&self) -> Vec<Uuid> {
        let items = self.items.lock().unwrap();
        let mut eligible: Vec<(u8, Uuid)> = items
            .iter()
            .filter(|j| j.is_eligible())
            .map(|j| (j.priority.rank(), j.id))
            .collect();
        eligible.sort_by_key(|(rank, _)| *rank);
        eligible
            .into_iter()
            .take(self.config.concurrent_limit)
            .map(|(_, id)| id)
            .collect()
    }

    // ── Single job attempt ───────────────────────────────────────────

    async fn process_item(self: &Arc<Self>, id: Uuid) {
        let Some((image_uri, service_id)) = ({
            let mut items = self.items.lock().unwrap();
            items.iter_mut().find(|j| j.id == id).and_then(|job| {
                if job.status != JobStatus::Pending {
                    return None;
                }
                job.status = JobStatus::Processing;
                job.started_processing_at = Some(Utc::now());
                Some((job.image_uri.clone(), job.service_id))
            })
        }) else {
            // Removed or already handled; nothing to do.
            return;
        };
        self.persist_and_notify().await;

        tracing::info!(job_id = %id, service = %service_id, "Processing receipt");
        let attempt_started = Instant::now();

        match self.run_ai_attempt(id, &image_uri, service_id).await {
            Ok(result) => {
                metrics::histogram!("receipt_attempt_seconds")
                    .record(attempt_started.elapsed().as_secs_f64());
                metrics::counter!("receipt_jobs_completed").increment(1);
                tracing::info!(
                    job_id = %id,
                    confidence = result.confidence,
                    "AI extraction completed"
                );
                self.complete_job(id, result, None);
            }
            Err(failure) => {
                tracing::warn!(job_id = %id, error = %failure, "AI attempt failed");
                let fallback = {
                    let mut items = self.items.lock().unwrap();
                    match items.iter_mut().find(|j| j.id == id) {
                        None => None,
                        Some(job) => {
                            job.retry_count += 1;
                            if job.switch_to_offline || job.retry_count >= job.max_retries {
                                Some(job.retry_count)
                            } else {
                                // Requeue behind fresh and immediate work.
                                job.status = JobStatus::Pending;
                                job.priority = JobPriority::Retry;
                                metrics::counter!("receipt_jobs_retried").increment(1);
                                tracing::info!(
                                    job_id = %id,
                                    retry_count = job.retry_count,
                                    "Job requeued for retry"
                                );
                                None
                            }
                        }
                    }
                };
                if let Some(attempts) = fallback {
                    self.run_fallback(id, &image_uri, attempts, &failure).await;
                }
            }
        }

        // Every branch ends with a snapshot write and a notification.
        self.persist_and_notify().await;
    }

    /// One AI attempt: preprocess + vendor call raced against the timeout,
    /// then parse/validate the raw reply.
    ///
    /// The call is spawned as a detached task; abandoning it (second
    /// timeout, or the offline choice) leaves it running and its late
    /// result is discarded.
    async fn run_ai_attempt(
        self: &Arc<Self>,
        id: Uuid,
        image_uri: &str,
        service_id: ServiceId,
    ) -> Result<ReceiptResult, AttemptFailure> {
        let attempt_started = Instant::now();

        let providers = Arc::clone(&self.providers);
        let uri = image_uri.to_string();
        let mut call = tokio::spawn(async move {
            let image = providers.preprocess_image(&uri).await?;
            providers.call_ai_service(service_id, &image.base64).await
        });

        let initial = Duration::from_secs(self.config.ai_timeout_secs);
        let raw = match timeout(initial, &mut call).await {
            Ok(joined) => Self::unwrap_call(joined)?,
            Err(_) => {
                let handler = self.timeout_handler.lock().unwrap().clone();
                match handler {
                    // No dialog registered: a bare timeout is an ordinary
                    // network-class failure.
                    None => {
                        return Err(AttemptFailure::Timeout {
                            waited_secs: self.config.ai_timeout_secs,
                        })
                    }
                    Some(handler) => {
                        let choice = handler(id, self.config.ai_timeout_secs).await;
                        match choice {
                            TimeoutChoice::SwitchToOffline => {
                                self.mark_flag(id, |job| job.switch_to_offline = true).await;
                                return Err(AttemptFailure::SwitchedOffline);
                            }
                            TimeoutChoice::ContinueWaiting => {
                                self.mark_flag(id, |job| job.timeout_extended = true).await;
                                let extension =
                                    Duration::from_secs(self.config.ai_timeout_extension_secs);
                                match timeout(extension, &mut call).await {
                                    Ok(joined) => Self::unwrap_call(joined)?,
                                    Err(_) => {
                                        return Err(AttemptFailure::Timeout {
                                            waited_secs: self.config.ai_timeout_secs
                                                + self.config.ai_timeout_extension_secs,
                                        })
                                    }
                                }
                            }
                        }
                    }
                }
            }
        };

        let elapsed_ms = attempt_started.elapsed().as_millis() as u64;
        Ok(ai_parser::parse_and_validate(&raw, elapsed_ms)?)
    }

    fn unwrap_call(
        joined: Result<Result<String, crate::services::providers::ProviderError>, tokio::task::JoinError>,
    ) -> Result<String, AttemptFailure> {
        match joined {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e)) => Err(AttemptFailure::Network(e.to_string())),
            Err(e) => Err(AttemptFailure::Network(format!("AI task aborted: {e}"))),
        }
    }

    /// Offline fallback: on-device OCR plus heuristic extraction. Runs
    /// when the retry budget is exhausted or the user explicitly chose
    /// offline.
    async fn run_fallback(
        self: &Arc<Self>,
        id: Uuid,
        image_uri: &str,
        ai_attempts: u32,
        ai_failure: &AttemptFailure,
    ) {
        tracing::info!(job_id = %id, ai_attempts, "Falling back to offline OCR");
        metrics::counter!("receipt_jobs_fallback_total").increment(1);
        let fallback_started = Instant::now();

        match self.providers.recognize_text_offline(image_uri).await {
            Ok(ocr) => {
                let elapsed_ms = fallback_started.elapsed().as_millis() as u64;
                let result = heuristic::extract(&ocr, elapsed_ms);
                metrics::counter!("receipt_jobs_completed").increment(1);
                tracing::info!(
                    job_id = %id,
                    confidence = result.confidence,
                    "Offline extraction completed"
                );
                // Rewrite provenance so consumers can tell AI from OCR.
                self.complete_job(id, result, Some(ServiceId::Ocr));
            }
            Err(ocr_error) => {
                let message = format!(
                    "AI processing failed after {ai_attempts} attempt(s) ({ai_failure}) and \
                     offline OCR processing also failed ({ocr_error}). Manual entry required."
                );
                metrics::counter!("receipt_jobs_failed").increment(1);
                tracing::error!(job_id = %id, error = %message, "Job failed terminally");
                let mut items = self.items.lock().unwrap();
                if let Some(job) = items.iter_mut().find(|j| j.id == id) {
                    job.status = JobStatus::Failed;
                    job.error = Some(message);
                    job.result = None;
                    job.processed_at = Some(Utc::now());
                }
            }
        }
    }

    fn complete_job(&self, id: Uuid, result: ReceiptResult, provenance: Option<ServiceId>) {
        let mut items = self.items.lock().unwrap();
        if let Some(job) = items.iter_mut().find(|j| j.id == id) {
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.error = None;
            job.processed_at = Some(Utc::now());
            if let Some(service) = provenance {
                job.service_id = service;
            }
        }
    }

    /// Flip a per-job flag mid-attempt, with the usual persist + notify.
    async fn mark_flag(&self, id: Uuid, apply: impl FnOnce(&mut QueueItem)) {
        {
            let mut items = self.items.lock().unwrap();
            if let Some(job) = items.iter_mut().find(|j| j.id == id) {
                apply(job);
            }
        }
        self.persist_and_notify().await;
    }

    // ── Persistence + observation ────────────────────────────────────

    async fn persist_and_notify(&self) {
        let snapshot = {
            let items = self.items.lock().unwrap();
            serde_json::to_string(&QueueSnapshot {
                items: items.clone(),
            })
        };
        match snapshot {
            Ok(json) => {
                if let Err(e) = self.store.save(&self.config.snapshot_key, &json).await {
                    tracing::warn!(error = %e, "Failed to persist queue snapshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize queue snapshot"),
        }

        let listeners: Vec<Listener> = {
            let guard = self.listeners.lock().unwrap();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener();
        }
    }
}
