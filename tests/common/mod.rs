// Common test utilities and fixtures

use async_trait::async_trait;
use print_queue_relay::config::QueueTimings;
use print_queue_relay::dispatcher::{DispatchResult, PrintDispatcher};
use print_queue_relay::errors::{DaemonError, Result};
use print_queue_relay::events::{EventBus, QueueEvent, QueueState, TickStatus};
use print_queue_relay::orchestrator::QueueOrchestrator;
use print_queue_relay::remote::{RemoteJob, RemoteJobId, RemoteQueueClient};
use print_queue_relay::spooler::{PrinterInfo, SpoolEntry, SpoolerProbe};
use print_queue_relay::status::CanonicalStatus;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Short intervals so flows finish in milliseconds
#[allow(dead_code)]
pub fn fast_timings() -> QueueTimings {
    QueueTimings {
        idle_poll_ms: 20,
        watch_poll_ms: 10,
        dispatch_race_ms: 200,
        settle_delay_ms: 10,
        discovery_attempts: 3,
        discovery_delay_ms: 10,
        api_timeout_ms: 1_000,
        os_query_timeout_ms: 1_000,
    }
}

#[allow(dead_code)]
pub fn job(url: &str, id: i64) -> RemoteJob {
    RemoteJob {
        url: url.to_string(),
        id: Some(RemoteJobId::Number(id)),
        filename: None,
    }
}

/// In-memory spooler for one printer
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct FakeSpooler {
    pub jobs: Arc<RwLock<Vec<SpoolEntry>>>,
    /// Every `latest` query fails while set
    pub latest_fails: Arc<RwLock<bool>>,
    /// Number of upcoming `latest` queries that fail
    pub latest_failures: Arc<RwLock<u32>>,
    /// Entry reported by the next `latest` only, never by `by_id`
    pub glimpse: Arc<RwLock<Option<SpoolEntry>>>,
    /// Number of upcoming `by_id` queries that fail
    pub by_id_failures: Arc<RwLock<u32>>,
    pub queries: Arc<RwLock<u32>>,
}

#[allow(dead_code)]
impl FakeSpooler {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(id: u32, raw_status: &str) -> SpoolEntry {
        SpoolEntry {
            id,
            document: format!("doc-{}.pdf", id),
            owner: "relay".to_string(),
            raw_status: raw_status.to_string(),
            pages_printed: 0,
            total_pages: 1,
        }
    }

    pub async fn add_job(&self, id: u32, raw_status: &str) {
        self.jobs.write().await.push(Self::entry(id, raw_status));
    }

    /// A job the spooler lists once and has already finished by the next query
    pub async fn glimpse_job(&self, id: u32, raw_status: &str) {
        *self.glimpse.write().await = Some(Self::entry(id, raw_status));
    }

    pub async fn set_status(&self, id: u32, raw_status: &str) {
        if let Some(entry) = self.jobs.write().await.iter_mut().find(|e| e.id == id) {
            entry.raw_status = raw_status.to_string();
        }
    }

    pub async fn remove_job(&self, id: u32) {
        self.jobs.write().await.retain(|e| e.id != id);
    }

    pub async fn set_latest_fails(&self, fail: bool) {
        *self.latest_fails.write().await = fail;
    }

    pub async fn fail_next_latest(&self, count: u32) {
        *self.latest_failures.write().await = count;
    }

    pub async fn fail_next_by_id(&self, count: u32) {
        *self.by_id_failures.write().await = count;
    }

    pub async fn query_count(&self) -> u32 {
        *self.queries.read().await
    }
}

#[async_trait]
impl SpoolerProbe for FakeSpooler {
    async fn latest(&self, _printer_name: &str) -> Result<Option<SpoolEntry>> {
        *self.queries.write().await += 1;
        if *self.latest_fails.read().await {
            return Err(DaemonError::Spooler("simulated query failure".to_string()));
        }
        {
            let mut failures = self.latest_failures.write().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(DaemonError::Spooler("simulated query failure".to_string()));
            }
        }
        if let Some(entry) = self.glimpse.write().await.take() {
            return Ok(Some(entry));
        }
        Ok(self.jobs.read().await.iter().max_by_key(|e| e.id).cloned())
    }

    async fn by_id(&self, _printer_name: &str, job_id: u32) -> Result<Option<SpoolEntry>> {
        *self.queries.write().await += 1;
        {
            let mut failures = self.by_id_failures.write().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(DaemonError::Spooler("simulated query failure".to_string()));
            }
        }
        Ok(self.jobs.read().await.iter().find(|e| e.id == job_id).cloned())
    }

    async fn printers(&self) -> Result<Vec<PrinterInfo>> {
        Ok(vec![PrinterInfo {
            name: "Office".to_string(),
            is_default: true,
        }])
    }
}

/// Dispatcher that optionally drops a job into a [`FakeSpooler`] on submit
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct FakeDispatcher {
    pub spooler: Option<FakeSpooler>,
    /// Spool id and raw status of the next submitted job
    pub next_job: Arc<RwLock<Option<(u32, String)>>>,
    pub fail_message: Arc<RwLock<Option<String>>>,
    pub delay: Arc<RwLock<Duration>>,
    pub submitted: Arc<RwLock<Vec<String>>>,
}

#[allow(dead_code)]
impl FakeDispatcher {
    /// Submissions succeed but never appear in a spooler
    pub fn instant() -> Self {
        Self::default()
    }

    pub fn spooling_into(spooler: &FakeSpooler) -> Self {
        Self {
            spooler: Some(spooler.clone()),
            ..Self::default()
        }
    }

    pub async fn spool_next_as(&self, id: u32, raw_status: &str) {
        *self.next_job.write().await = Some((id, raw_status.to_string()));
    }

    pub async fn fail_with(&self, message: &str) {
        *self.fail_message.write().await = Some(message.to_string());
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = delay;
    }

    pub async fn submit_count(&self) -> usize {
        self.submitted.read().await.len()
    }

    pub async fn submitted(&self) -> Vec<String> {
        self.submitted.read().await.clone()
    }
}

#[async_trait]
impl PrintDispatcher for FakeDispatcher {
    async fn submit(&self, _printer_name: &str, document_ref: &str) -> DispatchResult {
        self.submitted.write().await.push(document_ref.to_string());

        if let Some(message) = self.fail_message.read().await.clone() {
            return DispatchResult::failed(message);
        }

        // The job reaches the spooler right away even when the call is slow
        if let (Some(spooler), Some((id, status))) =
            (&self.spooler, self.next_job.write().await.take())
        {
            spooler.add_job(id, &status).await;
        }

        let delay = *self.delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        DispatchResult::ok("Print sent to spooler")
    }
}

/// Remote queue backed by a list of pending jobs
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct FakeRemote {
    pub pending: Arc<RwLock<VecDeque<RemoteJob>>>,
    pub reported: Arc<RwLock<Vec<RemoteJobId>>>,
    pub fetches: Arc<RwLock<u32>>,
    /// Number of upcoming fetches that fail
    pub fetch_failures: Arc<RwLock<u32>>,
}

#[allow(dead_code)]
impl FakeRemote {
    pub fn with_jobs(jobs: Vec<RemoteJob>) -> Self {
        Self {
            pending: Arc::new(RwLock::new(jobs.into())),
            ..Self::default()
        }
    }

    pub async fn push(&self, job: RemoteJob) {
        self.pending.write().await.push_back(job);
    }

    pub async fn fail_next_fetch(&self, count: u32) {
        *self.fetch_failures.write().await = count;
    }

    pub async fn reported(&self) -> Vec<RemoteJobId> {
        self.reported.read().await.clone()
    }

    pub async fn fetch_count(&self) -> u32 {
        *self.fetches.read().await
    }
}

#[async_trait]
impl RemoteQueueClient for FakeRemote {
    async fn fetch_next(&self, _token: Option<String>) -> Result<Option<RemoteJob>> {
        *self.fetches.write().await += 1;
        {
            let mut failures = self.fetch_failures.write().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(DaemonError::Api {
                    status: 503,
                    body: "queue unavailable".to_string(),
                });
            }
        }
        Ok(self.pending.write().await.pop_front())
    }

    async fn report_printed(&self, id: &RemoteJobId, _token: Option<String>) -> Result<()> {
        self.reported.write().await.push(id.clone());
        Ok(())
    }
}

/// Collects every event published on a bus
#[derive(Clone)]
#[allow(dead_code)]
pub struct EventRecorder {
    pub events: Arc<RwLock<Vec<QueueEvent>>>,
}

#[allow(dead_code)]
impl EventRecorder {
    pub fn start(bus: &EventBus) -> Self {
        let events = Arc::new(RwLock::new(Vec::new()));
        let sink = events.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                sink.write().await.push(event);
            }
        });
        Self { events }
    }

    pub async fn snapshot(&self) -> Vec<QueueEvent> {
        self.events.read().await.clone()
    }

    /// Poll until an event matches, or give up after `limit`.
    pub async fn wait_for<F>(&self, limit: Duration, predicate: F) -> bool
    where
        F: Fn(&QueueEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.events.read().await.iter().any(&predicate) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until at least `count` events match.
    pub async fn wait_for_count<F>(&self, limit: Duration, count: usize, predicate: F) -> bool
    where
        F: Fn(&QueueEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.events.read().await.iter().filter(|e| predicate(e)).count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Queue states in publish order, with their reasons
    pub async fn states(&self) -> Vec<(QueueState, Option<String>)> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|e| match e {
                QueueEvent::QueueStateChanged { state, reason, .. } => {
                    Some((*state, reason.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Ticks as (job id, status text) pairs
    pub async fn ticks(&self) -> Vec<(String, String)> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|e| match e {
                QueueEvent::JobStatusTick { job_id, status } => {
                    Some((job_id.clone(), status.to_string()))
                }
                _ => None,
            })
            .collect()
    }
}

#[allow(dead_code)]
pub fn is_state(event: &QueueEvent, wanted: QueueState, wanted_reason: Option<&str>) -> bool {
    matches!(
        event,
        QueueEvent::QueueStateChanged { state, reason, .. }
            if *state == wanted && (wanted_reason.is_none() || reason.as_deref() == wanted_reason)
    )
}

#[allow(dead_code)]
pub fn is_tick(event: &QueueEvent, wanted_job: &str, wanted: TickStatus) -> bool {
    matches!(
        event,
        QueueEvent::JobStatusTick { job_id, status } if job_id == wanted_job && *status == wanted
    )
}

/// Poll until the watcher has itself observed `status` for `job_id`.
#[allow(dead_code)]
pub async fn wait_watched(
    orchestrator: &QueueOrchestrator,
    job_id: u32,
    status: CanonicalStatus,
    limit: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(session) = orchestrator.watcher().current_session().await {
            if session.job_id == job_id && session.last_known_status == Some(status) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Orchestrator wired to fakes, with an event recorder attached
#[allow(dead_code)]
pub struct Harness {
    pub orchestrator: Arc<QueueOrchestrator>,
    pub remote: FakeRemote,
    pub dispatcher: FakeDispatcher,
    pub spooler: FakeSpooler,
    pub recorder: EventRecorder,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(remote: FakeRemote, dispatcher: FakeDispatcher, spooler: FakeSpooler) -> Self {
        let events = EventBus::new();
        let recorder = EventRecorder::start(&events);
        let orchestrator = Arc::new(QueueOrchestrator::new(
            Arc::new(remote.clone()),
            Arc::new(dispatcher.clone()),
            Arc::new(spooler.clone()),
            events,
            fast_timings(),
        ));

        Self {
            orchestrator,
            remote,
            dispatcher,
            spooler,
            recorder,
        }
    }
}
