use crate::config::QueueTimings;
use crate::dispatcher::{DispatchResult, PrintDispatcher};
use crate::errors::DaemonError;
use crate::events::{EventBus, QueueState};
use crate::remote::{RemoteJob, RemoteJobId, RemoteQueueClient};
use crate::sentry_init;
use crate::spooler::{PrinterInfo, SpoolEntry, SpoolerProbe};
use crate::status::{CanonicalStatus, JobOutcome};
use crate::watcher::{stop_requested, JobWatcher, WatchResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dispatch failures that mean the document link is no longer valid
static EXPIRED_LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)403|AccessDenied|Expired|Signature").expect("Invalid expired-link regex pattern")
});

const SPOOL_ASSUMED: &str = "spool assumed (race timeout)";

/// Stop reasons surfaced to observers
pub mod reason {
    pub const RETRY_START: &str = "retry-start";
    pub const MANUAL_STOP: &str = "manual-stop";
    pub const REPRINT_LAST: &str = "reprint-last";
    pub const REPRINT_FINISHED: &str = "reprint-finished";
    pub const URL_EXPIRED: &str = "url-expired";
    pub const PRINT_ERROR: &str = "print-error";
    pub const JOB_LOOKUP_FAILED: &str = "job-lookup-failed";
    pub const DELETED: &str = "deleted";
}

/// Most recent job that resolved as printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSuccess {
    pub url: String,
    pub filename: Option<String>,
    pub remote_id: Option<RemoteJobId>,
}

impl From<&RemoteJob> for LastSuccess {
    fn from(job: &RemoteJob) -> Self {
        Self {
            url: job.url.clone(),
            filename: job.filename.clone(),
            remote_id: job.id.clone(),
        }
    }
}

/// State carried by a control response: the queue's lifecycle state, or the
/// outcome of a one-shot reprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlState {
    Queue(QueueState),
    Job(JobOutcome),
}

/// Result of a control call. Failures carry a message instead of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ControlState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    pub fn queue(state: QueueState) -> Self {
        Self {
            success: true,
            state: Some(ControlState::Queue(state)),
            message: None,
        }
    }

    pub fn job(outcome: JobOutcome) -> Self {
        Self {
            success: true,
            state: Some(ControlState::Job(outcome)),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            state: None,
            message: Some(message.into()),
        }
    }
}

/// Whether a dispatch failure message points at an expired or revoked link.
pub fn is_expired_link(message: &str) -> bool {
    EXPIRED_LINK_REGEX.is_match(message)
}

enum Discovery {
    Found(SpoolEntry, CanonicalStatus),
    NotFound,
    Failed(String),
    Cancelled,
}

enum LoopExit {
    Cancelled,
    /// Run ends with a stop reason; `detail` is set for failures worth reporting
    Fatal(&'static str, Option<String>),
}

/// Everything one run of the queue loop (or a reprint) needs.
#[derive(Clone)]
struct Pipeline {
    remote: Arc<dyn RemoteQueueClient>,
    dispatcher: Arc<dyn PrintDispatcher>,
    probe: Arc<dyn SpoolerProbe>,
    watcher: Arc<JobWatcher>,
    events: EventBus,
    timings: QueueTimings,
    last_success: Arc<std::sync::Mutex<Option<LastSuccess>>>,
}

impl Pipeline {
    /// Sleep unless a stop arrives first. Returns false when stopped.
    async fn pause(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !*shutdown.borrow(),
            _ = stop_requested(shutdown) => false,
        }
    }

    /// Submit the document, but never wait longer than the race deadline.
    ///
    /// Some backends only return long after the job is spooled. If the
    /// deadline passes first the job is assumed spooled and the submission
    /// keeps running in the background.
    async fn dispatch(&self, printer_name: &str, document_ref: &str) -> DispatchResult {
        let dispatcher = self.dispatcher.clone();
        let printer = printer_name.to_string();
        let document = document_ref.to_string();
        let mut submission =
            tokio::spawn(async move { dispatcher.submit(&printer, &document).await });

        match tokio::time::timeout(self.timings.dispatch_race(), &mut submission).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => DispatchResult::failed(format!("print error: {}", e)),
            Err(_) => {
                debug!(
                    "Dispatch still pending after {:?}, assuming spooled",
                    self.timings.dispatch_race()
                );
                tokio::spawn(async move {
                    if let Ok(late) = submission.await {
                        if !late.success {
                            warn!("Late dispatch failure after assumed spool: {}", late.message);
                        }
                    }
                });
                DispatchResult::ok(SPOOL_ASSUMED)
            }
        }
    }

    /// Find the spool entry of a just-dispatched job. The spooler can lag,
    /// so look a few times before concluding there is none.
    async fn discover(&self, printer_name: &str, shutdown: &mut watch::Receiver<bool>) -> Discovery {
        let attempts = self.timings.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            let latest = tokio::select! {
                biased;
                _ = stop_requested(shutdown) => return Discovery::Cancelled,
                latest = self.probe.latest(printer_name) => latest,
            };

            match latest {
                Ok(Some(entry)) => {
                    let now = CanonicalStatus::normalize(&entry.raw_status);
                    self.events.log(format!(
                        "[Queue] Latest job found (try {}/{}): #{}, raw=\"{}\", now=\"{}\"",
                        attempt, attempts, entry.id, entry.raw_status, now
                    ));
                    return Discovery::Found(entry, now);
                }
                Ok(None) => debug!("No spool entry yet (try {}/{})", attempt, attempts),
                Err(e) => {
                    if attempt >= attempts {
                        return Discovery::Failed(e.to_string());
                    }
                    debug!("Spool lookup failed (try {}/{}): {}", attempt, attempts, e);
                }
            }

            if attempt < attempts && !self.pause(self.timings.discovery_delay(), shutdown).await {
                return Discovery::Cancelled;
            }
        }
        Discovery::NotFound
    }

    /// Track a discovered entry, giving up as soon as a stop is requested.
    async fn track(
        &self,
        printer_name: &str,
        entry: &SpoolEntry,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WatchResult {
        if *shutdown.borrow() {
            return WatchResult::Cancelled;
        }
        tokio::select! {
            result = self.watcher.watch(printer_name, entry.id) => result,
            _ = stop_requested(shutdown) => WatchResult::Cancelled,
        }
    }

    fn record_success(&self, job: &RemoteJob) {
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(LastSuccess::from(job));
    }

    async fn report_printed(&self, job: &RemoteJob, token: &Option<String>) {
        let Some(id) = &job.id else {
            return;
        };
        match self.remote.report_printed(id, token.clone()).await {
            Ok(()) => self
                .events
                .log(format!("[Queue] Status updated to printed (id={}).", id)),
            Err(e) => self
                .events
                .log(format!("[Queue] Failed to update status (id={}): {}", id, e)),
        }
    }

    /// fetch → dispatch → discover → watch → report, until stopped or a
    /// fatal condition ends the run.
    async fn run_loop(
        &self,
        printer_name: String,
        token: Option<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            if *shutdown.borrow() {
                return LoopExit::Cancelled;
            }

            let fetched = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => return LoopExit::Cancelled,
                fetched = self.remote.fetch_next(token.clone()) => fetched,
            };

            let job = match fetched {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if !self.pause(self.timings.idle_poll(), &mut shutdown).await {
                        return LoopExit::Cancelled;
                    }
                    continue;
                }
                Err(e) => {
                    self.events.log(format!("[Queue] API error: {}", e));
                    if !self.pause(self.timings.idle_poll(), &mut shutdown).await {
                        return LoopExit::Cancelled;
                    }
                    continue;
                }
            };

            self.events.state(QueueState::Dispatching, None);
            self.events.log(format!(
                "[Queue] Printing {} (apiId: {})",
                job.label(),
                job.id_label()
            ));

            let sent = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => return LoopExit::Cancelled,
                sent = self.dispatch(&printer_name, &job.url) => sent,
            };
            self.events.log(format!(
                "[Queue] Spool step done: {} ({})",
                if sent.success { "ok" } else { "err" },
                sent.message
            ));

            if !sent.success {
                let expired = is_expired_link(&sent.message);
                self.events.log(format!(
                    "[Queue] Print error: {}{}",
                    sent.message,
                    if expired { " (likely expired link)" } else { "" }
                ));
                let why = if expired {
                    reason::URL_EXPIRED
                } else {
                    reason::PRINT_ERROR
                };
                return LoopExit::Fatal(why, Some(sent.message));
            }

            if !self.pause(self.timings.settle_delay(), &mut shutdown).await {
                return LoopExit::Cancelled;
            }

            let (entry, now) = match self.discover(&printer_name, &mut shutdown).await {
                Discovery::Found(entry, now) => (entry, now),
                Discovery::NotFound => {
                    // Finished before the spooler showed it: still a success
                    self.record_success(&job);
                    self.events.log("[Queue] Job finished instantly (no queue entry).");
                    self.events.tick("instant", JobOutcome::Printed);
                    self.report_printed(&job, &token).await;
                    self.events.listening(&printer_name);
                    continue;
                }
                Discovery::Failed(message) => {
                    self.events
                        .log(format!("[Queue] Could not fetch latest job: {}", message));
                    return LoopExit::Fatal(reason::JOB_LOOKUP_FAILED, Some(message));
                }
                Discovery::Cancelled => return LoopExit::Cancelled,
            };

            self.events
                .log(format!("[Queue] Watching job #{} (now={}).", entry.id, now));
            self.events.tick(entry.id, now);

            match self.track(&printer_name, &entry, &mut shutdown).await {
                WatchResult::Resolved(JobOutcome::Printed) => {
                    self.events.tick(entry.id, JobOutcome::Printed);
                    self.record_success(&job);
                    self.report_printed(&job, &token).await;
                    self.events
                        .log("[Queue] Printed successfully, requesting next.");
                    self.events.listening(&printer_name);
                }
                WatchResult::Resolved(JobOutcome::Deleted) => {
                    self.events.tick(entry.id, JobOutcome::Deleted);
                    self.events.log("[Queue] Job deleted, stopping queue.");
                    return LoopExit::Fatal(reason::DELETED, None);
                }
                WatchResult::Cancelled => return LoopExit::Cancelled,
            }
        }
    }

    /// Dispatch `last` again and follow it to resolution, once.
    async fn reprint(
        &self,
        printer_name: String,
        last: LastSuccess,
        mut shutdown: watch::Receiver<bool>,
    ) -> ControlResponse {
        let label = last
            .filename
            .clone()
            .unwrap_or_else(|| crate::remote::mask_url(&last.url));
        let api_id = last
            .remote_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        self.events.log(format!(
            "[Queue] Reprinting previous document: {} (apiId: {})",
            label, api_id
        ));

        let sent = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => return ControlResponse::failed("Reprint cancelled"),
            sent = self.dispatch(&printer_name, &last.url) => sent,
        };
        self.events.log(format!(
            "[Queue] Reprint spool step done: {} ({})",
            if sent.success { "ok" } else { "err" },
            sent.message
        ));
        if !sent.success {
            return ControlResponse::failed(sent.message);
        }

        if !self.pause(self.timings.settle_delay(), &mut shutdown).await {
            return ControlResponse::failed("Reprint cancelled");
        }

        let (entry, now) = match self.discover(&printer_name, &mut shutdown).await {
            Discovery::Found(entry, now) => (entry, now),
            Discovery::NotFound => {
                self.events
                    .log("[Queue] Reprint finished instantly (no queue entry).");
                self.events.tick("reprint", JobOutcome::Printed);
                return ControlResponse::job(JobOutcome::Printed);
            }
            Discovery::Failed(message) => {
                return ControlResponse::failed(format!("Reprint job lookup failed: {}", message));
            }
            Discovery::Cancelled => return ControlResponse::failed("Reprint cancelled"),
        };

        self.events
            .log(format!("[Queue] Reprint watching job #{} ({}).", entry.id, now));
        self.events.tick(entry.id, now);

        match self.track(&printer_name, &entry, &mut shutdown).await {
            WatchResult::Resolved(outcome) => {
                self.events.tick(entry.id, outcome);
                self.events.log(match outcome {
                    JobOutcome::Printed => "[Queue] Reprint completed successfully.",
                    JobOutcome::Deleted => "[Queue] Reprint ended: deleted.",
                });
                ControlResponse::job(outcome)
            }
            WatchResult::Cancelled => ControlResponse::failed("Reprint cancelled"),
        }
    }
}

/// A running loop or reprint, owned by the orchestrator.
struct Run {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    printer_name: Option<String>,
    run: Option<Run>,
}

/// Top-level state machine: owns the queue loop, its lifecycle and the
/// reprint-last recovery path.
///
/// Control calls are serialised; at most one loop or reprint runs at a time.
pub struct QueueOrchestrator {
    pipeline: Pipeline,
    control: Mutex<Control>,
}

impl QueueOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteQueueClient>,
        dispatcher: Arc<dyn PrintDispatcher>,
        probe: Arc<dyn SpoolerProbe>,
        events: EventBus,
        timings: QueueTimings,
    ) -> Self {
        let watcher = Arc::new(JobWatcher::new(
            probe.clone(),
            events.clone(),
            timings.watch_poll(),
        ));

        Self {
            pipeline: Pipeline {
                remote,
                dispatcher,
                probe,
                watcher,
                events,
                timings,
                last_success: Arc::new(std::sync::Mutex::new(None)),
            },
            control: Mutex::new(Control::default()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.pipeline.events
    }

    /// Printers installed on the host, for choosing where to start.
    pub async fn printers(&self) -> crate::errors::Result<Vec<PrinterInfo>> {
        self.pipeline.probe.printers().await
    }

    pub fn watcher(&self) -> &JobWatcher {
        &self.pipeline.watcher
    }

    pub fn state(&self) -> QueueState {
        self.pipeline.events.current_state()
    }

    pub fn last_success(&self) -> Option<LastSuccess> {
        self.pipeline
            .last_success
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn printer_name(&self) -> Option<String> {
        self.control.lock().await.printer_name.clone()
    }

    /// Whether a loop or reprint task is currently running.
    pub async fn is_running(&self) -> bool {
        let control = self.control.lock().await;
        control
            .run
            .as_ref()
            .map(|run| !run.handle.is_finished())
            .unwrap_or(false)
    }

    /// Start listening for jobs for `printer_name`. Any active run is
    /// stopped first.
    pub async fn start(&self, printer_name: &str, token: Option<String>) -> ControlResponse {
        let printer_name = printer_name.trim();
        if printer_name.is_empty() {
            return ControlResponse::failed(DaemonError::NoPrinter.to_string());
        }

        let mut control = self.control.lock().await;
        self.ensure_stopped(&mut control, reason::RETRY_START).await;

        control.printer_name = Some(printer_name.to_string());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.pipeline.events.listening(printer_name);
        sentry_init::set_printer_context(printer_name);
        info!("Queue listening on printer {}", printer_name);

        let pipeline = self.pipeline.clone();
        let printer = printer_name.to_string();
        let handle = tokio::spawn(async move {
            let exit = pipeline.run_loop(printer, token, shutdown_rx).await;
            if let LoopExit::Fatal(why, detail) = exit {
                warn!("Queue loop stopped: {}", why);
                if let Some(detail) = detail {
                    sentry_init::capture_queue_stop(why, &detail);
                }
                pipeline.events.state(QueueState::Stopping, Some(why));
                pipeline.watcher.cancel().await;
                pipeline.events.state(QueueState::Stopped, Some(why));
            }
        });

        control.run = Some(Run {
            shutdown: shutdown_tx,
            handle,
        });

        ControlResponse::queue(QueueState::Listening)
    }

    /// Stop the loop (or a reprint) and wait until it and its watcher are
    /// torn down. Safe to call repeatedly.
    pub async fn stop(&self, reason: &str) -> ControlResponse {
        let mut control = self.control.lock().await;
        self.ensure_stopped(&mut control, reason).await;
        ControlResponse::queue(QueueState::Stopped)
    }

    /// Print the last successful document again on `printer_name` (or the
    /// printer the queue last ran on), then stay stopped.
    pub async fn reprint_last(&self, printer_name: Option<&str>) -> ControlResponse {
        let result_rx = {
            let mut control = self.control.lock().await;
            self.ensure_stopped(&mut control, reason::REPRINT_LAST).await;

            let Some(last) = self.last_success() else {
                return ControlResponse::failed(DaemonError::NoPreviousJob.to_string());
            };

            let printer = printer_name
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .or_else(|| control.printer_name.clone());
            let Some(printer) = printer else {
                return ControlResponse::failed(DaemonError::NoPrinter.to_string());
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (result_tx, result_rx) = oneshot::channel();
            let pipeline = self.pipeline.clone();
            let handle = tokio::spawn(async move {
                let response = pipeline.reprint(printer, last, shutdown_rx).await;
                let finished = response.success;
                let _ = result_tx.send(response);
                if finished {
                    pipeline
                        .events
                        .state(QueueState::Stopped, Some(reason::REPRINT_FINISHED));
                }
            });

            control.run = Some(Run {
                shutdown: shutdown_tx,
                handle,
            });
            result_rx
        };

        result_rx
            .await
            .unwrap_or_else(|_| ControlResponse::failed("Reprint cancelled"))
    }

    async fn ensure_stopped(&self, control: &mut Control, reason: &str) {
        let events = &self.pipeline.events;
        events.state(QueueState::Stopping, Some(reason));

        if let Some(run) = control.run.take() {
            run.shutdown.send_replace(true);
            if let Err(e) = run.handle.await {
                warn!("Queue task ended abnormally: {}", e);
            }
        }
        self.pipeline.watcher.cancel().await;

        events.state(QueueState::Stopped, Some(reason));
    }
}
