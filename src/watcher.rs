use crate::events::{EventBus, QueueState};
use crate::spooler::SpoolerProbe;
use crate::status::{CanonicalStatus, JobOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How a watch ended. `Cancelled` is not an outcome: the job may still be
/// in the spooler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResult {
    Resolved(JobOutcome),
    Cancelled,
}

/// Bookkeeping for the single job being tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchSession {
    pub printer_name: String,
    pub job_id: u32,
    pub last_known_status: Option<CanonicalStatus>,
}

struct ActiveWatch {
    session_id: u64,
    printer_name: String,
    job_id: u32,
    cancel: watch::Sender<bool>,
    status: watch::Receiver<Option<CanonicalStatus>>,
    handle: JoinHandle<()>,
}

/// Tracks one spooler job at a time until it leaves the spool.
///
/// Every session runs as its own task together with a forwarder task that
/// mirrors the job's status onto the queue state (`tracking` /
/// `paused-tracking`). Starting a session cancels and awaits the previous one,
/// so two sessions never poll at once.
pub struct JobWatcher {
    probe: Arc<dyn SpoolerProbe>,
    events: EventBus,
    poll_interval: Duration,
    active: Mutex<Option<ActiveWatch>>,
    live: Arc<AtomicUsize>,
    next_session: AtomicU64,
}

impl JobWatcher {
    pub fn new(probe: Arc<dyn SpoolerProbe>, events: EventBus, poll_interval: Duration) -> Self {
        Self {
            probe,
            events,
            poll_interval,
            active: Mutex::new(None),
            live: Arc::new(AtomicUsize::new(0)),
            next_session: AtomicU64::new(1),
        }
    }

    /// Number of session tasks currently alive (0 or 1).
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn current_session(&self) -> Option<WatchSession> {
        let active = self.active.lock().await;
        active.as_ref().map(|a| WatchSession {
            printer_name: a.printer_name.clone(),
            job_id: a.job_id,
            last_known_status: *a.status.borrow(),
        })
    }

    /// Watch `job_id` until it disappears from the spooler.
    ///
    /// A session starts without a known status: only what its own polls
    /// observe feeds the disappearance outcome, so a job already gone on the
    /// first poll counts as printed.
    #[tracing::instrument(skip(self))]
    pub async fn watch(&self, printer_name: &str, job_id: u32) -> WatchResult {
        let (done_tx, done_rx) = oneshot::channel();
        let session_id = {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.take() {
                info!("Cancelling watch of job #{} before watching #{}", previous.job_id, job_id);
                Self::shutdown(previous).await;
            }

            let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (status_tx, status_rx) = watch::channel(None);
            let session = WatchSession {
                printer_name: printer_name.to_string(),
                job_id,
                last_known_status: None,
            };
            let guard = LiveGuard::new(self.live.clone());

            let handle = tokio::spawn(run_session(
                self.probe.clone(),
                self.events.clone(),
                self.poll_interval,
                session,
                status_tx,
                cancel_rx,
                done_tx,
                guard,
            ));

            *active = Some(ActiveWatch {
                session_id,
                printer_name: printer_name.to_string(),
                job_id,
                cancel: cancel_tx,
                status: status_rx,
                handle,
            });
            session_id
        };

        let result = match done_rx.await {
            Ok(outcome) => WatchResult::Resolved(outcome),
            Err(_) => WatchResult::Cancelled,
        };

        let mut active = self.active.lock().await;
        if active.as_ref().map(|a| a.session_id) == Some(session_id) {
            if let Some(finished) = active.take() {
                Self::shutdown(finished).await;
            }
        }

        result
    }

    /// Cancel the active session, if any, and wait for its tasks to end.
    pub async fn cancel(&self) {
        let mut active = self.active.lock().await;
        if let Some(current) = active.take() {
            debug!("Cancelling watch of job #{}", current.job_id);
            Self::shutdown(current).await;
        }
    }

    async fn shutdown(watch: ActiveWatch) {
        watch.cancel.send_replace(true);
        if let Err(e) = watch.handle.await {
            warn!("Watch task for job #{} ended abnormally: {}", watch.job_id, e);
        }
    }
}

/// Counts a live session for as long as the session task holds it.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves once a stop has been requested (or the requester is gone).
pub(crate) async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    probe: Arc<dyn SpoolerProbe>,
    events: EventBus,
    poll_interval: Duration,
    mut session: WatchSession,
    status_tx: watch::Sender<Option<CanonicalStatus>>,
    mut cancel_rx: watch::Receiver<bool>,
    done_tx: oneshot::Sender<JobOutcome>,
    _guard: LiveGuard,
) {
    let forwarder = tokio::spawn(forward_status(
        events.clone(),
        session.job_id,
        status_tx.subscribe(),
    ));

    let outcome = poll_until_gone(
        probe.as_ref(),
        &events,
        poll_interval,
        &mut session,
        &status_tx,
        &mut cancel_rx,
    )
    .await;

    forwarder.abort();
    let _ = forwarder.await;

    match outcome {
        Some(outcome) => {
            let _ = done_tx.send(outcome);
        }
        None => debug!("Watch of job #{} cancelled", session.job_id),
    }
}

/// Poll the spooler until the job is gone. Returns `None` on cancellation.
async fn poll_until_gone(
    probe: &dyn SpoolerProbe,
    events: &EventBus,
    poll_interval: Duration,
    session: &mut WatchSession,
    status_tx: &watch::Sender<Option<CanonicalStatus>>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Option<JobOutcome> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(cancel_rx) => return None,
            _ = ticker.tick() => {}
        }

        let polled = tokio::select! {
            biased;
            _ = stop_requested(cancel_rx) => return None,
            polled = probe.by_id(&session.printer_name, session.job_id) => polled,
        };

        match polled {
            Ok(Some(entry)) => {
                let now = CanonicalStatus::normalize(&entry.raw_status);
                if session.last_known_status != Some(now) {
                    events.tick(session.job_id, now);
                    session.last_known_status = Some(now);
                    status_tx.send_replace(Some(now));
                }
            }
            Ok(None) => {
                let outcome = JobOutcome::on_disappear(session.last_known_status);
                info!(
                    "Job #{} left the spooler (last status {}), outcome: {}",
                    session.job_id,
                    session
                        .last_known_status
                        .map(|s| s.as_str())
                        .unwrap_or("never seen"),
                    outcome
                );
                return Some(outcome);
            }
            // One failed query is not a disappearance
            Err(e) => debug!("Missed poll for job #{}: {}", session.job_id, e),
        }
    }
}

/// Mirror the watched job's status onto the queue state.
async fn forward_status(
    events: EventBus,
    job_id: u32,
    mut status_rx: watch::Receiver<Option<CanonicalStatus>>,
) {
    let mut forwarded: Option<QueueState> = None;
    loop {
        let state = match *status_rx.borrow_and_update() {
            Some(CanonicalStatus::Paused) => QueueState::PausedTracking,
            _ => QueueState::Tracking,
        };
        if forwarded != Some(state) {
            events.tracking(state, job_id);
            forwarded = Some(state);
        }
        if status_rx.changed().await.is_err() {
            return;
        }
    }
}
