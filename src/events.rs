use crate::status::{CanonicalStatus, JobOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default capacity of the observer channel. Slow subscribers lag and drop
/// the oldest events rather than holding up the queue loop.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Externally visible lifecycle state of the queue loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueState {
    Idle,
    Listening,
    Dispatching,
    Tracking,
    PausedTracking,
    Stopping,
    Stopped,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Idle => "idle",
            QueueState::Listening => "listening",
            QueueState::Dispatching => "dispatching",
            QueueState::Tracking => "tracking",
            QueueState::PausedTracking => "paused-tracking",
            QueueState::Stopping => "stopping",
            QueueState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried by a job tick: a live spooler status or a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TickStatus {
    Status(CanonicalStatus),
    Outcome(JobOutcome),
}

impl From<CanonicalStatus> for TickStatus {
    fn from(status: CanonicalStatus) -> Self {
        TickStatus::Status(status)
    }
}

impl From<JobOutcome> for TickStatus {
    fn from(outcome: JobOutcome) -> Self {
        TickStatus::Outcome(outcome)
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickStatus::Status(s) => s.fmt(f),
            TickStatus::Outcome(o) => o.fmt(f),
        }
    }
}

/// Observer events emitted by the queue loop and the job watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    QueueStateChanged {
        state: QueueState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        printer_name: Option<String>,
    },
    QueueLog {
        message: String,
        /// Unix timestamp in milliseconds
        ts: i64,
    },
    /// `job_id` is the spooler id, or a marker (`instant`, `reprint`) for
    /// jobs that finished before a spool entry was seen.
    JobStatusTick { job_id: String, status: TickStatus },
}

/// Fan-out channel for [`QueueEvent`]s plus the last published queue state.
///
/// Sending never blocks and never fails: with no subscriber the event is
/// only mirrored to the log.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
    current: Arc<Mutex<QueueState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            current: Arc::new(Mutex::new(QueueState::Idle)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Last state published through [`EventBus::state`].
    pub fn current_state(&self) -> QueueState {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self, state: QueueState, reason: Option<&str>) {
        self.publish_state(state, reason.map(str::to_string), None, None);
    }

    pub fn listening(&self, printer_name: &str) {
        self.publish_state(
            QueueState::Listening,
            None,
            None,
            Some(printer_name.to_string()),
        );
    }

    pub fn tracking(&self, state: QueueState, job_id: u32) {
        self.publish_state(state, None, Some(job_id), None);
    }

    fn publish_state(
        &self,
        state: QueueState,
        reason: Option<String>,
        job_id: Option<u32>,
        printer_name: Option<String>,
    ) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = state;
        match &reason {
            Some(r) => info!("Queue state -> {} ({})", state, r),
            None => debug!("Queue state -> {}", state),
        }
        self.send(QueueEvent::QueueStateChanged {
            state,
            reason,
            job_id,
            printer_name,
        });
    }

    /// Publish an operator log line. Credentials are redacted first.
    pub fn log(&self, message: impl Into<String>) {
        let message: String = message.into();
        let message = crate::sentry_init::redact(&message);
        info!("{}", message);
        self.send(QueueEvent::QueueLog {
            message,
            ts: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn tick(&self, job_id: impl fmt::Display, status: impl Into<TickStatus>) {
        let job_id = job_id.to_string();
        let status = status.into();
        debug!("Job {} status tick: {}", job_id, status);
        self.send(QueueEvent::JobStatusTick { job_id, status });
    }

    fn send(&self, event: QueueEvent) {
        // Err only means nobody is subscribed right now
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.state(QueueState::Stopped, Some("manual-stop"));
        bus.tick(7, CanonicalStatus::Printing);

        match rx.recv().await.unwrap() {
            QueueEvent::QueueStateChanged { state, reason, .. } => {
                assert_eq!(state, QueueState::Stopped);
                assert_eq!(reason.as_deref(), Some("manual-stop"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEvent::JobStatusTick {
                job_id: "7".to_string(),
                status: TickStatus::Status(CanonicalStatus::Printing),
            }
        );
    }

    #[tokio::test]
    async fn test_log_lines_are_redacted() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.log("[Queue] Print error: Fetch failed for https://bucket.example.com/doc.pdf?X-Amz-Signature=SECRET123");

        match rx.recv().await.unwrap() {
            QueueEvent::QueueLog { message, .. } => {
                assert!(!message.contains("SECRET123"));
                assert!(message.contains("https://bucket.example.com/doc.pdf"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.log("nobody listening");
        bus.state(QueueState::Listening, None);
        assert_eq!(bus.current_state(), QueueState::Listening);
    }

    #[test]
    fn test_event_json_shape() {
        let event = QueueEvent::QueueStateChanged {
            state: QueueState::PausedTracking,
            reason: None,
            job_id: Some(3),
            printer_name: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "queue_state_changed");
        assert_eq!(json["state"], "paused-tracking");
        assert_eq!(json["job_id"], 3);
        assert!(json.get("reason").is_none());

        let tick = QueueEvent::JobStatusTick {
            job_id: "instant".to_string(),
            status: JobOutcome::Printed.into(),
        };
        let json = serde_json::to_value(&tick).unwrap();
        assert_eq!(json["status"], "printed");
    }
}
