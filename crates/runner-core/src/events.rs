//! Lifecycle event types published to the coordinator.
//!
//! Every event is wrapped in an [`Event`] envelope carrying the task id,
//! runner id, and an elapsed-since-construction field. The elapsed field is
//! recomputed on every publish attempt (see [`crate::event_logger`]) so a
//! retried publish still lets the server reconstruct the true occurrence
//! time, per the "Elapsed-time correction" design note.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// The payload-specific part of an event. Field names match the spec's data
/// model; the `type` discriminant is added by [`Event::to_wire`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "json")]
pub enum EventBody {
    TaskPickedUp,
    TaskWorkStarted,
    TaskWorkFinished,
    TaskOutputUploaded {
        new_status: String,
        output_size_bytes: u64,
    },
    TaskOutputUploadFailed {
        error_message: String,
        traceback: String,
    },
    TaskExecutionFailed {
        error_message: String,
        traceback: String,
    },
    TaskKilled,
    TaskCommandStarted {
        command: String,
        container_command: String,
    },
    TaskCommandFinished {
        command: String,
        exit_code: i32,
        execution_time_s: f64,
    },
    TaskOutputStalled {
        last_modified_file_path: String,
        last_modified_file_timestamp: DateTime<Utc>,
    },
    ObserverTriggered {
        observer_id: Uuid,
    },
    TaskRunnerTerminated {
        reason: String,
        stopped_tasks: Vec<String>,
        detail: Option<String>,
        traceback: Option<String>,
    },
}

impl EventBody {
    /// Short name used in log lines; matches the Python class names so log
    /// output reads the same as the source this was ported from.
    pub fn name(&self) -> &'static str {
        match self {
            EventBody::TaskPickedUp => "TaskPickedUp",
            EventBody::TaskWorkStarted => "TaskWorkStarted",
            EventBody::TaskWorkFinished => "TaskWorkFinished",
            EventBody::TaskOutputUploaded { .. } => "TaskOutputUploaded",
            EventBody::TaskOutputUploadFailed { .. } => "TaskOutputUploadFailed",
            EventBody::TaskExecutionFailed { .. } => "TaskExecutionFailed",
            EventBody::TaskKilled => "TaskKilled",
            EventBody::TaskCommandStarted { .. } => "TaskCommandStarted",
            EventBody::TaskCommandFinished { .. } => "TaskCommandFinished",
            EventBody::TaskOutputStalled { .. } => "TaskOutputStalled",
            EventBody::ObserverTriggered { .. } => "ObserverTriggered",
            EventBody::TaskRunnerTerminated { .. } => "TaskRunnerTerminated",
        }
    }
}

/// An event together with its publication envelope.
///
/// `occurred_at` is stamped once, at construction (`Event::new`), never at
/// send time. [`crate::event_logger::EventLogger::log`] recomputes
/// `elapsed_time_s` from this fixed instant on every attempt, including
/// retries.
#[derive(Debug, Clone)]
pub struct Event {
    pub task_id: String,
    pub runner_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub body: EventBody,
}

impl Event {
    pub fn new(task_id: impl Into<String>, runner_id: Uuid, body: EventBody) -> Self {
        Self {
            task_id: task_id.into(),
            runner_id,
            occurred_at: Utc::now(),
            body,
        }
    }

    /// Serialize into the wire envelope the coordinator expects, with a
    /// freshly computed elapsed time.
    pub fn to_wire(&self) -> WireEvent<'_> {
        let elapsed_time_s = (Utc::now() - self.occurred_at).num_milliseconds() as f64 / 1000.0;
        WireEvent {
            task_id: &self.task_id,
            runner_id: self.runner_id,
            occurred_at: self.occurred_at,
            elapsed_time_s,
            body: &self.body,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WireEvent<'a> {
    pub task_id: &'a str,
    pub runner_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub elapsed_time_s: f64,
    #[serde(flatten)]
    pub body: &'a EventBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_time_grows_across_calls() {
        let event = Event::new("task-1", Uuid::nil(), EventBody::TaskPickedUp);
        let first = event.to_wire().elapsed_time_s;
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = event.to_wire().elapsed_time_s;
        assert!(second > first);
    }

    #[test]
    fn wire_envelope_tags_event_type() {
        let event = Event::new(
            "task-1",
            Uuid::nil(),
            EventBody::TaskCommandStarted {
                command: "sleep 1".to_string(),
                container_command: "apptainer exec ... sleep 1".to_string(),
            },
        );
        let json = serde_json::to_value(event.to_wire()).unwrap();
        assert_eq!(json["type"], "TaskCommandStarted");
        assert_eq!(json["json"]["command"], "sleep 1");
    }
}
