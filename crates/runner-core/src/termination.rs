//! Termination reasons and the at-most-once termination-logging guard.
//!
//! Grounded in `task_runner.task_status.TaskRunnerTerminationReason` (the
//! four string values) and `task_runner.cleanup.TerminationHandler` (the
//! lock-guarded "only log once" property, whichever caller gets there
//! first -- a signal handler racing the main loop's own error path).

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::event_logger::EventLogger;
use crate::events::{Event, EventBody};

/// Why the runner process is shutting down. Serializes to the exact string
/// values the coordinator's task-status mapping expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunnerTerminationReason {
    Interrupted,
    VmPreempted,
    Error,
    IdleTimeout,
}

impl TaskRunnerTerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunnerTerminationReason::Interrupted => "interrupted",
            TaskRunnerTerminationReason::VmPreempted => "preempted",
            TaskRunnerTerminationReason::Error => "error",
            TaskRunnerTerminationReason::IdleTimeout => "idle_timeout",
        }
    }
}

impl std::fmt::Display for TaskRunnerTerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TaskRunnerTerminationReason {
    /// Parse a reason string the coordinator sent back on an unrecoverable
    /// `get_task` response. Anything unrecognized maps to `Error` rather
    /// than panicking -- the coordinator's vocabulary can grow without a
    /// runner upgrade.
    pub fn parse(reason: &str) -> Self {
        match reason {
            "interrupted" => TaskRunnerTerminationReason::Interrupted,
            "preempted" => TaskRunnerTerminationReason::VmPreempted,
            "idle_timeout" => TaskRunnerTerminationReason::IdleTimeout,
            _ => TaskRunnerTerminationReason::Error,
        }
    }
}

/// Whatever is currently executing a task, as far as termination logging is
/// concerned. Implemented by the request handler; kept as a trait so the
/// handler (which owns far more state than this needs) isn't a hard
/// dependency of this module.
#[async_trait::async_trait]
pub trait RunningTask: Send + Sync {
    /// `Some(task_id)` if a task is currently executing.
    fn running_task_id(&self) -> Option<String>;
    /// Ask the running task (if any) to stop.
    async fn interrupt(&self);
    /// Mark the handler as shutting down so it won't pick up a new task.
    fn set_shutting_down(&self);
}

/// Ensures the `TaskRunnerTerminated` event is published exactly once no
/// matter how many callers race to report termination (a signal handler and
/// the main loop's own error path can both try).
pub struct TerminationHandler {
    runner_id: uuid::Uuid,
    logger: std::sync::Arc<EventLogger>,
    running_task: std::sync::Arc<dyn RunningTask>,
    logged: AtomicBool,
    lock: Mutex<()>,
}

impl TerminationHandler {
    pub fn new(
        runner_id: uuid::Uuid,
        logger: std::sync::Arc<EventLogger>,
        running_task: std::sync::Arc<dyn RunningTask>,
    ) -> Self {
        Self {
            runner_id,
            logger,
            running_task,
            logged: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Log the runner's termination, once. Returns `true` if this call was
    /// the one that actually logged it.
    pub async fn log_termination(
        &self,
        reason: TaskRunnerTerminationReason,
        detail: Option<String>,
        traceback: Option<String>,
    ) -> bool {
        {
            let _guard = self.lock.lock().unwrap();
            if self
                .logged
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tracing::info!("termination already logged by another caller, skipping");
                return false;
            }
        }

        let mut stopped_tasks = Vec::new();
        if let Some(task_id) = self.running_task.running_task_id() {
            tracing::info!(task_id, "task was being executed at termination");
            self.running_task.interrupt().await;
            stopped_tasks.push(task_id);
        }
        self.running_task.set_shutting_down();

        let event = Event::new(
            "",
            self.runner_id,
            EventBody::TaskRunnerTerminated {
                reason: reason.as_str().to_string(),
                stopped_tasks,
                detail,
                traceback,
            },
        );
        self.logger.log(&event).await;

        tracing::info!("logged task-runner termination");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiCredential;
    use std::sync::atomic::AtomicUsize;

    struct NoTask;

    #[async_trait::async_trait]
    impl RunningTask for NoTask {
        fn running_task_id(&self) -> Option<String> {
            None
        }
        async fn interrupt(&self) {}
        fn set_shutting_down(&self) {}
    }

    fn handler() -> TerminationHandler {
        let api = std::sync::Arc::new(
            crate::api_client::ApiClient::new(
                "http://127.0.0.1:1",
                ApiCredential::UserApiKey("test".to_string()),
            )
            .unwrap(),
        );
        api.set_runner_id_for_test(uuid::Uuid::nil());
        let logger = std::sync::Arc::new(EventLogger::new(api));
        TerminationHandler::new(uuid::Uuid::nil(), logger, std::sync::Arc::new(NoTask))
    }

    #[tokio::test]
    async fn logs_only_once() {
        let handler = std::sync::Arc::new(handler());

        let h1 = handler.clone();
        let first = tokio::spawn(async move {
            h1.log_termination(TaskRunnerTerminationReason::Error, None, None).await
        });
        // Give the first call time to win the compare_exchange before the
        // second one starts, without waiting for its (unreachable-host)
        // event publish to finish.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = handler
            .log_termination(TaskRunnerTerminationReason::Error, None, None)
            .await;

        assert!(!second);
        first.abort();
    }

    #[test]
    fn parse_falls_back_to_error_for_unknown_reasons() {
        assert_eq!(
            TaskRunnerTerminationReason::parse("something_new"),
            TaskRunnerTerminationReason::Error
        );
        assert_eq!(
            TaskRunnerTerminationReason::parse("idle_timeout"),
            TaskRunnerTerminationReason::IdleTimeout
        );
    }

    #[test]
    fn reason_strings_match_the_coordinator_vocabulary() {
        let counts = AtomicUsize::new(0);
        for (reason, expected) in [
            (TaskRunnerTerminationReason::Interrupted, "interrupted"),
            (TaskRunnerTerminationReason::VmPreempted, "preempted"),
            (TaskRunnerTerminationReason::Error, "error"),
            (TaskRunnerTerminationReason::IdleTimeout, "idle_timeout"),
        ] {
            assert_eq!(reason.as_str(), expected);
            counts.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(counts.load(Ordering::SeqCst), 4);
    }
}
