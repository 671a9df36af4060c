//! Event Logger: publishes [`Event`]s to the coordinator, retrying forever
//! on transient failure.
//!
//! Grounded in `task_runner.event_logger.WebApiLogger`, whose `_log_event`
//! is wrapped in `@utils.retry()` with no bound on the number of attempts --
//! a lost event means the server's view of a task's history has a
//! permanent hole, so this is the one retry policy in the runner that never
//! gives up.

use std::time::Duration;

use crate::api_client::ApiClient;
use crate::events::Event;

const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct EventLogger {
    api: std::sync::Arc<ApiClient>,
}

impl EventLogger {
    pub fn new(api: std::sync::Arc<ApiClient>) -> Self {
        Self { api }
    }

    /// Publish one event, retrying indefinitely. Every attempt re-derives
    /// `elapsed_time_s` from the event's fixed `occurred_at` (see
    /// [`Event::to_wire`]), so a publish that only succeeds on its fifth try
    /// still reports accurate timing to the server.
    pub async fn log(&self, event: &Event) {
        let policy = crate::retry::RetryPolicy::forever(RETRY_DELAY);
        let result = crate::retry::retry(
            policy,
            || self.api.log_event(event),
            |attempt, err| {
                tracing::warn!(
                    attempt,
                    %err,
                    event = event.body.name(),
                    task_id = %event.task_id,
                    "retrying event publish"
                );
            },
        )
        .await;

        if let Err(err) = result {
            tracing::error!(%err, event = event.body.name(), "event publish failed permanently");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiCredential;
    use crate::events::EventBody;
    use uuid::Uuid;

    #[tokio::test]
    async fn log_against_an_unreachable_host_does_not_panic() {
        let api = std::sync::Arc::new(
            ApiClient::new(
                "http://127.0.0.1:1",
                ApiCredential::UserApiKey("test".to_string()),
            )
            .unwrap(),
        );
        api.set_runner_id_for_test(Uuid::nil());
        let logger = EventLogger::new(api);
        let event = Event::new("task-1", Uuid::nil(), EventBody::TaskPickedUp);

        let handle = tokio::spawn(async move { logger.log(&event).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    }
}
