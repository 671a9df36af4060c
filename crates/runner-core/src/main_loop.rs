//! Main Loop: registers the runner, then drives the idle-aware fetch loop
//! until the coordinator tells it to stop, an unrecoverable error occurs,
//! or a shutdown signal arrives.
//!
//! Grounded in `task_runner.main.Main` and `task_runner.task_execution_loop
//! .TaskExecutionLoop`: the idle-timeout/scale-down branch, the four-way
//! `get_task` dispatch, and "connection errors are logged and the loop
//! continues" are all carried over from `§4.13` verbatim. Signal handling
//! (`install_signal_handlers`) is the Rust expression of the source's
//! `signal.signal(SIGTERM, handler)` registration -- a long-lived task
//! racing `SIGINT`/`SIGTERM` against a cooperative [`CancellationToken`]
//! rather than a process-wide signal handler, since Rust has no equivalent
//! of re-entering arbitrary Python from a signal handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::api_client::{ApiClient, ApiClientError, GetTaskOutcome};
use crate::handler::TaskRequestHandler;
use crate::termination::{TaskRunnerTerminationReason, TerminationHandler};

/// How long a single `get_task` long-poll holds the connection open.
pub const GET_TASK_BLOCK_S: u64 = 30;
/// Pause after a bare `no_content` response before polling again.
const NO_CONTENT_BACKOFF: Duration = Duration::from_secs(1);
/// Pause after the coordinator reports an internal error before retrying.
const INTERNAL_ERROR_BACKOFF: Duration = Duration::from_secs(10);
/// Pause after a transient connection/timeout error before retrying.
const CONNECTION_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Everything the fetch loop needs beyond the handler and API client
/// themselves.
#[derive(Debug, Clone, Copy)]
pub struct MainLoopConfig {
    pub max_idle_timeout: Option<Duration>,
    pub get_task_block_s: u64,
}

impl MainLoopConfig {
    pub fn new(max_idle_timeout: Option<Duration>) -> Self {
        Self {
            max_idle_timeout,
            get_task_block_s: GET_TASK_BLOCK_S,
        }
    }
}

/// Run the fetch/idle/shutdown loop until it decides to stop. Every exit
/// path -- idle-timeout scale-down, coordinator-issued termination, or the
/// cooperative `shutdown` token firing -- goes through `termination` so
/// exactly one `TaskRunnerTerminated` is ever published (see
/// [`TerminationHandler::log_termination`]).
pub async fn run(
    api: Arc<ApiClient>,
    handler: Arc<TaskRequestHandler>,
    termination: Arc<TerminationHandler>,
    config: MainLoopConfig,
    shutdown: CancellationToken,
) {
    let mut idle_since = Instant::now();

    loop {
        if shutdown.is_cancelled() {
            tracing::info!("shutdown requested, exiting fetch loop");
            return;
        }

        if let Some(max_idle) = config.max_idle_timeout {
            if idle_since.elapsed() >= max_idle {
                match api.kill_machine().await {
                    Ok(422) => {
                        tracing::info!("scale-down request refused, staying alive");
                        idle_since = Instant::now();
                    }
                    Ok(status) => {
                        tracing::info!(status, "scale-down accepted, terminating");
                        termination
                            .log_termination(
                                TaskRunnerTerminationReason::IdleTimeout,
                                Some(format!("idle for {:?}", max_idle)),
                                None,
                            )
                            .await;
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "kill_machine request failed, will retry once idle again");
                        idle_since = Instant::now();
                    }
                }
                continue;
            }
        }

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested during long-poll, exiting fetch loop");
                return;
            }
            outcome = api.get_task(config.get_task_block_s) => outcome,
        };

        match outcome {
            Ok(GetTaskOutcome::Success(request)) => {
                handler.handle(request).await;
                idle_since = Instant::now();
            }
            Ok(GetTaskOutcome::NoContent) => {
                tokio::time::sleep(NO_CONTENT_BACKOFF).await;
            }
            Ok(GetTaskOutcome::InternalError) => {
                tracing::warn!("coordinator reported an internal error, backing off");
                tokio::time::sleep(INTERNAL_ERROR_BACKOFF).await;
            }
            Err(ApiClientError::Termination { reason, detail }) => {
                tracing::info!(reason, ?detail, "coordinator requested termination");
                termination
                    .log_termination(TaskRunnerTerminationReason::parse(&reason), detail, None)
                    .await;
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "get_task failed, retrying after backoff");
                tokio::time::sleep(CONNECTION_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Wait for `SIGINT` or `SIGTERM`, then log the runner's termination as
/// `interrupted` and cancel `shutdown` so [`run`] stops picking up new
/// work. Does not itself wait for any in-flight task: that happens
/// naturally inside [`run`], which finishes its current `handler.handle`
/// call before re-checking `shutdown`.
pub async fn install_signal_handlers(
    termination: Arc<TerminationHandler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!(signal = received, "received shutdown signal");

    termination
        .log_termination(
            TaskRunnerTerminationReason::Interrupted,
            Some(format!("received {received}")),
            None,
        )
        .await;
    shutdown.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::ArtifactStoreClient;
    use crate::command::CommandRegistry;
    use crate::config::ApiCredential;
    use crate::event_logger::EventLogger;
    use crate::image_cache::ImageCache;
    use crate::message_listener::MessageListener;
    use crate::mpi::MpiClusterConfig;
    use crate::observers::ObserverManager;
    use uuid::Uuid;

    fn test_api() -> Arc<ApiClient> {
        let api = Arc::new(
            ApiClient::new(
                "http://127.0.0.1:1",
                ApiCredential::UserApiKey("test".to_string()),
            )
            .unwrap(),
        );
        api.set_runner_id_for_test(Uuid::nil());
        api
    }

    fn test_handler(api: Arc<ApiClient>) -> Arc<TaskRequestHandler> {
        let event_logger = Arc::new(EventLogger::new(api.clone()));
        let artifact_store = Arc::new(ArtifactStoreClient::new(api.clone()).unwrap());
        let image_cache = Arc::new(
            ImageCache::new(tempfile::tempdir().unwrap().keep(), None).unwrap(),
        );
        let command_registry = Arc::new(CommandRegistry::with_defaults());
        let observer_manager = Arc::new(ObserverManager::new(Uuid::nil(), event_logger.clone()));
        let message_listener = Arc::new(MessageListener::new(api.clone()));
        Arc::new(TaskRequestHandler::new(
            api,
            event_logger,
            artifact_store,
            image_cache,
            command_registry,
            observer_manager,
            message_listener,
            Uuid::nil(),
            tempfile::tempdir().unwrap().keep(),
            true,
            false,
            MpiClusterConfig::disabled(),
        ))
    }

    #[tokio::test]
    async fn shutdown_token_stops_the_loop_without_fetching() {
        let api = test_api();
        let handler = test_handler(api.clone());
        let termination = Arc::new(TerminationHandler::new(
            Uuid::nil(),
            Arc::new(EventLogger::new(api.clone())),
            handler.clone(),
        ));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let config = MainLoopConfig::new(None);
        // Must return promptly instead of hanging on a long-poll against
        // the unreachable test host.
        tokio::time::timeout(
            Duration::from_secs(2),
            run(api, handler, termination, config, shutdown),
        )
        .await
        .expect("loop did not exit promptly on a pre-cancelled shutdown token");
    }
}
