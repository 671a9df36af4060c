//! Task Request Handler: the state machine of one task, picked-up through
//! output-uploaded (or failed/killed/ttl-exceeded).
//!
//! Grounded in `task_runner.executer_tracker.ExecuterTracker.handle_task`,
//! generalized from its Python try/except/finally shape into the
//! catch-at-the-top `execute` / `fail_task` split below: every step from
//! resolving the container image through posting the upload metrics runs
//! inside [`TaskRequestHandler::execute`], and any error it returns --
//! unless it's one the step already turned into a classified task status --
//! is caught once in [`TaskRequestHandler::handle`] and reported as
//! `TaskExecutionFailed`, per the "root-cause extraction" design note.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::artifact_store::ArtifactStoreClient;
use crate::cancellation::{CancellationCore, StopSignal};
use crate::command::CommandRegistry;
use crate::event_logger::EventLogger;
use crate::events::{Event, EventBody};
use crate::executer::{Executer, ExecuterConfig, ExecuterError, ExecuterObserver};
use crate::image_cache::ImageCache;
use crate::message_listener::{self, MessageListener};
use crate::mpi::MpiClusterConfig;
use crate::observers::{Observer, ObserverManager};
use crate::system_monitor::{self, SystemMonitor};
use crate::termination::RunningTask;
use crate::types::{TaskRequest, TaskStatus, metric_names};

/// Everything the handler needs beyond the API client itself to drive one
/// task, gathered here so `crates/runner`'s `main.rs` only has to build this
/// once at startup.
pub struct TaskRequestHandler {
    api: Arc<crate::api_client::ApiClient>,
    event_logger: Arc<EventLogger>,
    artifact_store: Arc<ArtifactStoreClient>,
    image_cache: Arc<ImageCache>,
    command_registry: Arc<CommandRegistry>,
    observer_manager: Arc<ObserverManager>,
    message_listener: Arc<MessageListener>,
    runner_id: Uuid,
    workdir: std::path::PathBuf,
    local_mode: bool,
    on_gpu: bool,
    mpi_config: MpiClusterConfig,
    running: Mutex<Option<RunningState>>,
    shutting_down: AtomicBool,
}

struct RunningState {
    task_id: String,
    cancel_tx: mpsc::Sender<StopSignal>,
}

/// Shared between the handler and the message-forwarding task it spawns per
/// task: lets a kill that arrives before the executer exists still be
/// observed once it does, and gives the handler somewhere to send a kill
/// that arrives mid-resolve without waiting for the cancellation core.
#[derive(Default)]
struct EarlyStop {
    killed: AtomicBool,
    cancel_tx: Mutex<Option<mpsc::Sender<StopSignal>>>,
}

/// What one control message addressed to a task means, decided independently
/// of any I/O so it can be unit tested directly.
enum TaskMessage {
    Kill,
    Interrupt,
    Done,
    Observer(Observer),
    Unrecognized,
}

fn classify_message(raw: &str) -> TaskMessage {
    match raw {
        message_listener::KILL_MESSAGE => TaskMessage::Kill,
        message_listener::INTERRUPT_MESSAGE => TaskMessage::Interrupt,
        message_listener::TASK_DONE_MESSAGE => TaskMessage::Done,
        other => match serde_json::from_str::<Observer>(other) {
            Ok(observer) => TaskMessage::Observer(observer),
            Err(_) => TaskMessage::Unrecognized,
        },
    }
}

/// Walk an `anyhow::Error`'s cause chain to the innermost error, the way the
/// coordinator's crash reports expect `error_message` to read -- the
/// `Context` wrapping added at each step stays in the full `traceback` field
/// instead.
fn root_cause(err: &anyhow::Error) -> String {
    err.chain().last().unwrap_or_else(|| err.as_ref()).to_string()
}

impl TaskRequestHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<crate::api_client::ApiClient>,
        event_logger: Arc<EventLogger>,
        artifact_store: Arc<ArtifactStoreClient>,
        image_cache: Arc<ImageCache>,
        command_registry: Arc<CommandRegistry>,
        observer_manager: Arc<ObserverManager>,
        message_listener: Arc<MessageListener>,
        runner_id: Uuid,
        workdir: std::path::PathBuf,
        local_mode: bool,
        on_gpu: bool,
        mpi_config: MpiClusterConfig,
    ) -> Self {
        Self {
            api,
            event_logger,
            artifact_store,
            image_cache,
            command_registry,
            observer_manager,
            message_listener,
            runner_id,
            workdir,
            local_mode,
            on_gpu,
            mpi_config,
            running: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Run one task to completion. Never returns an error: every failure
    /// mode from here down is reported to the coordinator as an event
    /// instead of being propagated to the main loop.
    pub async fn handle(&self, request: TaskRequest) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let task_id = request.id.clone();
        tracing::info!(task_id, simulator = %request.simulator, "task picked up");
        self.publish(&task_id, EventBody::TaskPickedUp).await;

        let early_stop = Arc::new(EarlyStop::default());
        let forwarder = self.spawn_message_forwarder(task_id.clone(), early_stop.clone());

        let working_dir = self.workdir.join(&task_id);
        match self.execute(&request, &early_stop, &working_dir).await {
            Ok(Some(status)) => self.finish_success(&task_id, &working_dir, status).await,
            Ok(None) => {}
            Err(err) => self.fail_task(&task_id, &working_dir, err).await,
        }

        tokio::fs::remove_dir_all(&working_dir).await.ok();
        self.message_listener.unblock(&task_id).await;
        let _ = forwarder.await;
        *self.running.lock().unwrap() = None;
    }

    /// Steps 2-9 of the handler sequence. `Ok(None)` means the task was
    /// found already killed right after container resolution and no work
    /// was attempted; `Ok(Some(status))` is the classified outcome of a run
    /// that actually executed.
    async fn execute(
        &self,
        request: &TaskRequest,
        early_stop: &Arc<EarlyStop>,
        working_dir: &Path,
    ) -> Result<Option<TaskStatus>> {
        let task_id = &request.id;
        let queue_time_s = request
            .submitted_at
            .map(|submitted| (chrono::Utc::now() - submitted).num_milliseconds() as f64 / 1000.0);

        // Step 2: resolve the container image.
        let image_entry = self
            .image_cache
            .get(&request.container_image, &self.artifact_store)
            .await
            .context("failed to resolve container image")?;

        if early_stop.killed.load(Ordering::SeqCst) {
            self.publish(task_id, EventBody::TaskKilled).await;
            return Ok(None);
        }

        // Step 3: stage the working directory.
        tokio::fs::create_dir_all(working_dir)
            .await
            .context("failed to create task working directory")?;
        let download_started = Instant::now();
        let (input_zipped_bytes, input_size_bytes, uncompress_input_s) = self
            .artifact_store
            .download_input(task_id, working_dir)
            .await
            .context("failed to download task input")?;
        let download_input_s = download_started.elapsed().as_secs_f64();

        for resource in &request.resources {
            let dest = working_dir.join("sim_dir").join(resource);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            self.artifact_store
                .download_file(resource, &dest)
                .await
                .with_context(|| format!("failed to download auxiliary resource '{resource}'"))?;
        }

        if early_stop.killed.load(Ordering::SeqCst) {
            self.publish(task_id, EventBody::TaskKilled).await;
            return Ok(None);
        }

        // Step 4: publish work-started and the input-staging metrics.
        self.publish(task_id, EventBody::TaskWorkStarted).await;
        self.api
            .post_task_metric(task_id, metric_names::DOWNLOAD_INPUT_S, download_input_s)
            .await;
        self.api
            .post_task_metric(task_id, metric_names::INPUT_ZIPPED_BYTES, input_zipped_bytes as f64)
            .await;
        self.api
            .post_task_metric(task_id, metric_names::INPUT_SIZE_BYTES, input_size_bytes as f64)
            .await;
        self.api
            .post_task_metric(task_id, metric_names::UNCOMPRESS_INPUT_S, uncompress_input_s)
            .await;
        self.api
            .post_task_metric(
                task_id,
                metric_names::CONTAINER_SIZE_BYTES,
                image_entry.size_bytes as f64,
            )
            .await;
        self.api
            .post_task_metric(
                task_id,
                metric_names::DOWNLOAD_CONTAINER_S,
                image_entry.elapsed_s,
            )
            .await;
        if let Some(queue_time_s) = queue_time_s {
            self.api
                .post_task_metric(task_id, metric_names::QUEUE_TIME_S, queue_time_s)
                .await;
        }

        // Step 5: build the executer for this simulator.
        let builder = self
            .command_registry
            .get(&request.simulator)
            .with_context(|| format!("unknown simulator '{}'", request.simulator))?;
        let observer = Arc::new(HandlerExecuterObserver::new(
            task_id.clone(),
            self.runner_id,
            self.event_logger.clone(),
        ));
        let executer_config = ExecuterConfig {
            working_dir: working_dir.to_path_buf(),
            container_image: image_entry.local_path.clone(),
            mpi_config: self.mpi_config.clone(),
            extra_params: request.extra_params.clone(),
            local_mode: self.local_mode,
            on_gpu: self.on_gpu,
        };
        let executer = Arc::new(
            Executer::new(executer_config, builder, observer.clone())
                .context("failed to construct executer")?,
        );

        // Step 6: TTL timer, cancellation core, system monitor, and observer
        // sweep, all racing against the same stop signal.
        let ttl = request.time_to_live_seconds.map(Duration::from_secs);
        let cancel_core = CancellationCore::spawn(executer.clone(), ttl);
        let flags = cancel_core.flags();
        {
            let mut slot = early_stop.cancel_tx.lock().unwrap();
            *slot = Some(cancel_core.sender());
        }
        if early_stop.killed.load(Ordering::SeqCst) {
            let _ = cancel_core.sender().send(StopSignal::Kill).await;
        }
        *self.running.lock().unwrap() = Some(RunningState {
            task_id: task_id.clone(),
            cancel_tx: cancel_core.sender(),
        });

        let system_monitor = Arc::new(SystemMonitor::new(
            task_id.clone(),
            self.runner_id,
            self.event_logger.clone(),
            Some(system_monitor::DEFAULT_STALLED_THRESHOLD),
            executer.artifacts_dir(),
        )?);
        observer.bind_system_monitor(system_monitor.clone());

        let sim_dir = working_dir.join("sim_dir");
        let monitor_handle = {
            let system_monitor = system_monitor.clone();
            let artifacts_dir = executer.artifacts_dir().clone();
            let stop = cancel_core.stop_signal();
            tokio::spawn(async move { system_monitor.run(&artifacts_dir, stop).await })
        };
        let observer_handle = {
            let observer_manager = self.observer_manager.clone();
            let stop = cancel_core.stop_signal();
            tokio::spawn(async move { observer_manager.run(&sim_dir, stop).await })
        };

        // Step 7: run the command sequence.
        let run_started = Instant::now();
        let run_result = executer.run().await;
        let computation_s = run_started.elapsed().as_secs_f64();

        cancel_core.finish().await;
        let _ = monitor_handle.await;
        let _ = observer_handle.await;
        *self.running.lock().unwrap() = None;

        // Step 8: work-finished and the computation metric.
        self.publish(task_id, EventBody::TaskWorkFinished).await;
        self.api
            .post_task_metric(task_id, metric_names::COMPUTATION_S, computation_s)
            .await;

        // Step 9: classify the outcome. A kill or TTL expiry always wins
        // over whatever exit code the subprocess happened to end up with.
        let status = if flags.task_killed() {
            TaskStatus::Killed
        } else if flags.ttl_exceeded() {
            TaskStatus::TtlExceeded
        } else {
            match run_result {
                Ok(0) => TaskStatus::Success,
                Ok(_) => TaskStatus::Failed,
                Err(ExecuterError::SubProcess(_)) => TaskStatus::Failed,
                Err(ExecuterError::Killed) => TaskStatus::Failed,
                Err(ExecuterError::Other(err)) => return Err(err.context("executer failed")),
            }
        };

        Ok(Some(status))
    }

    /// Step 10 on the success path: zip and upload `output/`, then publish
    /// whichever of `TaskOutputUploaded`/`TaskOutputUploadFailed` applies.
    async fn finish_success(&self, task_id: &str, working_dir: &Path, status: TaskStatus) {
        let output_dir = working_dir.join(crate::executer::OUTPUT_DIRNAME);
        let upload_started = Instant::now();
        match self.artifact_store.upload_output(task_id, &output_dir).await {
            Ok((uncompressed_bytes, compressed_bytes, total_files, compress_output_s)) => {
                let upload_output_s = upload_started.elapsed().as_secs_f64();
                self.api
                    .post_task_metric(task_id, metric_names::UPLOAD_OUTPUT_S, upload_output_s)
                    .await;
                self.api
                    .post_task_metric(task_id, metric_names::COMPRESS_OUTPUT_S, compress_output_s)
                    .await;
                self.api
                    .post_task_metric(
                        task_id,
                        metric_names::OUTPUT_SIZE_BYTES,
                        uncompressed_bytes as f64,
                    )
                    .await;
                self.api
                    .post_task_metric(
                        task_id,
                        metric_names::OUTPUT_ZIPPED_BYTES,
                        compressed_bytes as f64,
                    )
                    .await;
                self.api
                    .post_task_metric(task_id, metric_names::OUTPUT_TOTAL_FILES, total_files as f64)
                    .await;
                self.publish(
                    task_id,
                    EventBody::TaskOutputUploaded {
                        new_status: status.to_string(),
                        output_size_bytes: uncompressed_bytes,
                    },
                )
                .await;
            }
            Err(err) => {
                self.publish(
                    task_id,
                    EventBody::TaskOutputUploadFailed {
                        error_message: root_cause(&err),
                        traceback: format!("{err:?}"),
                    },
                )
                .await;
            }
        }
    }

    /// Any unhandled error from [`Self::execute`]: publish
    /// `TaskExecutionFailed`, then attempt the same upload step on a
    /// best-effort basis so partial output isn't lost.
    async fn fail_task(&self, task_id: &str, working_dir: &Path, err: anyhow::Error) {
        tracing::error!(task_id, %err, "task execution failed");
        self.publish(
            task_id,
            EventBody::TaskExecutionFailed {
                error_message: root_cause(&err),
                traceback: format!("{err:?}"),
            },
        )
        .await;

        let output_dir = working_dir.join(crate::executer::OUTPUT_DIRNAME);
        if !output_dir.exists() {
            return;
        }
        match self.artifact_store.upload_output(task_id, &output_dir).await {
            Ok((uncompressed_bytes, _, _, _)) => {
                self.publish(
                    task_id,
                    EventBody::TaskOutputUploaded {
                        new_status: TaskStatus::Failed.to_string(),
                        output_size_bytes: uncompressed_bytes,
                    },
                )
                .await;
            }
            Err(upload_err) => {
                self.publish(
                    task_id,
                    EventBody::TaskOutputUploadFailed {
                        error_message: root_cause(&upload_err),
                        traceback: format!("{upload_err:?}"),
                    },
                )
                .await;
            }
        }
    }

    async fn publish(&self, task_id: &str, body: EventBody) {
        let event = Event::new(task_id.to_string(), self.runner_id, body);
        self.event_logger.log(&event).await;
    }

    /// Spawn the task that long-polls the Message Listener for the lifetime
    /// of one task, forwarding kill/interrupt into whichever cancellation
    /// core is current (or recording an early kill if none exists yet) and
    /// registering any observer payloads it receives. Exits once the
    /// coordinator sends the "done" message after [`MessageListener::unblock`].
    fn spawn_message_forwarder(
        &self,
        task_id: String,
        early_stop: Arc<EarlyStop>,
    ) -> tokio::task::JoinHandle<()> {
        let message_listener = self.message_listener.clone();
        let observer_manager = self.observer_manager.clone();
        tokio::spawn(async move {
            loop {
                let message = message_listener.receive(&task_id).await;
                match classify_message(&message) {
                    TaskMessage::Kill => {
                        early_stop.killed.store(true, Ordering::SeqCst);
                        if let Some(tx) = early_stop.cancel_tx.lock().unwrap().clone() {
                            let _ = tx.send(StopSignal::Kill).await;
                        }
                    }
                    TaskMessage::Interrupt => {
                        if let Some(tx) = early_stop.cancel_tx.lock().unwrap().clone() {
                            let _ = tx.send(StopSignal::Interrupt).await;
                        }
                    }
                    TaskMessage::Observer(observer) => {
                        observer_manager.start_observing(observer);
                    }
                    TaskMessage::Done => break,
                    TaskMessage::Unrecognized => {
                        tracing::warn!(task_id, message, "unrecognized task message");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl RunningTask for TaskRequestHandler {
    fn running_task_id(&self) -> Option<String> {
        self.running.lock().unwrap().as_ref().map(|s| s.task_id.clone())
    }

    async fn interrupt(&self) {
        let tx = self.running.lock().unwrap().as_ref().map(|s| s.cancel_tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(StopSignal::Interrupt).await;
        }
    }

    fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

/// Forwards the executer's events to the Event Logger and its current-argv
/// changes to the System Monitor. The monitor doesn't exist yet when the
/// executer is constructed, so it's bound in afterward.
struct HandlerExecuterObserver {
    task_id: String,
    runner_id: Uuid,
    event_logger: Arc<EventLogger>,
    system_monitor: Mutex<Option<Arc<SystemMonitor>>>,
}

impl HandlerExecuterObserver {
    fn new(task_id: String, runner_id: Uuid, event_logger: Arc<EventLogger>) -> Self {
        Self {
            task_id,
            runner_id,
            event_logger,
            system_monitor: Mutex::new(None),
        }
    }

    fn bind_system_monitor(&self, monitor: Arc<SystemMonitor>) {
        *self.system_monitor.lock().unwrap() = Some(monitor);
    }
}

impl ExecuterObserver for HandlerExecuterObserver {
    fn on_event(&self, body: EventBody) {
        let event = Event::new(self.task_id.clone(), self.runner_id, body);
        let event_logger = self.event_logger.clone();
        tokio::spawn(async move { event_logger.log(&event).await });
    }

    fn on_command_changed(&self, argv: &str) {
        if let Some(monitor) = self.system_monitor.lock().unwrap().as_ref() {
            monitor.change_command(argv.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_three_fixed_control_messages() {
        assert!(matches!(classify_message("kill"), TaskMessage::Kill));
        assert!(matches!(classify_message("interrupt"), TaskMessage::Interrupt));
        assert!(matches!(classify_message("done"), TaskMessage::Done));
    }

    #[test]
    fn classifies_an_observer_registration_payload() {
        let payload = serde_json::json!({
            "observer_id": "9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d",
            "observer_type": "file_exists_observer",
            "task_id": "task-1",
            "file_path": "done.flag",
        })
        .to_string();
        assert!(matches!(classify_message(&payload), TaskMessage::Observer(_)));
    }

    #[test]
    fn unrecognized_text_does_not_panic() {
        assert!(matches!(classify_message("not json and not a keyword"), TaskMessage::Unrecognized));
    }

    #[test]
    fn root_cause_walks_to_the_innermost_error() {
        let inner = anyhow::anyhow!("disk full");
        let wrapped = inner.context("failed to write output").context("upload failed");
        assert_eq!(root_cause(&wrapped), "disk full");
    }
}
