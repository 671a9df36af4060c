//! Drives one task's command sequence: pre_process → each [`Command`] run
//! through the Supervisor inside an Apptainer invocation → post_process.
//!
//! Grounded in `task_runner.executers.base_executer.BaseExecuter`: the
//! `--no-mount cwd --home /home/apptainer --bind ... --pwd ...` apptainer
//! invocation shape, the stdout/stderr separator convention, and the
//! idempotent `terminate()`/`is_shutting_down` guard are carried over
//! directly; MPI/GPU/local-mode flags are unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::command::{BuildContext, Command, CommandBuilder};
use crate::events::EventBody;
use crate::mpi::MpiClusterConfig;
use crate::supervisor::{Supervisor, SubprocessSpec};

pub const OUTPUT_DIRNAME: &str = "output";
pub const ARTIFACTS_DIRNAME: &str = "artifacts";
pub const STDOUT_LOGS_FILENAME: &str = "stdout.txt";
pub const STDERR_LOGS_FILENAME: &str = "stderr.txt";
const CONTAINER_WORKDIR: &str = "/workdir";

#[derive(Debug, Error)]
pub enum ExecuterError {
    #[error("executer was killed")]
    Killed,
    #[error("subprocess ended with exit code: {0}")]
    SubProcess(i32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Anything the executer needs to tell the outside world about as it runs
/// one task: lifecycle events, and the currently-executing argv (consumed
/// by the System Monitor's CSV row).
pub trait ExecuterObserver: Send + Sync {
    fn on_event(&self, body: EventBody);
    fn on_command_changed(&self, argv: &str);
}

/// Configuration fixed for the lifetime of one task's executer.
pub struct ExecuterConfig {
    pub working_dir: PathBuf,
    pub container_image: PathBuf,
    pub mpi_config: MpiClusterConfig,
    pub extra_params: serde_json::Value,
    pub local_mode: bool,
    pub on_gpu: bool,
}

/// Runs one task's command sequence end to end.
pub struct Executer {
    config: ExecuterConfig,
    builder: Arc<dyn CommandBuilder>,
    observer: Arc<dyn ExecuterObserver>,
    artifacts_dir: PathBuf,
    shutting_down: Arc<AtomicBool>,
    current_subprocess: Arc<Mutex<Option<Supervisor>>>,
}

impl Executer {
    pub fn new(
        config: ExecuterConfig,
        builder: Arc<dyn CommandBuilder>,
        observer: Arc<dyn ExecuterObserver>,
    ) -> Result<Self> {
        let output_dir = config.working_dir.join(OUTPUT_DIRNAME);
        let artifacts_dir = output_dir.join(ARTIFACTS_DIRNAME);
        std::fs::create_dir_all(&artifacts_dir)?;

        Ok(Self {
            config,
            builder,
            observer,
            artifacts_dir,
            shutting_down: Arc::new(AtomicBool::new(false)),
            current_subprocess: Arc::new(Mutex::new(None)),
        })
    }

    pub fn artifacts_dir(&self) -> &PathBuf {
        &self.artifacts_dir
    }

    /// Handle shared with the Cancellation Core so `terminate()` can reach
    /// whichever subprocess happens to be running.
    pub fn current_subprocess_handle(&self) -> Arc<Mutex<Option<Supervisor>>> {
        self.current_subprocess.clone()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutting_down.clone()
    }

    fn build_context(&self) -> BuildContext {
        BuildContext {
            working_dir: self.config.working_dir.clone(),
            container_image: self.config.container_image.clone(),
            mpi_config: self.config.mpi_config.clone(),
            extra_params: self.config.extra_params.clone(),
        }
    }

    /// Run pre_process → every built command → post_process. Returns the
    /// last command's exit code (0 if there were no commands), or an error
    /// if the executer was killed mid-run or a command failed.
    pub async fn run(&self) -> std::result::Result<i32, ExecuterError> {
        let ctx = self.build_context();
        let run_started_at = std::time::SystemTime::now();

        self.builder.pre_process(&ctx, &self.artifacts_dir).await?;

        let commands = self.builder.build_commands(&ctx)?;
        let mut exit_code = 0;
        for command in &commands {
            exit_code = self.run_subprocess(command).await?;
        }

        self.builder
            .post_process(&ctx, &self.artifacts_dir, run_started_at)
            .await?;

        self.shutting_down.store(true, Ordering::SeqCst);
        Ok(exit_code)
    }

    /// Idempotent: returns `true` only the first time it actually stops a
    /// running subprocess.
    pub async fn terminate(&self) -> Result<bool> {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        let mut guard = self.current_subprocess.lock().await;
        if let Some(supervisor) = guard.as_mut() {
            supervisor.terminate().await
        } else {
            Ok(true)
        }
    }

    async fn run_subprocess(&self, command: &Command) -> std::result::Result<i32, ExecuterError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ExecuterError::Killed);
        }

        self.observer.on_command_changed(&command.argv.join(" "));

        let mpi_prefix = if command.is_mpi {
            let (version, user_args) = match &command.mpi_options {
                Some(opts) => (opts.version.as_deref(), opts.to_argv()),
                None => (None, Vec::new()),
            };
            self.config
                .mpi_config
                .build_command_prefix(version, &user_args)?
        } else {
            Vec::new()
        };

        let task_dir_host = &self.config.working_dir;
        let task_dir_container = PathBuf::from(CONTAINER_WORKDIR);
        let process_dir_container = match &command.working_dir {
            Some(rel) => task_dir_container.join(rel),
            None => task_dir_container.clone(),
        };

        let mut apptainer_args = vec![
            "apptainer".to_string(),
            "exec".to_string(),
            "--no-mount".to_string(),
            "cwd".to_string(),
            "--home".to_string(),
            "/home/apptainer".to_string(),
            "--bind".to_string(),
            format!(
                "{}:{}",
                task_dir_host.display(),
                task_dir_container.display()
            ),
            "--pwd".to_string(),
            process_dir_container.display().to_string(),
        ];
        if self.config.local_mode {
            apptainer_args.push("--writable-tmpfs".to_string());
        }
        if command.is_mpi && !self.config.local_mode {
            apptainer_args.push("--sharens".to_string());
        }
        if self.config.on_gpu {
            apptainer_args.push("--nv".to_string());
        }
        apptainer_args.push(self.config.container_image.display().to_string());

        let mut full_argv = mpi_prefix;
        full_argv.extend(apptainer_args);
        full_argv.extend(command.argv.iter().cloned());

        let plain_command = command.argv.join(" ");
        let container_command = full_argv.join(" ");

        self.observer.on_event(EventBody::TaskCommandStarted {
            command: plain_command.clone(),
            container_command: container_command.clone(),
        });

        write_separator(&self.artifacts_dir.join(STDOUT_LOGS_FILENAME), &plain_command)?;
        write_separator(&self.artifacts_dir.join(STDERR_LOGS_FILENAME), &plain_command)?;

        let spec = SubprocessSpec {
            argv: full_argv,
            working_dir: None,
            env: Vec::new(),
            stdin_contents: command.stdin_contents(),
            stdout_path: self.artifacts_dir.join(STDOUT_LOGS_FILENAME),
            stderr_path: self.artifacts_dir.join(STDERR_LOGS_FILENAME),
        };

        let mut supervisor = Supervisor::run(spec).await?;

        {
            let mut guard = self.current_subprocess.lock().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                // A kill/TTL/shutdown raced us between the flag check above
                // and the supervisor starting; terminate it immediately.
                supervisor.terminate().await?;
            }
            *guard = Some(supervisor);
        }

        let started = Instant::now();
        let exit_code = {
            let mut guard = self.current_subprocess.lock().await;
            let supervisor = guard.as_mut().expect("just inserted");
            supervisor.wait(Duration::from_secs(1), || {}).await?
        };
        let execution_time_s = started.elapsed().as_secs_f64();

        *self.current_subprocess.lock().await = None;

        self.observer.on_event(EventBody::TaskCommandFinished {
            command: plain_command,
            exit_code,
            execution_time_s,
        });

        if exit_code != 0 {
            return Err(ExecuterError::SubProcess(exit_code));
        }
        Ok(exit_code)
    }
}

fn write_separator(path: &PathBuf, command: &str) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "# COMMAND: {command}\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::arbitrary::ArbitraryCommandsBuilder;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        events: StdMutex<Vec<EventBody>>,
    }

    impl ExecuterObserver for RecordingObserver {
        fn on_event(&self, body: EventBody) {
            self.events.lock().unwrap().push(body);
        }
        fn on_command_changed(&self, _argv: &str) {}
    }

    fn config(working_dir: PathBuf, extra_params: serde_json::Value) -> ExecuterConfig {
        ExecuterConfig {
            working_dir,
            container_image: PathBuf::from("/images/test.sif"),
            mpi_config: MpiClusterConfig::disabled(),
            extra_params,
            local_mode: true,
            on_gpu: false,
        }
    }

    #[tokio::test]
    async fn creates_artifacts_directory_on_construction() {
        let working_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(working_dir.path().join("sim_dir")).unwrap();
        let observer = Arc::new(RecordingObserver {
            events: StdMutex::new(vec![]),
        });
        let extra_params = serde_json::json!({"sim_dir": "sim_dir", "commands": []});
        let executer = Executer::new(
            config(working_dir.path().to_path_buf(), extra_params),
            Arc::new(ArbitraryCommandsBuilder),
            observer,
        )
        .unwrap();

        assert!(executer.artifacts_dir().exists());
    }

    #[tokio::test]
    async fn terminate_before_any_subprocess_is_idempotent() {
        let working_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(working_dir.path().join("sim_dir")).unwrap();
        let observer = Arc::new(RecordingObserver {
            events: StdMutex::new(vec![]),
        });
        let extra_params = serde_json::json!({"sim_dir": "sim_dir", "commands": []});
        let executer = Executer::new(
            config(working_dir.path().to_path_buf(), extra_params),
            Arc::new(ArbitraryCommandsBuilder),
            observer,
        )
        .unwrap();

        assert!(executer.terminate().await.unwrap());
        assert!(!executer.terminate().await.unwrap());
    }
}
