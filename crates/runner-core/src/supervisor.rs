//! Subprocess Supervisor: runs one argv list as a child process in its own
//! process group, fans out its stdout/stderr to file sinks, and terminates
//! it deterministically on request.
//!
//! Grounded in `task_runner.executers.subprocess_tracker.SubprocessTracker`:
//! same default timing constants, same SIGTERM-then-SIGKILL escalation,
//! same "whole process group" targeting via `killpg`.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

/// Default delay after SIGTERM before escalating to SIGKILL.
pub const DEFAULT_SIGKILL_DELAY: Duration = Duration::from_secs(1);
/// Default poll interval while waiting for graceful exit.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Default overall budget for `terminate()` to observe exit.
pub const DEFAULT_SIGTERM_TIMEOUT: Duration = Duration::from_secs(5);

/// One subprocess invocation: argv, working directory, stdin contents, and
/// where stdout/stderr lines should be appended.
pub struct SubprocessSpec {
    pub argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin_contents: String,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Runs one child process and owns its lifecycle.
pub struct Supervisor {
    child: Child,
    pid: i32,
    stdout_task: tokio::task::JoinHandle<Result<()>>,
    stderr_task: tokio::task::JoinHandle<Result<()>>,
    terminating: Arc<AtomicBool>,
}

impl Supervisor {
    /// Start the process in its own session (and therefore its own process
    /// group), with stdin/stdout/stderr all piped, and begin draining the
    /// two output streams into their file sinks. Returns immediately once
    /// the child has been spawned; does not wait for it to finish.
    pub async fn run(spec: SubprocessSpec) -> Result<Self> {
        let mut command = Command::new(
            spec.argv
                .first()
                .context("subprocess argv must not be empty")?,
        );
        command
            .args(&spec.argv[1..])
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        // New session => new process group, whose leader is this child.
        // SIGTERM/SIGKILL sent with a negated pid reach the whole group.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", spec.argv))?;
        let pid = child
            .id()
            .context("spawned child has no pid (already reaped?)")? as i32;

        if let Some(mut stdin) = child.stdin.take() {
            let contents = spec.stdin_contents;
            stdin
                .write_all(contents.as_bytes())
                .await
                .context("failed to write stdin to subprocess")?;
            drop(stdin);
        }

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let stdout_task = tokio::spawn(log_stream(stdout, spec.stdout_path));
        let stderr_task = tokio::spawn(log_stream(stderr, spec.stderr_path));

        Ok(Self {
            child,
            pid,
            stdout_task,
            stderr_task,
            terminating: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Block until the process exits, invoking `on_tick` every `period`
    /// while waiting. If either sink reader task panicked or errored, that
    /// error is propagated once the process has exited.
    pub async fn wait(&mut self, period: Duration, mut on_tick: impl FnMut()) -> Result<i32> {
        loop {
            tokio::select! {
                status = self.child.wait() => {
                    let status = status.context("failed to wait on subprocess")?;
                    return self.finish(exit_code_of(status)).await;
                }
                _ = tokio::time::sleep(period) => {
                    on_tick();
                }
            }
        }
    }

    /// Graceful termination: SIGTERM the process group, wait up to
    /// `sigkill_delay` for a clean exit, SIGKILL if still alive, then keep
    /// polling at `check_interval` up to `sigterm_timeout` total.
    ///
    /// Returns `true` if this call actually terminated a still-running
    /// process; `false` if the process had already exited or a previous
    /// call to `terminate()` is already in flight (idempotence per §4.9).
    pub async fn terminate(&mut self) -> Result<bool> {
        if self
            .terminating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(false);
        }

        self.signal(libc::SIGTERM)?;

        let deadline = tokio::time::Instant::now() + DEFAULT_SIGTERM_TIMEOUT;
        let mut sigkill_sent = false;
        let sigkill_at = tokio::time::Instant::now() + DEFAULT_SIGKILL_DELAY;

        loop {
            if let Ok(Some(_)) = self.child.try_wait() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            if !sigkill_sent && tokio::time::Instant::now() >= sigkill_at {
                self.signal(libc::SIGKILL)?;
                sigkill_sent = true;
            }
            tokio::time::sleep(DEFAULT_CHECK_INTERVAL).await;
        }

        // Final attempt: block on wait() even past the timeout rather than
        // leave a zombie, matching the source's "join threads regardless".
        let _ = self.child.wait().await;
        Ok(true)
    }

    fn signal(&self, sig: i32) -> Result<()> {
        // Negative pid targets the whole process group (the session leader
        // created via `setsid` above).
        let rc = unsafe { libc::kill(-self.pid, sig) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH ("no such process") just means it already exited.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).context("failed to signal subprocess group");
            }
        }
        Ok(())
    }

    async fn finish(&mut self, exit_code: i32) -> Result<i32> {
        // Re-raise the first reader-task error, if any, after the process
        // has actually exited -- matches `wait()` re-raising a reader
        // thread's exception in the Python source.
        let stdout_result = (&mut self.stdout_task).await;
        let stderr_result = (&mut self.stderr_task).await;
        match stdout_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.context("stdout sink reader failed")),
            Err(join_err) => return Err(join_err.into()),
        }
        match stderr_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.context("stderr sink reader failed")),
            Err(join_err) => return Err(join_err.into()),
        }
        Ok(exit_code)
    }
}

/// POSIX convention: negative exit code if killed by a signal.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        -signal
    } else {
        -1
    }
}

/// Drain a child output stream line by line into a file sink. Flushes after
/// every line so a concurrent tail of the file sees output promptly.
async fn log_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    sink_path: PathBuf,
) -> Result<()> {
    let mut sink = File::options()
        .create(true)
        .append(true)
        .open(&sink_path)
        .await
        .with_context(|| format!("failed to open sink file {}", sink_path.display()))?;

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read subprocess output line")?
    {
        sink.write_all(line.as_bytes()).await?;
        sink.write_all(b"\n").await?;
        sink.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn spec(argv: Vec<String>, dir: &std::path::Path) -> SubprocessSpec {
        SubprocessSpec {
            argv,
            working_dir: None,
            env: vec![],
            stdin_contents: String::new(),
            stdout_path: dir.join("stdout.txt"),
            stderr_path: dir.join("stderr.txt"),
        }
    }

    #[tokio::test]
    async fn runs_to_completion_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo.sh", "echo hello; echo world >&2");

        let mut sup = Supervisor::run(spec(vec![script.to_string_lossy().into()], dir.path()))
            .await
            .unwrap();
        let code = sup.wait(Duration::from_millis(10), || {}).await.unwrap();
        assert_eq!(code, 0);

        let stdout = std::fs::read_to_string(dir.path().join("stdout.txt")).unwrap();
        assert_eq!(stdout, "hello\n");
        let stderr = std::fs::read_to_string(dir.path().join("stderr.txt")).unwrap();
        assert_eq!(stderr, "world\n");
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "exit 7");

        let mut sup = Supervisor::run(spec(vec![script.to_string_lossy().into()], dir.path()))
            .await
            .unwrap();
        let code = sup.wait(Duration::from_millis(10), || {}).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn terminate_kills_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep.sh", "sleep 30");

        let mut sup = Supervisor::run(spec(vec![script.to_string_lossy().into()], dir.path()))
            .await
            .unwrap();

        let terminated = sup.terminate().await.unwrap();
        assert!(terminated);

        let code = sup.wait(Duration::from_millis(10), || {}).await.unwrap();
        assert!(code < 0, "expected signal-killed negative exit code, got {code}");
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep.sh", "sleep 30");

        let mut sup = Supervisor::run(spec(vec![script.to_string_lossy().into()], dir.path()))
            .await
            .unwrap();

        assert!(sup.terminate().await.unwrap());
        assert!(!sup.terminate().await.unwrap());
    }

    #[tokio::test]
    async fn terminate_on_already_exited_process_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fast.sh", "true");

        let mut sup = Supervisor::run(spec(vec![script.to_string_lossy().into()], dir.path()))
            .await
            .unwrap();
        let _ = sup.wait(Duration::from_millis(10), || {}).await.unwrap();

        assert!(!sup.terminate().await.unwrap());
    }
}
