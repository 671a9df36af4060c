//! System Monitor: two periodic samplers that run for the lifetime of one
//! task's executer -- a CPU/memory/disk-IO CSV appender and an output-stall
//! detector.
//!
//! Grounded in `task_runner.system_monitor.SystemMonitor` and the
//! `periodic_thread` helper in `executers/base_executer.py` (30 s metrics
//! interval, 60 s output-stall interval, both running until the executer's
//! shutdown flag fires). `psutil` becomes `sysinfo`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sysinfo::{Disks, System};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::event_logger::EventLogger;
use crate::events::{Event, EventBody};

pub const METRICS_FILE_NAME: &str = "system_metrics.csv";
pub const OUTPUT_MONITORING_FILE_NAME: &str = "output_update.csv";

const METRICS_INTERVAL: Duration = Duration::from_secs(30);
const OUTPUT_MONITOR_INTERVAL: Duration = Duration::from_secs(60);
/// Default output-stall threshold callers should pass when a simulator has
/// no special stall-detection requirement. Passing `None` instead disables
/// stall detection outright, for simulators with long stretches of silence.
pub const DEFAULT_STALLED_THRESHOLD: Duration = Duration::from_secs(30 * 60);

pub struct SystemMonitor {
    task_id: String,
    runner_id: Uuid,
    event_logger: std::sync::Arc<EventLogger>,
    output_stalled_threshold: Option<Duration>,
    metrics_file_path: PathBuf,
    output_monitoring_file_path: PathBuf,
    current_command: Mutex<Option<String>>,
    system: Mutex<System>,
}

impl SystemMonitor {
    /// `output_stalled_threshold`: `None` disables stall detection entirely
    /// (the source does this for simulators whose normal behavior is long
    /// stretches with no file writes, e.g. OpenFAST).
    pub fn new(
        task_id: String,
        runner_id: Uuid,
        event_logger: std::sync::Arc<EventLogger>,
        output_stalled_threshold: Option<Duration>,
        logs_dir: &Path,
    ) -> Result<Self> {
        let metrics_file_path = logs_dir.join(METRICS_FILE_NAME);
        let output_monitoring_file_path = logs_dir.join(OUTPUT_MONITORING_FILE_NAME);

        write_csv_row(
            &metrics_file_path,
            false,
            &["time", "command", "cpu-usage", "memory", "disk-input", "disk-output"],
        )
        .context("failed to create system metrics log file")?;

        Ok(Self {
            task_id,
            runner_id,
            event_logger,
            output_stalled_threshold,
            metrics_file_path,
            output_monitoring_file_path,
            current_command: Mutex::new(None),
            system: Mutex::new(System::new_all()),
        })
    }

    pub fn change_command(&self, command: String) {
        *self.current_command.lock().unwrap() = Some(command);
    }

    fn log_metrics(&self) {
        let (cpu_usage, memory_pct) = {
            let mut system = self.system.lock().unwrap();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu_usage = system.global_cpu_usage();
            let memory_pct = if system.total_memory() > 0 {
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0
            } else {
                0.0
            };
            (cpu_usage, memory_pct)
        };
        let (disk_read, disk_write) = disk_io_totals();

        let command = self.current_command.lock().unwrap().clone().unwrap_or_default();
        let row = [
            Utc::now().to_rfc3339(),
            command,
            format!("{cpu_usage:.2}"),
            format!("{memory_pct:.2}"),
            disk_read.to_string(),
            disk_write.to_string(),
        ];
        if let Err(err) = write_csv_row(&self.metrics_file_path, true, &row) {
            tracing::warn!(%err, "failed to append system metrics row");
        }
    }

    async fn monitor_output(&self, sim_artifacts_dir: &Path) {
        let Some((modified_at, file_path)) =
            most_recently_modified_file(sim_artifacts_dir, &self.metrics_file_path, &self.output_monitoring_file_path)
        else {
            return;
        };

        let row = [modified_at.to_rfc3339(), file_path.display().to_string()];
        if let Err(err) = write_csv_row(&self.output_monitoring_file_path, true, &row) {
            tracing::warn!(%err, "failed to append output-monitoring row");
        }

        let Some(threshold) = self.output_stalled_threshold else {
            return;
        };
        let stalled_since = Utc::now() - chrono::Duration::from_std(threshold).unwrap();
        if modified_at < stalled_since {
            let event = Event::new(
                self.task_id.clone(),
                self.runner_id,
                EventBody::TaskOutputStalled {
                    last_modified_file_path: file_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    last_modified_file_timestamp: modified_at,
                },
            );
            self.event_logger.log(&event).await;
        }
    }

    /// Run both periodic samplers until `stop` resolves. Intended to be
    /// spawned as its own task alongside one task's command execution.
    pub async fn run(&self, sim_artifacts_dir: &Path, stop: impl std::future::Future<Output = ()>) {
        tokio::pin!(stop);
        let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);
        let mut output_tick = tokio::time::interval(OUTPUT_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut stop => return,
                _ = metrics_tick.tick() => self.log_metrics(),
                _ = output_tick.tick() => self.monitor_output(sim_artifacts_dir).await,
            }
        }
    }
}

fn write_csv_row(path: &Path, append: bool, row: &[impl AsRef<str>]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .truncate(!append)
        .write(true)
        .open(path)?;
    let line = row
        .iter()
        .map(|field| csv_escape(field.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(file, "{line}")?;
    Ok(())
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn disk_io_totals() -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .map(|d| d.usage())
        .fold((0u64, 0u64), |(r, w), usage| {
            (r + usage.total_read_bytes, w + usage.total_written_bytes)
        })
}

/// Find the most recently modified regular file under `dir`, excluding the
/// monitor's own log files so they don't perpetually "reset the clock" on
/// themselves.
fn most_recently_modified_file(
    dir: &Path,
    metrics_file: &Path,
    output_monitoring_file: &Path,
) -> Option<(DateTime<Utc>, PathBuf)> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path() != metrics_file && e.path() != output_monitoring_file)
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((DateTime::<Utc>::from(modified), e.path().to_path_buf()))
        })
        .max_by_key(|(modified, _)| *modified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_most_recently_written_file_excluding_monitor_logs() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = dir.path().join(METRICS_FILE_NAME);
        let monitoring = dir.path().join(OUTPUT_MONITORING_FILE_NAME);
        std::fs::write(&metrics, "ignored").unwrap();
        std::fs::write(&monitoring, "ignored").unwrap();

        let older = dir.path().join("a.log");
        std::fs::write(&older, "first").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let newer = dir.path().join("b.log");
        std::fs::write(&newer, "second").unwrap();

        let (_, path) = most_recently_modified_file(dir.path(), &metrics, &monitoring).unwrap();
        assert_eq!(path, newer);
    }

    #[test]
    fn csv_escapes_fields_containing_commas() {
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("plain"), "plain");
    }
}
