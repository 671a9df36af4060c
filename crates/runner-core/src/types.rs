//! Data model shared across the runner: task requests/results, metrics, and
//! the container image cache entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task as handed to the runner by the coordinator.
///
/// `extra_params` is deliberately untyped JSON: its shape is owned by
/// whichever [`crate::command::CommandBuilder`] the `simulator` name
/// resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    pub project_id: String,
    #[serde(rename = "task_dir_remote")]
    pub task_dir_remote: String,
    pub container_image: String,
    pub simulator: String,
    pub extra_params: serde_json::Value,
    #[serde(default)]
    pub time_to_live_seconds: Option<u64>,
    #[serde(default)]
    pub submitted_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Final classification of a task, published in `TaskOutputUploaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Success,
    Failed,
    Killed,
    TtlExceeded,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
            TaskStatus::TtlExceeded => "ttl-exceeded",
        };
        write!(f, "{s}")
    }
}

/// Outcome of running one task to completion, independent of upload.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub last_exit_code: i32,
    pub metrics: HashMap<String, f64>,
}

/// Names for the metrics the handler posts over the lifetime of a task.
/// Kept as string constants (not an enum) because the API treats metric
/// names as opaque strings; this just pins the vocabulary in one place.
pub mod metric_names {
    pub const QUEUE_TIME_S: &str = "queue_time_s";
    pub const COMPUTATION_S: &str = "computation_s";
    pub const DOWNLOAD_INPUT_S: &str = "download_input_s";
    pub const UNCOMPRESS_INPUT_S: &str = "uncompress_input_s";
    pub const UPLOAD_OUTPUT_S: &str = "upload_output_s";
    pub const COMPRESS_OUTPUT_S: &str = "compress_output_s";
    pub const DOWNLOAD_CONTAINER_S: &str = "download_container_s";
    pub const CONTAINER_SIZE_BYTES: &str = "container_size_bytes";
    pub const INPUT_SIZE_BYTES: &str = "input_size_bytes";
    pub const INPUT_ZIPPED_BYTES: &str = "input_zipped_bytes";
    pub const OUTPUT_SIZE_BYTES: &str = "output_size_bytes";
    pub const OUTPUT_ZIPPED_BYTES: &str = "output_zipped_bytes";
    pub const OUTPUT_TOTAL_FILES: &str = "output_total_files";
}

/// Where a resolved container image file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSource {
    Local,
    Cache,
    Hub,
    UserStorage,
}

/// A resolved, locally-available container image.
#[derive(Debug, Clone)]
pub struct ContainerImageEntry {
    pub local_path: std::path::PathBuf,
    pub size_bytes: u64,
    pub source: ImageSource,
    pub elapsed_s: f64,
}

/// Identity assigned to this process by the coordinator at registration.
#[derive(Debug, Clone)]
pub struct RunnerRegistration {
    pub runner_id: Uuid,
    pub machine_group_id: Uuid,
}
