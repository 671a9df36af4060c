//! API Client: a thin typed layer over the coordinator's HTTP surface.
//!
//! Grounded in `task_runner.api_client.ApiClient`: one request method shared
//! by every operation, a single auth header attached once at construction,
//! and a fixed request timeout. `get_task`'s four-way outcome and the
//! termination-error path are spelled out explicitly in the component design
//! (the Python source's `task_execution_loop.py` actually references an
//! `HTTPStatus` enum that doesn't exist in this file's `ApiClient` -- one of
//! the overlapping-draft inconsistencies the spec calls out; this
//! implementation follows the documented contract, not that drift).

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ApiCredential;
use crate::events::Event;
use crate::types::{RunnerRegistration, TaskRequest};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("http request to {path} failed")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("task runner was told to terminate: {reason} ({detail:?})")]
    Termination { reason: String, detail: Option<String> },
    #[error("unexpected response status {status} from {path}: {body}")]
    UnexpectedStatus {
        status: u16,
        path: String,
        body: String,
    },
}

/// Outcome of a single `get_task` long-poll, per §4.4/§4.13.
pub enum GetTaskOutcome {
    Success(TaskRequest),
    NoContent,
    InternalError,
}

#[derive(Debug, Serialize)]
struct RegisterPayload {
    create_time: chrono::DateTime<chrono::Utc>,
    cpu_count_logical: usize,
    cpu_count_physical: usize,
    memory: u64,
    host_name: String,
    host_id: String,
    mpi_cluster: bool,
    num_mpi_hosts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine_group_id: Option<Uuid>,
}

/// Everything the caller needs to fill in [`RegisterPayload`]; kept separate
/// from [`RunnerConfig`](crate::config::RunnerConfig) so tests can construct
/// it without an environment.
pub struct RegistrationInfo {
    pub cpu_count_logical: usize,
    pub cpu_count_physical: usize,
    pub memory_bytes: u64,
    pub host_name: String,
    pub host_id: String,
    pub mpi_cluster: bool,
    pub num_mpi_hosts: usize,
    pub machine_group_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    executer_tracker_id: Uuid,
    machine_group_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlInfo {
    pub url: String,
    pub method: String,
}

#[derive(Debug, Deserialize)]
struct UrlResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct TerminationBody {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Client for the coordinator's `/executer-tracker/...` and `/storage/...`
/// surface. Stateless apart from the runner id cached once at registration.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credential: ApiCredential,
    runner_id: std::sync::OnceLock<Uuid>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, credential: ApiCredential) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            credential,
            runner_id: std::sync::OnceLock::new(),
        })
    }

    fn runner_id(&self) -> Uuid {
        *self
            .runner_id
            .get()
            .expect("runner_id read before register_task_runner completed")
    }

    fn auth_header(&self) -> (&'static str, &str) {
        match &self.credential {
            ApiCredential::UserApiKey(key) => ("X-API-Key", key.as_str()),
            ApiCredential::RunnerToken(token) => ("X-Executer-Tracker-Token", token.as_str()),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        tracing::debug!(%method, %url, "api request");
        let (header, value) = self.auth_header();
        self.http.request(method, url).header(header, value)
    }

    fn tracker_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.request(
            method,
            &format!("executer-tracker/{}", path.trim_start_matches('/')),
        )
    }

    /// Test-only escape hatch for exercising calls that need a runner id
    /// without going through a real `register_task_runner` round trip.
    #[cfg(test)]
    pub fn set_runner_id_for_test(&self, id: Uuid) {
        let _ = self.runner_id.set(id);
    }

    /// Register this runner with the coordinator. Must succeed before
    /// entering the fetch loop; the returned id is cached for every
    /// subsequent call.
    pub async fn register_task_runner(
        &self,
        info: RegistrationInfo,
    ) -> Result<RunnerRegistration> {
        let payload = RegisterPayload {
            create_time: chrono::Utc::now(),
            cpu_count_logical: info.cpu_count_logical,
            cpu_count_physical: info.cpu_count_physical,
            memory: info.memory_bytes,
            host_name: info.host_name,
            host_id: info.host_id,
            mpi_cluster: info.mpi_cluster,
            num_mpi_hosts: info.num_mpi_hosts,
            machine_group_id: info.machine_group_id,
        };

        let resp = self
            .tracker_request(reqwest::Method::POST, "register")
            .json(&payload)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: "register".to_string(),
                source,
            })?;

        let status = resp.status();
        if status != reqwest::StatusCode::ACCEPTED {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(ApiClientError::UnexpectedStatus {
                status: status.as_u16(),
                path: "register".to_string(),
                body,
            });
        }

        let body: RegisterResponse = resp.json().await.context("malformed register response")?;
        let _ = self.runner_id.set(body.executer_tracker_id);
        Ok(RunnerRegistration {
            runner_id: body.executer_tracker_id,
            machine_group_id: body.machine_group_id,
        })
    }

    /// Ask the coordinator to tear down this runner. Returns the raw status
    /// code: the caller treats 422 as "refused, keep running".
    pub async fn kill_machine(&self) -> Result<u16> {
        let resp = self
            .tracker_request(reqwest::Method::DELETE, &self.runner_id().to_string())
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: "kill_machine".to_string(),
                source,
            })?;
        Ok(resp.status().as_u16())
    }

    /// Long-poll for the next task. See [`GetTaskOutcome`].
    pub async fn get_task(&self, block_s: u64) -> Result<GetTaskOutcome, ApiClientError> {
        let path = format!("{}/task?block_s={block_s}", self.runner_id());
        let resp = self
            .tracker_request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: path.clone(),
                source,
            })?;

        match resp.status() {
            reqwest::StatusCode::OK => {
                let task: TaskRequest = resp.json().await.map_err(|source| ApiClientError::Http {
                    path: path.clone(),
                    source,
                })?;
                Ok(GetTaskOutcome::Success(task))
            }
            reqwest::StatusCode::NO_CONTENT => Ok(GetTaskOutcome::NoContent),
            status if status.is_server_error() => Ok(GetTaskOutcome::InternalError),
            status => {
                let body: TerminationBody = resp.json().await.unwrap_or(TerminationBody {
                    reason: None,
                    detail: None,
                });
                Err(ApiClientError::Termination {
                    reason: body.reason.unwrap_or_else(|| format!("http {status}")),
                    detail: body.detail,
                })
            }
        }
    }

    /// Publish one event. Callers needing retry semantics go through
    /// [`crate::event_logger::EventLogger`], which wraps this.
    pub async fn log_event(&self, event: &Event) -> Result<(), ApiClientError> {
        let path = format!("{}/event", self.runner_id());
        let resp = self
            .tracker_request(reqwest::Method::POST, &path)
            .json(&event.to_wire())
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: path.clone(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiClientError::UnexpectedStatus {
                status: status.as_u16(),
                path,
                body,
            });
        }
        Ok(())
    }

    /// Long-poll for a control message addressed to `task_id`.
    pub async fn receive_task_message(
        &self,
        task_id: &str,
        block_s: u64,
    ) -> Result<Option<String>, ApiClientError> {
        let path = format!("{}/task/{task_id}/message?block_s={block_s}", self.runner_id());
        let resp = self
            .tracker_request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: path.clone(),
                source,
            })?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let message: String = resp.json().await.map_err(|source| ApiClientError::Http {
            path,
            source,
        })?;
        Ok(Some(message))
    }

    /// Release any receivers currently blocked on `receive_task_message` for
    /// this task.
    pub async fn unblock_task_message_listeners(&self, task_id: &str) -> Result<(), ApiClientError> {
        let path = format!("{}/task/{task_id}/message/unblock", self.runner_id());
        self.tracker_request(reqwest::Method::POST, &path)
            .send()
            .await
            .map_err(|source| ApiClientError::Http { path, source })?;
        Ok(())
    }

    pub async fn get_download_input_url(&self, task_id: &str) -> Result<String, ApiClientError> {
        let path = format!("{}/task/{task_id}/download_input_url", self.runner_id());
        let resp = self
            .tracker_request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: path.clone(),
                source,
            })?;
        let body: UrlResponse = resp.json().await.map_err(|source| ApiClientError::Http {
            path,
            source,
        })?;
        Ok(body.url)
    }

    pub async fn get_upload_output_url(&self, task_id: &str) -> Result<UploadUrlInfo, ApiClientError> {
        let path = format!("{}/task/{task_id}/upload_output_url", self.runner_id());
        let resp = self
            .tracker_request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: path.clone(),
                source,
            })?;
        resp.json().await.map_err(|source| ApiClientError::Http { path, source })
    }

    /// Signed URL for an arbitrary path in user/Inductiva-managed storage, used
    /// for container images referenced by an `inductiva://` URI.
    pub async fn get_storage_download_url(&self, remote_path: &str) -> Result<String, ApiClientError> {
        let path = format!("storage/download_url?path={}", urlencode(remote_path));
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: path.clone(),
                source,
            })?;
        let body: UrlResponse = resp.json().await.map_err(|source| ApiClientError::Http { path, source })?;
        Ok(body.url)
    }

    /// Fire-and-forget metric post with its own bounded retry (distinct from
    /// the event logger's policy): up to 5 tries, flat 2 s delay.
    pub async fn post_task_metric(&self, task_id: &str, name: &str, value: f64) {
        #[derive(Serialize)]
        struct MetricPayload<'a> {
            metric: &'a str,
            value: f64,
        }

        let path = format!("{}/task/{task_id}/metric", self.runner_id());
        let payload = MetricPayload { metric: name, value };

        let policy = crate::retry::RetryPolicy::bounded(Duration::from_secs(2), 5);
        let result = crate::retry::retry(
            policy,
            || async {
                let resp = self
                    .tracker_request(reqwest::Method::POST, &path)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|source| ApiClientError::Http {
                        path: path.clone(),
                        source,
                    })?;
                if resp.status() == reqwest::StatusCode::ACCEPTED {
                    Ok(())
                } else {
                    Err(ApiClientError::UnexpectedStatus {
                        status: resp.status().as_u16(),
                        path: path.clone(),
                        body: resp.text().await.unwrap_or_default(),
                    })
                }
            },
            |attempt, err| {
                tracing::warn!(attempt, %err, metric = name, "retrying task metric post");
            },
        )
        .await;

        if let Err(err) = result {
            tracing::error!(%err, metric = name, "giving up on task metric post");
        }
    }

    /// Look up an existing, already-started machine group by name.
    pub async fn get_started_machine_group_id_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Uuid>, ApiClientError> {
        let path = format!("compute/group/{name}");
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: path.clone(),
                source,
            })?;
        if resp.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }
        #[derive(Deserialize)]
        struct IdBody {
            id: Option<Uuid>,
        }
        let body: IdBody = resp.json().await.unwrap_or(IdBody { id: None });
        Ok(body.id)
    }

    pub async fn create_local_machine_group(&self, name: Option<&str>) -> Result<Uuid, ApiClientError> {
        #[derive(Serialize)]
        struct CreateGroupPayload<'a> {
            provider_id: &'static str,
            name: Option<&'a str>,
        }
        let resp = self
            .request(reqwest::Method::POST, "compute/group")
            .json(&CreateGroupPayload {
                provider_id: "LOCAL",
                name,
            })
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: "compute/group".to_string(),
                source,
            })?;
        #[derive(Deserialize)]
        struct IdBody {
            id: Uuid,
        }
        let body: IdBody = resp.json().await.map_err(|source| ApiClientError::Http {
            path: "compute/group".to_string(),
            source,
        })?;
        Ok(body.id)
    }

    pub async fn start_local_machine_group(&self, id: Uuid) -> Result<(), ApiClientError> {
        #[derive(Serialize)]
        struct StartPayload {
            id: Uuid,
        }
        self.request(reqwest::Method::POST, "compute/group/start")
            .json(&StartPayload { id })
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                path: "compute/group/start".to_string(),
                source,
            })?;
        Ok(())
    }
}

/// Percent-encodes a path for use as a single query value. Only the
/// characters that would otherwise break query-string parsing need escaping.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_error_message_includes_reason_and_detail() {
        let err = ApiClientError::Termination {
            reason: "idle_timeout".to_string(),
            detail: Some("scale-down accepted".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("idle_timeout"));
        assert!(msg.contains("scale-down accepted"));
    }
}
