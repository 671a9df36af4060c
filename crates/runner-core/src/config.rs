//! Runner configuration, resolved entirely from the environment.
//!
//! There is no config-file layer here (unlike a CLI tool that merges
//! flags/env/file/default): this process is always launched by an
//! orchestrator that sets its environment directly, so the resolution chain
//! collapses to "env var present and non-empty, else documented default,
//! else hard startup error". [`RunnerConfig::from_env`] performs all parsing
//! up front so a misconfiguration is a single aggregated startup failure,
//! not a runtime surprise three hours into a task.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "t" | "yes" | "y" | "1"),
        Err(_) => default,
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Authentication credential the API client attaches to every request.
#[derive(Debug, Clone)]
pub enum ApiCredential {
    UserApiKey(String),
    RunnerToken(String),
}

/// Top-level runner configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub api_url: String,
    pub credential: ApiCredential,
    pub workdir: PathBuf,
    pub executer_images_dir: PathBuf,
    pub executer_images_remote_storage: Option<String>,
    pub mpi: MpiEnvConfig,
    pub local_mode: bool,
    pub max_idle_timeout: Option<u64>,
    pub machine_group_id: Option<String>,
    pub machine_group_name: Option<String>,
    pub host_name: Option<String>,
    pub host_id: Option<String>,
    pub on_gpu: bool,
    pub socks_proxy_host: Option<String>,
    pub socks_proxy_port: Option<String>,
}

/// The subset of MPI configuration that comes straight from the
/// environment, before the hostfile is read (see [`crate::mpi`]).
#[derive(Debug, Clone)]
pub struct MpiEnvConfig {
    pub is_cluster: bool,
    pub share_path: Option<String>,
    pub hostfile_path: Option<String>,
    pub extra_args: String,
    pub mpirun_bin_path_template: String,
    pub default_version: String,
}

pub const DEFAULT_MPI_VERSION: &str = "4.1.6";

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        let api_url =
            std::env::var("API_URL").unwrap_or_else(|_| "https://api.inductiva.ai".to_string());

        let user_api_key = env_opt("USER_API_KEY");
        let runner_token = env_opt("EXECUTER_TRACKER_TOKEN");
        let credential = match (user_api_key, runner_token) {
            (Some(k), None) => ApiCredential::UserApiKey(k),
            (None, Some(t)) => ApiCredential::RunnerToken(t),
            (None, None) => bail!(
                "exactly one of USER_API_KEY and EXECUTER_TRACKER_TOKEN must be set, got neither"
            ),
            (Some(_), Some(_)) => bail!(
                "exactly one of USER_API_KEY and EXECUTER_TRACKER_TOKEN must be set, got both"
            ),
        };

        let workdir = std::env::var("WORKDIR").unwrap_or_else(|_| "/workdir".to_string());
        let executer_images_dir =
            std::env::var("EXECUTER_IMAGES_DIR").unwrap_or_else(|_| "/apptainer".to_string());
        if executer_images_dir.is_empty() {
            bail!("EXECUTER_IMAGES_DIR environment variable not set");
        }

        let max_idle_timeout = env_opt("MAX_IDLE_TIMEOUT")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("MAX_IDLE_TIMEOUT must be an integer number of seconds")?;

        let is_cluster = env_bool("MPI_CLUSTER", false);
        let (hostfile_path, share_path) = if is_cluster {
            let share_path = env_opt("MPI_SHARE_PATH")
                .context("MPI_SHARE_PATH environment variable not set")?;
            let hostfile_path = env_opt("MPI_HOSTFILE_PATH")
                .context("MPI_HOSTFILE_PATH environment variable not set")?;
            (Some(hostfile_path), Some(share_path))
        } else {
            (None, None)
        };

        Ok(Self {
            api_url,
            credential,
            workdir: PathBuf::from(workdir),
            executer_images_dir: PathBuf::from(executer_images_dir),
            executer_images_remote_storage: env_opt("EXECUTER_IMAGES_REMOTE_STORAGE"),
            mpi: MpiEnvConfig {
                is_cluster,
                share_path,
                hostfile_path,
                extra_args: std::env::var("MPI_EXTRA_ARGS")
                    .unwrap_or_else(|_| "--allow-run-as-root".to_string()),
                mpirun_bin_path_template: std::env::var("MPIRUN_BIN_PATH_TEMPLATE")
                    .unwrap_or_else(|_| "mpirun".to_string()),
                default_version: std::env::var("MPI_DEFAULT_VERSION")
                    .unwrap_or_else(|_| DEFAULT_MPI_VERSION.to_string()),
            },
            local_mode: env_bool("LOCAL_MODE", true),
            max_idle_timeout,
            machine_group_id: env_opt("MACHINE_GROUP_ID"),
            machine_group_name: env_opt("MACHINE_GROUP_NAME"),
            host_name: env_opt("HOST_NAME"),
            host_id: env_opt("HOST_ID"),
            on_gpu: env_bool("ON_GPU", false),
            socks_proxy_host: env_opt("SOCKS_PROXY_HOST"),
            socks_proxy_port: env_opt("SOCKS_PROXY_PORT"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that mutate process-wide environment variables must not run
    // concurrently with each other.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_auth_vars() {
        for v in ["USER_API_KEY", "EXECUTER_TRACKER_TOKEN", "MPI_CLUSTER"] {
            unsafe { std::env::remove_var(v) };
        }
    }

    #[test]
    fn rejects_neither_credential_set() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_auth_vars();
        let err = RunnerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("got neither"));
    }

    #[test]
    fn rejects_both_credentials_set() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_auth_vars();
        unsafe {
            std::env::set_var("USER_API_KEY", "key");
            std::env::set_var("EXECUTER_TRACKER_TOKEN", "token");
        }
        let err = RunnerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("got both"));
        clear_auth_vars();
    }

    #[test]
    fn accepts_user_api_key_alone() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_auth_vars();
        unsafe { std::env::set_var("USER_API_KEY", "key") };
        let config = RunnerConfig::from_env().unwrap();
        assert!(matches!(config.credential, ApiCredential::UserApiKey(k) if k == "key"));
        clear_auth_vars();
    }

    #[test]
    fn cluster_mode_requires_share_and_hostfile_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_auth_vars();
        unsafe {
            std::env::set_var("USER_API_KEY", "key");
            std::env::set_var("MPI_CLUSTER", "true");
        }
        let err = RunnerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("MPI_SHARE_PATH"));
        clear_auth_vars();
    }
}
