//! MPI Configurator: resolves an `mpirun` binary for a requested version and
//! builds the argv prefix that wraps an MPI-flagged [`crate::command::Command`].
//!
//! Grounded in `task_runner.executers.mpi_configuration.MPIClusterConfiguration`.
//! The binary path template uses a single `{version}` placeholder (e.g.
//! `/opt/mpi/{version}/bin/mpirun`); available versions are discovered by
//! globbing the template with `{version}` replaced by `*` and then stripping
//! the template's literal prefix/suffix off each match.

use std::path::Path;

use anyhow::{Result, bail};

use crate::config::MpiEnvConfig;

const VERSION_PLACEHOLDER: &str = "{version}";

#[derive(Debug, Clone)]
pub struct MpiClusterConfig {
    pub is_cluster: bool,
    pub hostfile_path: Option<String>,
    pub share_path: Option<String>,
    pub extra_args: Vec<String>,
    pub mpirun_bin_path_template: String,
    pub num_hosts: usize,
    pub default_version: String,
    pub local_mode: bool,
}

impl MpiClusterConfig {
    /// A non-cluster configuration with no MPI binary resolution needed;
    /// used where a [`MpiClusterConfig`] value is required structurally but
    /// no MPI command will actually be built.
    pub fn disabled() -> Self {
        Self {
            is_cluster: false,
            hostfile_path: None,
            share_path: None,
            extra_args: Vec::new(),
            mpirun_bin_path_template: "mpirun".to_string(),
            num_hosts: 1,
            default_version: crate::config::DEFAULT_MPI_VERSION.to_string(),
            local_mode: true,
        }
    }

    /// Resolve from the environment-derived [`MpiEnvConfig`], reading and
    /// counting the hostfile when running as part of a cluster.
    pub fn from_env_config(env: &MpiEnvConfig, local_mode: bool) -> Result<Self> {
        let extra_args = shlex::split(&env.extra_args)
            .ok_or_else(|| anyhow::anyhow!("failed to tokenize MPI_EXTRA_ARGS"))?;

        let num_hosts = if env.is_cluster {
            let hostfile_path = env
                .hostfile_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("MPI_HOSTFILE_PATH environment variable not set"))?;
            let contents = std::fs::read_to_string(hostfile_path)?;
            contents.lines().filter(|l| !l.trim().is_empty()).count().max(1)
        } else {
            1
        };

        Ok(Self {
            is_cluster: env.is_cluster,
            hostfile_path: env.hostfile_path.clone(),
            share_path: env.share_path.clone(),
            extra_args,
            mpirun_bin_path_template: env.mpirun_bin_path_template.clone(),
            num_hosts,
            default_version: env.default_version.clone(),
            local_mode,
        })
    }

    fn template_prefix_suffix(&self) -> Result<(&str, &str)> {
        self.mpirun_bin_path_template
            .split_once(VERSION_PLACEHOLDER)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "MPIRUN_BIN_PATH_TEMPLATE '{}' has no {{version}} placeholder",
                    self.mpirun_bin_path_template
                )
            })
    }

    /// Versions discovered by globbing the template with `{version}`
    /// replaced by `*`, sorted lexicographically.
    pub fn list_available_versions(&self) -> Vec<String> {
        let Ok((prefix, suffix)) = self.template_prefix_suffix() else {
            // A literal path with no placeholder: either it exists (one
            // "version", itself) or it doesn't.
            return if Path::new(&self.mpirun_bin_path_template).exists() {
                vec![self.mpirun_bin_path_template.clone()]
            } else {
                vec![]
            };
        };

        let pattern = self.mpirun_bin_path_template.replace(VERSION_PLACEHOLDER, "*");
        let mut versions: Vec<String> = glob::glob(&pattern)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let path_str = path.to_string_lossy().into_owned();
                path_str
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_suffix(suffix))
                    .map(|v| v.to_string())
            })
            .collect();
        versions.sort();
        versions
    }

    /// Resolve the `mpirun` binary path for `version`, failing with the
    /// list of available versions if it doesn't exist on disk.
    pub fn get_mpirun_bin_path(&self, version: &str) -> Result<String> {
        let path = self.mpirun_bin_path_template.replace(VERSION_PLACEHOLDER, version);
        if !Path::new(&path).exists() {
            let available = self.list_available_versions();
            bail!(
                "the requested MPI version ({version}) is not available. Available versions: {}",
                available.join(", ")
            );
        }
        Ok(path)
    }

    /// Build the full `mpirun` prefix for an MPI-flagged command:
    /// `[mpirun_bin(version), "--hostfile", hostfile?] ++ extra_args ++ user_options`.
    pub fn build_command_prefix(
        &self,
        requested_version: Option<&str>,
        user_args: &[String],
    ) -> Result<Vec<String>> {
        let version = requested_version.unwrap_or(&self.default_version);
        let mpirun_bin_path = self.get_mpirun_bin_path(version)?;

        let mut args = vec![mpirun_bin_path];
        if let Some(hostfile) = &self.hostfile_path {
            args.push("--hostfile".to_string());
            args.push(hostfile.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args.extend(user_args.iter().cloned());
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_binary(path: &Path) {
        std::fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn lists_available_versions_from_glob() {
        let dir = tempfile::tempdir().unwrap();
        make_binary(&dir.path().join("mpirun-4.1.6"));
        make_binary(&dir.path().join("mpirun-3.1.4"));

        let template = dir.path().join("mpirun-{version}").to_string_lossy().into_owned();
        let config = MpiClusterConfig {
            mpirun_bin_path_template: template,
            ..MpiClusterConfig::disabled()
        };

        let mut versions = config.list_available_versions();
        versions.sort();
        assert_eq!(versions, vec!["3.1.4".to_string(), "4.1.6".to_string()]);
    }

    #[test]
    fn unknown_version_fails_with_available_list() {
        let dir = tempfile::tempdir().unwrap();
        make_binary(&dir.path().join("mpirun-4.1.6"));

        let template = dir.path().join("mpirun-{version}").to_string_lossy().into_owned();
        let config = MpiClusterConfig {
            mpirun_bin_path_template: template,
            ..MpiClusterConfig::disabled()
        };

        let err = config.get_mpirun_bin_path("9.9.9").unwrap_err();
        assert!(err.to_string().contains("4.1.6"));
    }

    #[test]
    fn build_command_prefix_includes_hostfile_and_extra_args() {
        let dir = tempfile::tempdir().unwrap();
        make_binary(&dir.path().join("mpirun-4.1.6"));
        let hostfile = dir.path().join("hostfile");
        std::fs::write(&hostfile, "host1\nhost2\n").unwrap();

        let template = dir.path().join("mpirun-{version}").to_string_lossy().into_owned();
        let config = MpiClusterConfig {
            mpirun_bin_path_template: template,
            hostfile_path: Some(hostfile.to_string_lossy().into_owned()),
            extra_args: vec!["--allow-run-as-root".to_string()],
            default_version: "4.1.6".to_string(),
            ..MpiClusterConfig::disabled()
        };

        let prefix = config
            .build_command_prefix(None, &["-np".to_string(), "4".to_string()])
            .unwrap();
        assert_eq!(
            prefix,
            vec![
                dir.path().join("mpirun-4.1.6").to_string_lossy().into_owned(),
                "--hostfile".to_string(),
                hostfile.to_string_lossy().into_owned(),
                "--allow-run-as-root".to_string(),
                "-np".to_string(),
                "4".to_string(),
            ]
        );
    }

    #[test]
    fn from_env_config_counts_nonempty_hostfile_lines() {
        let dir = tempfile::tempdir().unwrap();
        let hostfile = dir.path().join("hostfile");
        std::fs::write(&hostfile, "host1\n\nhost2\nhost3\n").unwrap();

        let env = MpiEnvConfig {
            is_cluster: true,
            share_path: Some("/share".to_string()),
            hostfile_path: Some(hostfile.to_string_lossy().into_owned()),
            extra_args: "--allow-run-as-root".to_string(),
            mpirun_bin_path_template: "mpirun".to_string(),
            default_version: "4.1.6".to_string(),
        };

        let config = MpiClusterConfig::from_env_config(&env, false).unwrap();
        assert_eq!(config.num_hosts, 3);
    }
}
