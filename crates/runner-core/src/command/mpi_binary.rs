//! Generic MPI simulator builder: renames the task's input file to the
//! name the binary expects, runs it under MPI from the `sim_dir`, then
//! copies results into the artifact directory.
//!
//! Grounded in `task_runner.executers.mpi_base_executer.MPIExecuter`.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

use super::{BuildContext, Command, CommandBuilder, MpiCommandOptions};

#[derive(Debug, Deserialize)]
struct MpiBinaryParams {
    sim_dir: String,
    input_filename: String,
    sim_binary: String,
    file_type: String,
    sim_specific_input_filename: String,
    #[serde(default)]
    n_vcpus: Option<u32>,
    #[serde(default)]
    use_hwthread: bool,
}

pub struct MpiBinaryBuilder;

#[async_trait]
impl CommandBuilder for MpiBinaryBuilder {
    fn build_commands(&self, ctx: &BuildContext) -> Result<Vec<Command>> {
        let params: MpiBinaryParams = serde_json::from_value(ctx.extra_params.clone())
            .context("extra_params did not match the mpi_binary schema")?;

        let sim_dir = ctx.working_dir.join(&params.sim_dir);
        let input_path = sim_dir.join(&params.input_filename);
        let resolved_input = if input_path.exists() {
            input_path
        } else {
            let with_suffix = sim_dir.join(format!(
                "{}.{}",
                params.input_filename, params.file_type
            ));
            if with_suffix.exists() {
                with_suffix
            } else {
                bail!("a file with name {} doesn't exist", params.input_filename);
            }
        };

        let renamed_path = sim_dir.join(&params.sim_specific_input_filename);
        std::fs::rename(&resolved_input, &renamed_path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                resolved_input.display(),
                renamed_path.display()
            )
        })?;

        let mut options = indexmap::IndexMap::new();
        if let Some(n) = params.n_vcpus {
            options.insert("np".to_string(), serde_json::json!(n));
        }
        if params.use_hwthread {
            options.insert("use-hwthread-cpus".to_string(), serde_json::json!(true));
        }

        // Relative to the task's container working directory, not an
        // absolute host path -- the command runs inside `sim_dir/`.
        let command = Command::new(vec![
            params.sim_binary,
            params.sim_specific_input_filename,
        ])
        .in_dir(PathBuf::from(&params.sim_dir))
        .with_mpi(MpiCommandOptions {
            version: None,
            options,
        });
        command.check_security()?;

        Ok(vec![command])
    }

    async fn pre_process(&self, _ctx: &BuildContext, _artifacts_dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn post_process(
        &self,
        ctx: &BuildContext,
        artifacts_dir: &Path,
        _run_started_at: SystemTime,
    ) -> Result<()> {
        let params: MpiBinaryParams = serde_json::from_value(ctx.extra_params.clone())
            .context("extra_params did not match the mpi_binary schema")?;
        let sim_dir = ctx.working_dir.join(&params.sim_dir);
        copy_tree_into(&sim_dir, artifacts_dir).await
    }
}

async fn copy_tree_into(source: &Path, dest: &Path) -> Result<()> {
    let mut stack = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((src, dst)) = stack.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let entry_dst = dst.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), entry_dst));
            } else {
                tokio::fs::copy(entry.path(), entry_dst).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpi::MpiClusterConfig;

    fn ctx(working_dir: &Path, params: serde_json::Value) -> BuildContext {
        BuildContext {
            working_dir: working_dir.to_path_buf(),
            container_image: working_dir.join("image.sif"),
            mpi_config: MpiClusterConfig::disabled(),
            extra_params: params,
        }
    }

    #[test]
    fn renames_input_and_builds_mpi_command() {
        let working_dir = tempfile::tempdir().unwrap();
        let sim_dir = working_dir.path().join("sim_dir");
        std::fs::create_dir_all(&sim_dir).unwrap();
        std::fs::write(sim_dir.join("case.in"), b"input data").unwrap();

        let params = serde_json::json!({
            "sim_dir": "sim_dir",
            "input_filename": "case.in",
            "sim_binary": "openfast",
            "file_type": "fst",
            "sim_specific_input_filename": "model.fst",
            "n_vcpus": 4,
        });

        let builder = MpiBinaryBuilder;
        let commands = builder.build_commands(&ctx(working_dir.path(), params)).unwrap();
        assert_eq!(commands.len(), 1);
        let cmd = &commands[0];
        assert!(cmd.is_mpi);
        assert_eq!(cmd.argv, vec!["openfast", "model.fst"]);
        assert!(sim_dir.join("model.fst").exists());
        assert!(!sim_dir.join("case.in").exists());
        assert_eq!(
            cmd.mpi_options.as_ref().unwrap().options["np"],
            serde_json::json!(4)
        );
    }

    #[test]
    fn falls_back_to_file_type_suffixed_name() {
        let working_dir = tempfile::tempdir().unwrap();
        let sim_dir = working_dir.path().join("sim_dir");
        std::fs::create_dir_all(&sim_dir).unwrap();
        std::fs::write(sim_dir.join("case.in.fst"), b"input data").unwrap();

        let params = serde_json::json!({
            "sim_dir": "sim_dir",
            "input_filename": "case.in",
            "sim_binary": "openfast",
            "file_type": "fst",
            "sim_specific_input_filename": "model.fst",
        });

        let builder = MpiBinaryBuilder;
        let commands = builder.build_commands(&ctx(working_dir.path(), params)).unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn missing_input_file_is_an_error() {
        let working_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(working_dir.path().join("sim_dir")).unwrap();

        let params = serde_json::json!({
            "sim_dir": "sim_dir",
            "input_filename": "missing.in",
            "sim_binary": "openfast",
            "file_type": "fst",
            "sim_specific_input_filename": "model.fst",
        });

        let builder = MpiBinaryBuilder;
        assert!(builder.build_commands(&ctx(working_dir.path(), params)).is_err());
    }
}
