//! The general-purpose builder: runs a user-supplied list of shell command
//! lines from a copy of a named input sub-directory.
//!
//! Grounded in `task_runner.executers.arbitrary_commands_executer
//! .ArbitraryCommandsExecuter`: copy `sim_dir` into the artifact directory,
//! run each command from there in order, then prune files in the artifact
//! directory that were present before the run and untouched by it.

use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{BuildContext, Command, CommandBuilder};

#[derive(Debug, Deserialize)]
struct ArbitraryCommandsParams {
    sim_dir: String,
    commands: Vec<CommandSpec>,
}

#[derive(Debug, Deserialize)]
struct CommandSpec {
    cmd: String,
    #[serde(default)]
    prompts: Vec<String>,
}

pub struct ArbitraryCommandsBuilder;

#[async_trait]
impl CommandBuilder for ArbitraryCommandsBuilder {
    fn build_commands(&self, ctx: &BuildContext) -> Result<Vec<Command>> {
        let params: ArbitraryCommandsParams = serde_json::from_value(ctx.extra_params.clone())
            .context("extra_params did not match the arbitrary_commands schema")?;

        params
            .commands
            .into_iter()
            .map(|spec| {
                let command = Command::from_shell(&spec.cmd)?.with_prompts(spec.prompts);
                command.check_security()?;
                Ok(command)
            })
            .collect()
    }

    async fn pre_process(&self, ctx: &BuildContext, artifacts_dir: &Path) -> Result<()> {
        let params: ArbitraryCommandsParams = serde_json::from_value(ctx.extra_params.clone())
            .context("extra_params did not match the arbitrary_commands schema")?;
        let source = ctx.working_dir.join(&params.sim_dir);
        copy_dir_recursive(&source, artifacts_dir)
            .await
            .with_context(|| format!("failed to copy {} into artifact directory", params.sim_dir))
    }

    async fn post_process(
        &self,
        _ctx: &BuildContext,
        artifacts_dir: &Path,
        run_started_at: SystemTime,
    ) -> Result<()> {
        remove_untouched_since(artifacts_dir, run_started_at).await
    }
}

/// Recursively copy `source`'s contents into `dest`, creating directories as
/// needed. `dest` is assumed to already exist.
async fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
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

/// Prune any file under `dir` whose modified time is older than
/// `run_started_at`: these are leftovers from the pre_process copy that the
/// command never actually touched.
async fn remove_untouched_since(dir: &Path, run_started_at: SystemTime) -> Result<()> {
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        let modified = metadata.modified()?;
        if modified < run_started_at {
            tokio::fs::remove_file(entry.path()).await.ok();
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
    fn builds_one_command_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let params = serde_json::json!({
            "sim_dir": "sim_dir",
            "commands": [{"cmd": "sleep 1"}, {"cmd": "echo done"}],
        });
        let builder = ArbitraryCommandsBuilder;
        let commands = builder.build_commands(&ctx(dir.path(), params)).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].argv, vec!["sleep", "1"]);
        assert_eq!(commands[1].argv, vec!["echo", "done"]);
    }

    #[test]
    fn rejects_malformed_extra_params() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArbitraryCommandsBuilder;
        let result = builder.build_commands(&ctx(dir.path(), serde_json::json!({})));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pre_process_copies_sim_dir_into_artifacts() {
        let working_dir = tempfile::tempdir().unwrap();
        let sim_dir = working_dir.path().join("sim_dir");
        tokio::fs::create_dir_all(&sim_dir).await.unwrap();
        tokio::fs::write(sim_dir.join("input.txt"), b"data").await.unwrap();

        let artifacts_dir = tempfile::tempdir().unwrap();
        let builder = ArbitraryCommandsBuilder;
        let params = serde_json::json!({"sim_dir": "sim_dir", "commands": []});
        builder
            .pre_process(&ctx(working_dir.path(), params), artifacts_dir.path())
            .await
            .unwrap();

        let copied = tokio::fs::read(artifacts_dir.path().join("input.txt"))
            .await
            .unwrap();
        assert_eq!(copied, b"data");
    }

    #[tokio::test]
    async fn post_process_removes_files_untouched_by_the_run() {
        let artifacts_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(artifacts_dir.path().join("stale.txt"), b"old")
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let run_started_at = SystemTime::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        tokio::fs::write(artifacts_dir.path().join("fresh.txt"), b"new")
            .await
            .unwrap();

        let builder = ArbitraryCommandsBuilder;
        let working_dir = tempfile::tempdir().unwrap();
        builder
            .post_process(
                &ctx(working_dir.path(), serde_json::json!({})),
                artifacts_dir.path(),
                run_started_at,
            )
            .await
            .unwrap();

        assert!(!artifacts_dir.path().join("stale.txt").exists());
        assert!(artifacts_dir.path().join("fresh.txt").exists());
    }
}
