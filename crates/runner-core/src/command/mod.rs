//! Command Builder Registry: maps a simulator name to a [`CommandBuilder`]
//! trait object, the way the teacher's harness registry maps an agent name
//! to a harness implementation.

pub mod arbitrary;
pub mod mpi_binary;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::mpi::MpiClusterConfig;
use crate::security::check_argv_security;

/// MPI-specific options layered onto a [`Command`], mirroring
/// `MPICommandConfig` from the source: an explicit MPI version plus a bag of
/// `--{name} {value}` style flags (booleans contribute just the flag name
/// when true, and are skipped entirely when false).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpiCommandOptions {
    pub version: Option<String>,
    #[serde(default)]
    pub options: IndexMap<String, serde_json::Value>,
}

impl MpiCommandOptions {
    /// Render `options` as an ordered argv tail: `--key value` for
    /// strings/numbers, bare `--key` for `true` booleans, nothing for
    /// `false` booleans. Iteration order follows insertion order of the
    /// underlying JSON object.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        for (key, value) in &self.options {
            match value {
                serde_json::Value::Bool(true) => argv.push(format!("--{key}")),
                serde_json::Value::Bool(false) => {}
                serde_json::Value::String(s) => {
                    argv.push(format!("--{key}"));
                    argv.push(s.clone());
                }
                other => {
                    argv.push(format!("--{key}"));
                    argv.push(other.to_string());
                }
            }
        }
        argv
    }
}

/// One subprocess invocation a builder wants run, before any MPI or
/// container wrapping is applied.
#[derive(Debug, Clone)]
pub struct Command {
    pub argv: Vec<String>,
    pub stdin_prompts: Vec<String>,
    pub is_mpi: bool,
    pub mpi_options: Option<MpiCommandOptions>,
    /// Override the working directory the command runs in; `None` means
    /// the task's artifact directory, the default for most builders.
    pub working_dir: Option<PathBuf>,
}

impl Command {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            stdin_prompts: Vec::new(),
            is_mpi: false,
            mpi_options: None,
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Tokenize a shell-style command line the way the source does via
    /// `shlex.split`.
    pub fn from_shell(line: &str) -> Result<Self> {
        let argv = shlex::split(line)
            .ok_or_else(|| anyhow::anyhow!("failed to tokenize command: {line}"))?;
        Ok(Self::new(argv))
    }

    pub fn with_prompts(mut self, prompts: Vec<String>) -> Self {
        self.stdin_prompts = prompts;
        self
    }

    pub fn with_mpi(mut self, options: MpiCommandOptions) -> Self {
        self.is_mpi = true;
        self.mpi_options = Some(options);
        self
    }

    /// Concatenate stdin prompts the way they're fed to the child: one line
    /// per prompt.
    pub fn stdin_contents(&self) -> String {
        if self.stdin_prompts.is_empty() {
            String::new()
        } else {
            format!("{}\n", self.stdin_prompts.join("\n"))
        }
    }

    /// Run the generic security check over argv and prompts before this
    /// command is ever handed to the Supervisor.
    pub fn check_security(&self) -> Result<()> {
        check_argv_security(&self.argv)?;
        check_argv_security(&self.stdin_prompts)
    }
}

/// Parameters a builder needs to produce commands for one task.
pub struct BuildContext {
    pub working_dir: PathBuf,
    pub container_image: PathBuf,
    pub mpi_config: MpiClusterConfig,
    pub extra_params: serde_json::Value,
}

/// Knows how to turn `extra_params` for one simulator family into an
/// ordered sequence of [`Command`]s. Implementations additionally run
/// pre/post steps around the artifact directory (copy, prune) which the
/// [`crate::executer`] driver invokes around command execution.
#[async_trait]
pub trait CommandBuilder: Send + Sync {
    /// Build the ordered command sequence for this task.
    fn build_commands(&self, ctx: &BuildContext) -> Result<Vec<Command>>;

    /// Runs before any command: e.g. copying a user-named directory into
    /// the artifact directory.
    async fn pre_process(&self, ctx: &BuildContext, artifacts_dir: &std::path::Path) -> Result<()>;

    /// Runs after all commands finish: e.g. pruning untouched files.
    async fn post_process(
        &self,
        ctx: &BuildContext,
        artifacts_dir: &std::path::Path,
        run_started_at: std::time::SystemTime,
    ) -> Result<()>;
}

/// Maps a simulator name to its [`CommandBuilder`], the dynamic-dispatch
/// registry the spec calls for: new simulators register at startup, keyed
/// by name, with no further recompilation needed to add one.
#[derive(Default)]
pub struct CommandRegistry {
    builders: HashMap<String, std::sync::Arc<dyn CommandBuilder>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, simulator: impl Into<String>, builder: std::sync::Arc<dyn CommandBuilder>) {
        self.builders.insert(simulator.into(), builder);
    }

    /// Resolve a simulator name to its builder. Returns an owned `Arc` (a
    /// cheap clone) rather than a borrow, so the registry can stay shared
    /// behind its own `Arc` while each task's [`crate::executer::Executer`]
    /// holds its own handle to the builder it was given.
    pub fn get(&self, simulator: &str) -> Result<std::sync::Arc<dyn CommandBuilder>> {
        self.builders
            .get(simulator)
            .cloned()
            .ok_or_else(|| bail_unknown(simulator))
    }

    /// The default registry wired at startup: arbitrary-commands plus the
    /// generic MPI-binary builder.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "arbitrary_commands",
            std::sync::Arc::new(arbitrary::ArbitraryCommandsBuilder),
        );
        registry.register("mpi_binary", std::sync::Arc::new(mpi_binary::MpiBinaryBuilder));
        registry
    }
}

fn bail_unknown(simulator: &str) -> anyhow::Error {
    anyhow::anyhow!("no command builder registered for simulator '{simulator}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpi_options_skip_false_booleans_and_keep_true_ones() {
        let mut options = IndexMap::new();
        options.insert("np".to_string(), serde_json::json!(4));
        options.insert("oversubscribe".to_string(), serde_json::json!(true));
        options.insert("bind-to-core".to_string(), serde_json::json!(false));
        let cfg = MpiCommandOptions {
            version: None,
            options,
        };
        let argv = cfg.to_argv();
        assert!(argv.contains(&"--np".to_string()));
        assert!(argv.contains(&"4".to_string()));
        assert!(argv.contains(&"--oversubscribe".to_string()));
        assert!(!argv.iter().any(|a| a == "--bind-to-core"));
    }

    #[test]
    fn from_shell_tokenizes_quoted_arguments() {
        let cmd = Command::from_shell("echo \"hello world\"").unwrap();
        assert_eq!(cmd.argv, vec!["echo".to_string(), "hello world".to_string()]);
    }

    #[test]
    fn stdin_contents_joins_prompts_with_newline() {
        let cmd = Command::new(vec!["gmx".into()])
            .with_prompts(vec!["1".into(), "yes".into()]);
        assert_eq!(cmd.stdin_contents(), "1\nyes\n");
    }

    #[test]
    fn registry_returns_error_for_unknown_simulator() {
        let registry = CommandRegistry::with_defaults();
        assert!(registry.get("nonexistent").is_err());
    }

    #[test]
    fn registry_resolves_arbitrary_commands() {
        let registry = CommandRegistry::with_defaults();
        assert!(registry.get("arbitrary_commands").is_ok());
    }
}
