//! Entry point for the `task-runner` binary: loads configuration, registers
//! with the coordinator, wires up the shared components every task handler
//! run needs, and drives the fetch/idle/shutdown loop until it exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use runner_core::api_client::{ApiClient, RegistrationInfo};
use runner_core::artifact_store::ArtifactStoreClient;
use runner_core::command::CommandRegistry;
use runner_core::config::RunnerConfig;
use runner_core::event_logger::EventLogger;
use runner_core::handler::TaskRequestHandler;
use runner_core::host_info;
use runner_core::image_cache::ImageCache;
use runner_core::machine_group;
use runner_core::main_loop::{self, MainLoopConfig};
use runner_core::message_listener::MessageListener;
use runner_core::mpi::MpiClusterConfig;
use runner_core::observers::ObserverManager;
use runner_core::termination::TerminationHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = RunnerConfig::from_env().context("failed to load runner configuration")?;

    let api = Arc::new(
        ApiClient::new(config.api_url.clone(), config.credential.clone())
            .context("failed to build API client")?,
    );

    let machine_group_id = machine_group::resolve(
        &api,
        config.machine_group_id.as_deref(),
        config.machine_group_name.as_deref(),
        config.local_mode,
    )
    .await
    .context("failed to resolve machine group")?;

    let mpi_config = MpiClusterConfig::from_env_config(&config.mpi, config.local_mode)
        .context("failed to resolve MPI configuration")?;

    let cpus = host_info::cpu_count();
    let memory_bytes = host_info::total_memory_bytes();
    if let Some(gpu) = host_info::gpu_count() {
        tracing::info!(count = gpu.count, name = %gpu.name, "detected GPU(s)");
    }

    let host_name = config.host_name.clone().unwrap_or_else(|| {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
    });
    let host_id = config.host_id.clone().unwrap_or_else(|| {
        tracing::warn!("HOST_ID not set, generating a random one for this process");
        Uuid::new_v4().to_string()
    });

    let registration = api
        .register_task_runner(RegistrationInfo {
            cpu_count_logical: cpus.logical,
            cpu_count_physical: cpus.physical,
            memory_bytes,
            host_name,
            host_id,
            mpi_cluster: config.mpi.is_cluster,
            num_mpi_hosts: mpi_config.num_hosts,
            machine_group_id,
        })
        .await
        .context("failed to register with the coordinator")?;
    tracing::info!(
        runner_id = %registration.runner_id,
        machine_group_id = %registration.machine_group_id,
        "registered with coordinator"
    );

    let event_logger = Arc::new(EventLogger::new(api.clone()));
    let artifact_store = Arc::new(
        ArtifactStoreClient::new(api.clone()).context("failed to build artifact store client")?,
    );
    let image_cache = Arc::new(
        ImageCache::new(
            config.executer_images_dir.clone(),
            config.executer_images_remote_storage.clone(),
        )
        .context("failed to initialize container image cache")?,
    );
    let command_registry = Arc::new(CommandRegistry::with_defaults());
    let observer_manager = Arc::new(ObserverManager::new(registration.runner_id, event_logger.clone()));
    let message_listener = Arc::new(MessageListener::new(api.clone()));

    let handler = Arc::new(TaskRequestHandler::new(
        api.clone(),
        event_logger.clone(),
        artifact_store,
        image_cache,
        command_registry,
        observer_manager,
        message_listener,
        registration.runner_id,
        config.workdir.clone(),
        config.local_mode,
        config.on_gpu,
        mpi_config,
    ));

    let termination = Arc::new(TerminationHandler::new(
        registration.runner_id,
        event_logger,
        handler.clone(),
    ));

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn(main_loop::install_signal_handlers(
        termination.clone(),
        shutdown.clone(),
    ));

    let loop_config = MainLoopConfig::new(config.max_idle_timeout.map(Duration::from_secs));
    main_loop::run(api, handler, termination, loop_config, shutdown).await;

    signal_task.abort();
    tracing::info!("task runner exiting cleanly");
    Ok(())
}
