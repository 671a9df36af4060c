//! Machine group resolution, run once at startup before registration.
//!
//! Grounded in `task_runner.utils.machine_group` (and the `__main__`
//! registration sequence that calls it): an explicit id always wins; a name
//! is looked up against already-started groups; in local mode with neither
//! set, a group is created and started on the spot so a solo developer
//! runner doesn't have to pre-provision one by hand.

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::api_client::ApiClient;

/// Resolve `machine_group_id` / `machine_group_name` from [`RunnerConfig`
/// ](crate::config::RunnerConfig) to a concrete group id, or `None` if the
/// runner should register without one (only allowed outside local mode).
pub async fn resolve(
    api: &ApiClient,
    machine_group_id: Option<&str>,
    machine_group_name: Option<&str>,
    local_mode: bool,
) -> Result<Option<Uuid>> {
    if let Some(id) = machine_group_id {
        let id = Uuid::parse_str(id).context("MACHINE_GROUP_ID is not a valid UUID")?;
        return Ok(Some(id));
    }

    if let Some(name) = machine_group_name {
        if let Some(id) = api
            .get_started_machine_group_id_by_name(name)
            .await
            .context("failed to look up machine group by name")?
        {
            return Ok(Some(id));
        }
        if !local_mode {
            bail!("no started machine group named '{name}' and LOCAL_MODE is false");
        }
        let id = api
            .create_local_machine_group(Some(name))
            .await
            .context("failed to create local machine group")?;
        api.start_local_machine_group(id)
            .await
            .context("failed to start local machine group")?;
        return Ok(Some(id));
    }

    if local_mode {
        let id = api
            .create_local_machine_group(None)
            .await
            .context("failed to create local machine group")?;
        api.start_local_machine_group(id)
            .await
            .context("failed to start local machine group")?;
        return Ok(Some(id));
    }

    Ok(None)
}
