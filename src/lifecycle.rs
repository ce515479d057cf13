//! Container lifecycle reconciliation.
//!
//! Brings the requested container state (from a template) in line with the
//! observed engine state. Name collisions resolve to "reuse existing"; a
//! second container with the same canonical name is never created.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{Config, ContainerTemplate};
use crate::docker::{
    ContainerEngine, STATUS_CREATED, STATUS_EXITED, STATUS_PAUSED, STATUS_RUNNING, STATUS_UP,
};
use crate::error::GatewayError;

/// What an observed status requires before the container is attachable.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Ready,
    RestartAfterDisconnect,
    Unexpected,
}

fn reconcile(status: &str) -> Plan {
    match status {
        STATUS_RUNNING | STATUS_CREATED | STATUS_PAUSED | STATUS_UP | "" => Plan::Ready,
        STATUS_EXITED => Plan::RestartAfterDisconnect,
        _ => Plan::Unexpected,
    }
}

/// Ensure the named container exists and is running, creating it from the
/// template when absent. Returns the container id and whether it was freshly
/// created.
pub async fn prepare_container(
    engine: &ContainerEngine,
    config: &Config,
    name: &str,
    workspace_dir: Option<&Path>,
    template: &ContainerTemplate,
) -> Result<(String, bool)> {
    let existing = engine.find_by_name(name).await?;

    let Some(hit) = existing else {
        info!("Creating container {name}");
        let created = engine
            .create_from_template(
                name,
                workspace_dir.and_then(|p| p.to_str()),
                config
                    .global_share_dir
                    .as_deref()
                    .and_then(|p| p.to_str()),
                &config.network_group,
                &config.runtime,
                template,
            )
            .await;
        return match created {
            Ok(id) => Ok((id, true)),
            Err(err) => {
                // Clean up a partially created container; the name must stay
                // free for the next attempt.
                if let Err(remove_err) = engine.remove(name, false).await {
                    warn!("Failed to remove container: {remove_err:#}");
                }
                Err(err)
            }
        };
    };

    match reconcile(&hit.status) {
        Plan::Ready => {}
        Plan::RestartAfterDisconnect => {
            // A restart can fail while the container is still attached to the
            // network (docker/cli#1891), so disconnect first.
            if !config.network_group.is_empty() {
                if let Err(err) = engine
                    .network_disconnect(&config.network_group, &hit.id)
                    .await
                {
                    warn!("{err:#}");
                }
            }
            engine.start(&hit.id).await?;
        }
        Plan::Unexpected => {
            return Err(GatewayError::UnexpectedStatus(hit.status).into());
        }
    }

    Ok((hit.id, false))
}
