//! Container-engine adapter.
//!
//! A thin domain layer over the Docker API: existence/status lookup,
//! create-from-template, lifecycle verbs, exec create/attach/resize, and the
//! network plumbing the gateway needs. Engine errors are reported to the
//! caller and never retried here.

use anyhow::{anyhow, Context, Result};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, NetworkCreateRequest,
    NetworkDisconnectRequest, NetworkingConfig,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, KillContainerOptionsBuilder,
    ListContainersOptionsBuilder, ListNetworksOptions, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{info, warn};

use crate::config::ContainerTemplate;
use crate::error::GatewayError;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_CREATED: &str = "created";
pub const STATUS_PAUSED: &str = "paused";
pub const STATUS_EXITED: &str = "exited";
pub const STATUS_UP: &str = "up";

/// Guest path of the per-user workspace bind.
pub const IN_CONTAINER_DATA_DIR: &str = "/mnt/data";
/// Guest path of the global share bind.
pub const IN_CONTAINER_SHARE_DIR: &str = "/mnt/share";
/// Logical endpoint alias every workspace joins the configured network under.
pub const NETWORK_ALIAS: &str = "network";

/// Result of a by-name container lookup.
#[derive(Debug, Clone)]
pub struct ContainerHit {
    pub id: String,
    pub status: String,
}

/// Shared, thread-safe handle to the container engine.
pub struct ContainerEngine {
    docker: Docker,
}

impl ContainerEngine {
    /// Connect with the local daemon defaults and verify liveness.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        docker.ping().await.context("Failed to ping Docker daemon")?;
        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Client handle without the liveness check, for tests that never reach
    /// the engine.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Result<Self> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }

    /// Look a container up by canonical name, including stopped ones.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<ContainerHit>> {
        let options = ListContainersOptionsBuilder::new().all(true).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        for container in containers {
            let names = container.names.unwrap_or_default();
            if !names
                .iter()
                .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
            {
                continue;
            }
            let Some(id) = container.id else { continue };
            return Ok(Some(ContainerHit {
                id,
                status: clean_status(container.status.as_deref().unwrap_or("")),
            }));
        }
        Ok(None)
    }

    /// Materialise and start a container for `template` under the canonical
    /// `name`.
    pub async fn create_from_template(
        &self,
        name: &str,
        data_dir: Option<&str>,
        share_dir: Option<&str>,
        network: &str,
        runtime: &str,
        template: &ContainerTemplate,
    ) -> Result<String> {
        let mut body = build_create_body(name, data_dir, share_dir, runtime, template);

        if !network.is_empty() && !self.is_network_member(name, network).await {
            body.networking_config = Some(NetworkingConfig {
                endpoints_config: Some(HashMap::from([(
                    NETWORK_ALIAS.to_string(),
                    EndpointSettings {
                        network_id: Some(network.to_string()),
                        ..Default::default()
                    },
                )])),
            });
        }

        let options = CreateContainerOptionsBuilder::new().name(name).build();
        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|err| GatewayError::ContainerCreate(err.into()))?;
        let id = response.id;
        info!("Created container {} ({})", name, short_id(&id));

        self.docker
            .start_container(&id, None::<StartContainerOptions>)
            .await
            .map_err(|err| GatewayError::ContainerStart(err.into()))?;

        Ok(id)
    }

    async fn is_network_member(&self, name: &str, network: &str) -> bool {
        let Ok(info) = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        else {
            return false;
        };
        info.network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| {
                networks
                    .values()
                    .any(|endpoint| endpoint.network_id.as_deref() == Some(network))
            })
            .unwrap_or(false)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|err| GatewayError::ContainerStart(err.into()))?;
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(10).build()))
            .await
            .with_context(|| format!("failed to stop container {}", short_id(id)))?;
        Ok(())
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(
                id,
                Some(KillContainerOptionsBuilder::new().signal("SIGKILL").build()),
            )
            .await
            .with_context(|| format!("failed to kill container {}", short_id(id)))?;
        Ok(())
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new().force(force).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .with_context(|| format!("failed to remove container {}", short_id(id)))?;
        Ok(())
    }

    /// Stop the container, falling back to kill, then remove it.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        if let Err(err) = self.stop(id).await {
            warn!("{err:#}");
            self.kill(id).await?;
            info!("killed container {}", short_id(id));
        }
        self.remove(id, true).await
    }

    /// Create an exec with attached stdio. Returns the exec id.
    pub async fn exec_create(
        &self,
        id: &str,
        cmd: Vec<String>,
        tty: bool,
        env: Vec<String>,
    ) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            env: Some(env),
            ..Default::default()
        };

        let response = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|err| GatewayError::ContainerExec(err.into()))?;
        Ok(response.id)
    }

    /// Attach to a created exec, returning the duplex stream pair.
    pub async fn exec_attach(&self, exec_id: &str, tty: bool) -> Result<StartExecResults> {
        let options = StartExecOptions {
            detach: false,
            tty,
            output_capacity: None,
        };
        let results = self
            .docker
            .start_exec(exec_id, Some(options))
            .await
            .map_err(|err| GatewayError::ContainerExec(err.into()))?;
        Ok(results)
    }

    pub async fn exec_resize(&self, exec_id: &str, width: u16, height: u16) -> Result<()> {
        self.docker
            .resize_exec(exec_id, ResizeExecOptions { width, height })
            .await
            .context("Failed to resize exec")?;
        Ok(())
    }

    /// Detach the container from `network`. Used only on the exited-recovery
    /// path.
    pub async fn network_disconnect(&self, network: &str, id: &str) -> Result<()> {
        self.docker
            .disconnect_network(
                network,
                NetworkDisconnectRequest {
                    container: Some(id.to_string()),
                    force: Some(true),
                },
            )
            .await
            .with_context(|| format!("failed to disconnect {} from {network}", short_id(id)))?;
        Ok(())
    }

    /// Create the configured network when it does not exist yet.
    pub async fn ensure_network(&self, name: &str) -> Result<()> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .context("Failed to list networks")?;
        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(name))
        {
            return Ok(());
        }
        self.docker
            .create_network(NetworkCreateRequest {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("cannot create network {name}"))?;
        info!("Created network {name}");
        Ok(())
    }

    /// Read the container's address on the gateway network.
    pub async fn inspect_ip(&self, id: &str) -> Result<IpAddr> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;

        let ip = info
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(NETWORK_ALIAS))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "container {} has no address on the gateway network",
                    short_id(id)
                )
            })?;

        Ok(ip.parse()?)
    }
}

/// Normalise an engine status string: lower-case, first whitespace token.
/// Unrecognised statuses pass through verbatim.
fn clean_status(status: &str) -> String {
    status
        .to_lowercase()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string()
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Build engine create parameters for a template. Pure so the bind and
/// host-config composition stays testable.
fn build_create_body(
    name: &str,
    data_dir: Option<&str>,
    share_dir: Option<&str>,
    runtime: &str,
    template: &ContainerTemplate,
) -> ContainerCreateBody {
    let mut binds = template.volumes.clone();
    if let Some(data_dir) = data_dir {
        binds.push(format!("{data_dir}:{IN_CONTAINER_DATA_DIR}"));
    }
    if let Some(share_dir) = share_dir {
        binds.push(format!("{share_dir}:{IN_CONTAINER_SHARE_DIR}"));
    }

    let host_config = HostConfig {
        binds: Some(binds),
        auto_remove: Some(template.rm),
        privileged: Some(template.privilege),
        runtime: (!runtime.is_empty()).then(|| runtime.to_string()),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(template.image.clone()),
        hostname: Some(name.to_string()),
        tty: Some(true),
        cmd: (!template.cmd.is_empty()).then(|| template.cmd.clone()),
        env: (!template.env.is_empty()).then(|| template.env.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_normalisation() {
        assert_eq!(clean_status("Up 3 minutes"), "up");
        assert_eq!(clean_status("Exited (0) 2 hours ago"), "exited");
        assert_eq!(clean_status("Created"), "created");
        assert_eq!(clean_status("Paused"), "paused");
        assert_eq!(clean_status("Restarting (1) 5 seconds ago"), "restarting");
        assert_eq!(clean_status(""), "");
    }

    fn template() -> ContainerTemplate {
        ContainerTemplate {
            image: "alpine".to_string(),
            exec: vec!["/bin/sh".to_string()],
            env: vec!["LANG=C".to_string()],
            volumes: vec!["/opt/tools:/tools".to_string()],
            rm: true,
            ..ContainerTemplate::default()
        }
    }

    #[test]
    fn create_body_composes_binds() {
        let body = build_create_body(
            "workspace-alice",
            Some("/tmp/ws/alice"),
            Some("/srv/share"),
            "",
            &template(),
        );

        assert_eq!(body.hostname.as_deref(), Some("workspace-alice"));
        assert_eq!(body.tty, Some(true));
        assert_eq!(body.image.as_deref(), Some("alpine"));
        assert_eq!(body.cmd, None);
        assert_eq!(body.env, Some(vec!["LANG=C".to_string()]));

        let host_config = body.host_config.unwrap();
        assert_eq!(
            host_config.binds,
            Some(vec![
                "/opt/tools:/tools".to_string(),
                "/tmp/ws/alice:/mnt/data".to_string(),
                "/srv/share:/mnt/share".to_string(),
            ])
        );
        assert_eq!(host_config.auto_remove, Some(true));
        assert_eq!(host_config.privileged, Some(false));
        assert_eq!(host_config.runtime, None);
    }

    #[test]
    fn create_body_without_workspace_binds_only_volumes() {
        let body = build_create_body("workspace-bob", None, None, "runsc", &template());
        let host_config = body.host_config.unwrap();
        assert_eq!(
            host_config.binds,
            Some(vec!["/opt/tools:/tools".to_string()])
        );
        assert_eq!(host_config.runtime.as_deref(), Some("runsc"));
    }

    #[test]
    fn create_body_passes_entry_cmd() {
        let mut tpl = template();
        tpl.cmd = vec!["sleep".to_string(), "infinity".to_string()];
        let body = build_create_body("workspace-bob", None, None, "", &tpl);
        assert_eq!(
            body.cmd,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
    }
}
