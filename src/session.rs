//! Per-connection session orchestration.
//!
//! Each accepted session channel gets an orchestrator task that owns the
//! SessionContext: it brings the user's container up, then loops on the
//! per-connection bus reacting to exec, resize, pipe-broken, and subsystem
//! events until the splice terminates or the channel closes.

use anyhow::{anyhow, Result};
use bollard::exec::StartExecResults;
use futures::StreamExt;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ContainerTemplate;
use crate::docker::IN_CONTAINER_DATA_DIR;
use crate::events::{EventBus, ServerEvent, SessionEvent};
use crate::lifecycle;
use crate::ssh::ServerState;

/// Environment variable advertising the management endpoint inside the
/// container.
pub const MANAGER_SOCK_ENV: &str = "BUBBLE_SOCK";

/// Guest-side path of the management socket under the workspace bind.
pub fn manager_sock_path() -> String {
    format!("{IN_CONTAINER_DATA_DIR}/daemon.sock")
}

/// State shared between the SSH request callbacks and the orchestrator task.
pub struct SessionShared {
    /// Stdin sender of the currently attached exec.
    pub stdin: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Terminal type from the last pty-req.
    pub term: std::sync::Mutex<Option<String>>,
    /// Whether the client ever requested a pty.
    pub has_pty: AtomicBool,
}

impl SessionShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stdin: Mutex::new(None),
            term: std::sync::Mutex::new(None),
            has_pty: AtomicBool::new(false),
        })
    }
}

/// Everything the orchestrator needs from the accepting handler.
pub struct SessionParams {
    pub user: String,
    pub peer: SocketAddr,
    pub handle: Handle,
    pub channel_id: ChannelId,
    pub events: broadcast::Receiver<SessionEvent>,
    pub session_bus: EventBus<SessionEvent>,
    pub shared: Arc<SessionShared>,
    /// Child of the root token; cancelling it tears the TCP connection down.
    pub cancel: CancellationToken,
}

/// Run one session to completion.
pub async fn run(state: Arc<ServerState>, params: SessionParams) {
    let user = params.user.clone();
    let peer = params.peer;
    let handle = params.handle.clone();
    let channel_id = params.channel_id;
    let cancel = params.cancel.clone();

    state.bus.publish(ServerEvent::ConnectionEstablished {
        user: user.clone(),
        peer,
    });

    if let Err(err) = drive(&state, params).await {
        info!("({user}) Session closed, message: {err:#}");
    }

    let _ = handle.close(channel_id).await;
    cancel.cancel();
    state
        .bus
        .publish(ServerEvent::ConnectionClosed { user, peer });
}

async fn drive(state: &Arc<ServerState>, mut params: SessionParams) -> Result<()> {
    let user = params.user.clone();
    let handle = params.handle.clone();
    let channel_id = params.channel_id;

    let Some(template) = state.templates.resolve(&user) else {
        let err = crate::error::GatewayError::TemplateNotFound(user.clone());
        print_text_ln(&handle, channel_id, &err.to_string()).await;
        return Err(err.into());
    };
    let template = template.clone();

    info!("Preparing container for {user}...");
    let container_name = format!("workspace-{user}");
    let workspace_dir = state.config.workspace_dir(&user);
    let prepared = lifecycle::prepare_container(
        &state.engine,
        &state.config,
        &container_name,
        workspace_dir.as_deref(),
        &template,
    )
    .await;
    let (container_id, is_new) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            print_text_ln(&handle, channel_id, &format!("Failed to prepare container: {err:#}"))
                .await;
            return Err(err);
        }
    };

    let manager_active =
        template.enable_manager && state.config.workspace_parent.is_some() && state.manager_online;

    if is_new && manager_active {
        match state.engine.inspect_ip(&container_id).await {
            Ok(ip) => state.bus.publish(ServerEvent::ContainerRegistered {
                container_id: container_id.clone(),
                ip,
                ports: template.port_forwarding,
            }),
            Err(err) => {
                // The session stays up without the manager.
                warn!("({user}) Cannot register container with the manager: {err:#}");
            }
        }
    }

    let mut pty = PtySession {
        state: state.clone(),
        shared: params.shared.clone(),
        session_bus: params.session_bus.clone(),
        handle: handle.clone(),
        channel_id,
        user: user.clone(),
        container_id,
        manager_active,
        last_exec_id: None,
        last_close: None,
    };

    loop {
        tokio::select! {
            _ = params.cancel.cancelled() => return Ok(()),
            event = params.events.recv() => match event {
                Ok(SessionEvent::Exec { silent, argv }) => {
                    pty.on_exec(&template, silent, argv).await?;
                }
                Ok(SessionEvent::Resize { width, height }) => {
                    pty.on_resize(width, height).await;
                }
                Ok(SessionEvent::PipeBroken { exec_id }) => {
                    if pipe_breaks_session(pty.last_exec_id.as_deref(), &exec_id) {
                        return Err(anyhow!("pipe is broken: {exec_id}"));
                    }
                    info!("({user}) Pty exec switch detected");
                }
                Ok(SessionEvent::SubsystemRequest { name }) => {
                    info!("({user}) Subsystem {name} is unsupported");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("({user}) Session bus lagged, {skipped} events dropped");
                }
            }
        }
    }
}

/// A session terminates on a broken pipe only for the exec it is currently
/// attached to; stale splices from an exec switch are ignored.
fn pipe_breaks_session(current: Option<&str>, broken: &str) -> bool {
    current == Some(broken)
}

/// Aborts both splice directions when dropped, detaching the exec.
struct SpliceHandle {
    stdin: JoinHandle<()>,
    stdout: JoinHandle<()>,
}

impl Drop for SpliceHandle {
    fn drop(&mut self) {
        self.stdin.abort();
        self.stdout.abort();
    }
}

/// Pty-facing state: at most one live exec attachment at any instant.
struct PtySession {
    state: Arc<ServerState>,
    shared: Arc<SessionShared>,
    session_bus: EventBus<SessionEvent>,
    handle: Handle,
    channel_id: ChannelId,
    user: String,
    container_id: String,
    manager_active: bool,
    last_exec_id: Option<String>,
    last_close: Option<SpliceHandle>,
}

impl PtySession {
    async fn on_exec(
        &mut self,
        template: &ContainerTemplate,
        silent: bool,
        argv: Option<Vec<String>>,
    ) -> Result<()> {
        if !silent {
            print_text_ln(&self.handle, self.channel_id, "Redirecting to the container...").await;
        }
        let argv = argv.unwrap_or_else(|| template.exec.clone());

        // Clear the current id first so the stale splice's pipe-broken event
        // cannot take the session down, then tear the old attachment down.
        self.last_exec_id = None;
        self.last_close.take();

        let interactive = self.shared.has_pty.load(Ordering::Relaxed);
        let mut env = Vec::new();
        if self.manager_active {
            env.push(format!("{MANAGER_SOCK_ENV}={}", manager_sock_path()));
        }
        if let Some(term) = self.shared.term.lock().unwrap().clone() {
            env.push(format!("TERM={term}"));
        }

        let attach = self
            .attach_exec(argv, interactive, env)
            .await;
        match attach {
            Ok(()) => Ok(()),
            Err(err) => {
                print_text_ln(
                    &self.handle,
                    self.channel_id,
                    &format!("({}) Failed to redirect to container: {err:#}", self.container_id),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn attach_exec(
        &mut self,
        argv: Vec<String>,
        interactive: bool,
        env: Vec<String>,
    ) -> Result<()> {
        let engine = &self.state.engine;
        let exec_id = engine
            .exec_create(&self.container_id, argv, interactive, env)
            .await?;
        let results = engine.exec_attach(&exec_id, interactive).await?;
        let StartExecResults::Attached {
            mut output,
            mut input,
        } = results
        else {
            return Err(anyhow!("exec started detached unexpectedly"));
        };

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        *self.shared.stdin.lock().await = Some(stdin_tx);

        // Channel → exec. A dropped sender half-closes the exec's stdin so
        // non-interactive commands observe EOF.
        let stdin = tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if input.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = input.shutdown().await;
        });

        // Exec → channel. When this side returns the session learns about it
        // through the pipe-broken event.
        let handle = self.handle.clone();
        let channel_id = self.channel_id;
        let bus = self.session_bus.clone();
        let broken_id = exec_id.clone();
        let stdout = tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(out) => {
                        let data = out.into_bytes();
                        if handle
                            .data(channel_id, CryptoVec::from_slice(&data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("Exec output error: {err}");
                        break;
                    }
                }
            }
            let _ = handle.eof(channel_id).await;
            bus.publish(SessionEvent::PipeBroken { exec_id: broken_id });
        });

        self.last_exec_id = Some(exec_id);
        self.last_close = Some(SpliceHandle { stdin, stdout });
        Ok(())
    }

    async fn on_resize(&mut self, width: u32, height: u32) {
        let Some(exec_id) = self.last_exec_id.as_deref() else {
            debug!(
                "Cannot perform pty resize for {} since no exec is attached",
                self.user
            );
            return;
        };
        if let Err(err) = self
            .state
            .engine
            .exec_resize(exec_id, width as u16, height as u16)
            .await
        {
            warn!("Failed to resize exec session: {err:#}");
        }
    }
}

async fn print_text_ln(handle: &Handle, channel_id: ChannelId, text: &str) {
    let _ = handle
        .data(channel_id, CryptoVec::from_slice(format!("{text}\r\n").as_bytes()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_broken_terminates_only_the_current_exec() {
        assert!(pipe_breaks_session(Some("e1"), "e1"));
        assert!(!pipe_breaks_session(Some("e2"), "e1"));
        assert!(!pipe_breaks_session(None, "e1"));
    }

    #[test]
    fn manager_socket_path_lives_under_the_workspace_bind() {
        assert_eq!(manager_sock_path(), "/mnt/data/daemon.sock");
    }
}
