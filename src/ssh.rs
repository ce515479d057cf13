//! SSH server implementation using russh.
//!
//! Accepts TCP connections, authenticates clients against the configured
//! key-sets, and translates session-channel requests into per-connection bus
//! events consumed by the session orchestrator. Also hosts the server-wide
//! bus handler that opens port forwarders on demand.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::auth::Authorizer;
use crate::config::{Config, TemplateIndex};
use crate::docker::ContainerEngine;
use crate::events::{EventBus, ServerEvent, SessionEvent};
use crate::forwarder;
use crate::manager;
use crate::session::{self, SessionParams, SessionShared};

const MAX_EXEC_COMMAND_LEN: usize = 1024;
const MAX_SUBSYSTEM_NAME_LEN: usize = 32;

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<Config>,
    pub templates: TemplateIndex,
    pub authorizer: Authorizer,
    pub engine: Arc<ContainerEngine>,
    pub bus: EventBus<ServerEvent>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    /// Whether the shared management service came up.
    pub manager_online: bool,
}

/// Run the SSH server until the root token is cancelled, then drain open
/// sessions and listeners.
pub async fn run_server(
    config: Arc<Config>,
    templates: TemplateIndex,
    authorizer: Authorizer,
    engine: Arc<ContainerEngine>,
    cancel: CancellationToken,
) -> Result<()> {
    let key = load_or_generate_host_key(&config.server_key_file).await?;

    if authorizer.is_open() {
        warn!("NO CLIENT AUTH IS ENABLED! YOU SHALL ONLY USE THIS IN TEST ENVIRONMENTS.");
    }

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let bus: EventBus<ServerEvent> = EventBus::new();
    let tracker = TaskTracker::new();

    let manager_online = match &config.manager_address {
        Some(address) if !address.is_empty() => {
            let address = listen_addr(address);
            match manager::start(
                engine.clone(),
                bus.clone(),
                &address,
                cancel.clone(),
                &tracker,
            )
            .await
            {
                Ok(_) => true,
                Err(err) => {
                    // Sessions stay usable without the manager.
                    warn!("Failed to start management service: {err:#}");
                    false
                }
            }
        }
        _ => false,
    };

    let state = Arc::new(ServerState {
        config: config.clone(),
        templates,
        authorizer,
        engine,
        bus: bus.clone(),
        cancel: cancel.clone(),
        tracker: tracker.clone(),
        manager_online,
    });

    spawn_bus_handler(state.clone());

    let address = listen_addr(&config.address);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to listen on address {address}"))?;
    info!("Listening on {address}...");

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to accept connection: {err}");
                    continue;
                }
            },
        };

        let state = state.clone();
        let russh_config = russh_config.clone();
        let conn_cancel = cancel.child_token();
        tracker.spawn(async move {
            let handler = ConnectionHandler::new(state, peer_addr, conn_cancel.clone());
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    tokio::select! {
                        // Dropping the running session closes the connection.
                        _ = conn_cancel.cancelled() => {}
                        result = session => {
                            if let Err(err) = result {
                                debug!("SSH session error: {err}");
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!("SSH handshake failed: {err}");
                }
            }
        });
    }

    info!("Shutting down ssh server...");
    drop(listener);
    tracker.close();
    tracker.wait().await;
    Ok(())
}

/// Server-bus subscriber: connection bookkeeping and port-forward dispatch.
/// The open-ports set is touched only on this task.
fn spawn_bus_handler(state: Arc<ServerState>) {
    let mut events = state.bus.subscribe();
    let tracker = state.tracker.clone();
    tracker.spawn(async move {
        let mut open_ports: HashSet<u16> = HashSet::new();
        loop {
            tokio::select! {
                _ = state.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(ServerEvent::ConnectionEstablished { user, peer }) => {
                        info!("New connection from {peer} as {user}");
                    }
                    Ok(ServerEvent::ConnectionClosed { user, peer }) => {
                        info!("Closed connection from {peer} as {user}");
                    }
                    Ok(ServerEvent::PortForwardRequest { src_port, dst_port, dst }) => {
                        info!(
                            "Received port forwarding request from {dst}: \
                             (host) {src_port} -> (guest) {dst_port}"
                        );
                        if !open_ports.insert(src_port) {
                            warn!("Port conflict: {src_port} -> {dst_port}");
                            continue;
                        }
                        if let Err(err) =
                            forwarder::forward(state.cancel.clone(), dst, src_port, dst_port).await
                        {
                            warn!("port forwarder failed to listen on {src_port}: {err}");
                        }
                    }
                    Ok(ServerEvent::ContainerRegistered { .. }) => {}
                    Err(RecvError::Closed) => return,
                    Err(RecvError::Lagged(_)) => continue,
                }
            }
        }
    });
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    state: Arc<ServerState>,
    peer_addr: SocketAddr,
    conn_cancel: CancellationToken,
    login: Option<String>,
    session_bus: EventBus<SessionEvent>,
    shared: Arc<SessionShared>,
    session_spawned: bool,
    has_pty: bool,
}

impl ConnectionHandler {
    fn new(state: Arc<ServerState>, peer_addr: SocketAddr, conn_cancel: CancellationToken) -> Self {
        Self {
            state,
            peer_addr,
            conn_cancel,
            login: None,
            session_bus: EventBus::new(),
            shared: SessionShared::new(),
            session_spawned: false,
            has_pty: false,
        }
    }

    fn decide_publickey(&mut self, user: &str, public_key: &PublicKey) -> Auth {
        match self.state.authorizer.authorize(user, public_key) {
            Ok(()) => {
                self.login = Some(user.to_string());
                Auth::Accept
            }
            Err(rejection) => {
                warn!("({user}) {}", crate::error::GatewayError::AuthRejected(rejection));
                // The rejection is a property of the matched key-set; a key
                // enrolled in another key-set may still authorise the login.
                Auth::Reject {
                    proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
                    partial_success: false,
                }
            }
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.state.authorizer.is_open() {
            self.login = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        })
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{user}' from {}", self.peer_addr);
        if self.state.authorizer.is_open() {
            self.login = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        Ok(self.decide_publickey(user, public_key))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.state.authorizer.is_open() {
            self.login = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        Ok(self.decide_publickey(user, public_key))
    }

    /// The first session channel gets the orchestrator; later ones are
    /// refused.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_spawned {
            debug!("Refusing extra session channel from {}", self.peer_addr);
            return Ok(false);
        }
        let user = self
            .login
            .clone()
            .ok_or_else(|| anyhow!("session channel before authentication"))?;

        let params = SessionParams {
            user,
            peer: self.peer_addr,
            handle: session.handle(),
            channel_id: channel.id(),
            events: self.session_bus.subscribe(),
            session_bus: self.session_bus.clone(),
            shared: self.shared.clone(),
            cancel: self.conn_cancel.clone(),
        };
        self.state
            .tracker
            .spawn(session::run(self.state.clone(), params));
        self.session_spawned = true;
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("PTY request: term={term}, cols={col_width}, rows={row_height}");
        *self.shared.term.lock().unwrap() = Some(term.to_string());
        if !self.has_pty {
            self.has_pty = true;
            self.shared
                .has_pty
                .store(true, std::sync::atomic::Ordering::Relaxed);
            // Exec first so the resize below has an attachment to land on.
            self.session_bus.publish(SessionEvent::Exec {
                silent: false,
                argv: None,
            });
        }
        self.session_bus.publish(SessionEvent::Resize {
            width: col_width,
            height: row_height,
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.session_bus.publish(SessionEvent::Resize {
            width: col_width,
            height: row_height,
        });
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The pty-req already scheduled the default exec.
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if data.len() > MAX_EXEC_COMMAND_LEN {
            return Err(anyhow!(
                "illegal exec payload length from {} ({} bytes)",
                self.peer_addr,
                data.len()
            ));
        }
        let command = String::from_utf8_lossy(data).to_string();
        info!("Exec request from {}: {command}", self.peer_addr);
        self.session_bus.publish(SessionEvent::Exec {
            silent: true,
            argv: Some(split_command(&command)),
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name.len() > MAX_SUBSYSTEM_NAME_LEN {
            // Acknowledged but dropped; the connection stays up.
            warn!(
                "Failed to handle subsystem request: illegal name length from {}",
                self.peer_addr
            );
            session.channel_success(channel)?;
            return Ok(());
        }
        self.session_bus.publish(SessionEvent::SubsystemRequest {
            name: name.to_string(),
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let sender = self.shared.stdin.lock().await.clone();
        if let Some(sender) = sender {
            let _ = sender.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {channel:?}");
        // Dropping the sender half-closes the exec's stdin.
        *self.shared.stdin.lock().await = None;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {channel:?}");
        *self.shared.stdin.lock().await = None;
        Ok(())
    }
}

/// Split an exec command line on spaces, the way the wire payload is defined.
fn split_command(command: &str) -> Vec<String> {
    command.split(' ').map(str::to_string).collect()
}

/// Accept Go-style ":2233" listen addresses alongside full host:port pairs.
fn listen_addr(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        return Ok(key);
    }

    info!("Generating new Ed25519 host key");
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let key_bytes = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    tokio::fs::write(path, key_bytes.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_split_on_spaces() {
        assert_eq!(split_command("echo hi"), vec!["echo", "hi"]);
        assert_eq!(split_command("ls"), vec!["ls"]);
    }

    #[test]
    fn bare_port_addresses_get_a_wildcard_host() {
        assert_eq!(listen_addr(":2233"), "0.0.0.0:2233");
        assert_eq!(listen_addr("127.0.0.1:2233"), "127.0.0.1:2233");
    }

    #[tokio::test]
    async fn host_key_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");

        let generated = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());
        let loaded = load_or_generate_host_key(&path).await.unwrap();
        assert_eq!(
            generated.public_key().to_openssh().unwrap(),
            loaded.public_key().to_openssh().unwrap()
        );
    }
}
