//! Russh connection module
//!
//! SSH connectivity using the russh crate. Commands run on session
//! channels; file transfers go through an SFTP subsystem channel.

use async_trait::async_trait;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use russh_keys::agent::client::AgentClient;
use russh_sftp::client::SftpSession;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use super::{
    CommandResult, Connection, ConnectionError, ConnectionResult, ExecuteOptions, RusshError,
    TransferOptions,
};
use crate::inventory::Host;

/// Result of checking a server key against known_hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostKeyStatus {
    /// Key matches the known_hosts entry
    Verified,
    /// Host not listed (first connection)
    Unknown,
    /// Host listed with a different key
    Mismatch,
}

/// Client handler for russh.
///
/// Checks the server key against `~/.ssh/known_hosts`. Unknown hosts are
/// accepted like `StrictHostKeyChecking=accept-new` without persisting the
/// key; a changed key is rejected.
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl ClientHandler {
    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            known_hosts: dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")),
        }
    }

    fn verify_host_key(&self, server_key: &PublicKey) -> HostKeyStatus {
        let Some(path) = self.known_hosts.as_ref().filter(|p| p.exists()) else {
            return HostKeyStatus::Unknown;
        };
        match russh_keys::check_known_hosts_path(&self.host, self.port, server_key, path) {
            Ok(true) => HostKeyStatus::Verified,
            Ok(false) => HostKeyStatus::Unknown,
            Err(russh_keys::Error::KeyChanged { line }) => {
                warn!(
                    host = %self.host,
                    known_hosts = %path.display(),
                    line,
                    "Host key mismatch! The server's key differs from known_hosts"
                );
                HostKeyStatus::Mismatch
            }
            Err(e) => {
                debug!(host = %self.host, error = %e, "Could not check known_hosts");
                HostKeyStatus::Unknown
            }
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.verify_host_key(server_public_key) {
            HostKeyStatus::Verified => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            HostKeyStatus::Unknown => {
                warn!(
                    host = %self.host,
                    fingerprint = %server_public_key.fingerprint(),
                    "Host not found in known_hosts, accepting (first connection)"
                );
                Ok(true)
            }
            HostKeyStatus::Mismatch => {
                warn!(
                    host = %self.host,
                    "HOST KEY VERIFICATION FAILED! Server key does not match known_hosts entry."
                );
                Ok(false)
            }
        }
    }
}

/// Russh connection implementation
pub struct RusshConnection {
    /// Session identifier (`user@address:port`)
    identifier: String,
    /// Russh client handle. Read lock for channel operations, write lock to close.
    handle: Arc<RwLock<Option<Handle<ClientHandler>>>>,
    /// Whether the connection is established
    connected: Arc<AtomicBool>,
    /// Total commands executed
    commands_executed: AtomicU64,
}

impl RusshConnection {
    /// Connect to `host` and authenticate with its credentials.
    pub async fn connect(host: &Host, timeout: Duration) -> ConnectionResult<Self> {
        let identifier = format!("{}@{}:{}", host.user, host.address, host.port);
        debug!(
            host = %host.address,
            port = %host.port,
            user = %host.user,
            "Connecting via SSH (russh)"
        );

        let mut config = russh::client::Config::default();
        config.inactivity_timeout = Some(Duration::from_secs(600));
        let config = Arc::new(config);

        let addr = format!("{}:{}", host.address, host.port);
        let socket = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
            })?;

        socket.set_nodelay(true).map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        let handler = ClientHandler::new(&host.address, host.port);

        let mut session = russh::client::connect_stream(config, socket, handler)
            .await
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e))
            })?;

        Self::authenticate(&mut session, host).await?;

        debug!(identifier = %identifier, "SSH connection established");

        Ok(Self {
            identifier,
            handle: Arc::new(RwLock::new(Some(session))),
            connected: Arc::new(AtomicBool::new(true)),
            commands_executed: AtomicU64::new(0),
        })
    }

    /// Try the configured key, the SSH agent, the default identity files,
    /// then the password.
    async fn authenticate(session: &mut Handle<ClientHandler>, host: &Host) -> ConnectionResult<()> {
        if let Some(key_path) = &host.private_key {
            match Self::try_key_auth(session, &host.user, key_path).await {
                Ok(()) => {
                    debug!(key = %key_path.display(), "Authenticated using configured key");
                    return Ok(());
                }
                Err(e) => warn!(key = %key_path.display(), error = %e, "Configured key rejected"),
            }
        }

        match Self::try_agent_auth(session, &host.user).await {
            Ok(()) => {
                debug!("Authenticated using SSH agent");
                return Ok(());
            }
            Err(e) => trace!(error = %e, "SSH agent authentication unavailable"),
        }

        for key_path in &default_identity_files() {
            match Self::try_key_auth(session, &host.user, key_path).await {
                Ok(()) => {
                    debug!(key = %key_path.display(), "Authenticated using key");
                    return Ok(());
                }
                Err(e) => trace!(key = %key_path.display(), error = %e, "Key rejected"),
            }
        }

        if let Some(password) = &host.password {
            let authenticated = session
                .authenticate_password(&host.user, password)
                .await
                .map_err(|e| {
                    ConnectionError::AuthenticationFailed(format!(
                        "Password authentication failed: {}",
                        e
                    ))
                })?;

            if authenticated {
                debug!("Authenticated using password");
                return Ok(());
            }
        }

        Err(ConnectionError::AuthenticationFailed(
            "All authentication methods failed".to_string(),
        ))
    }

    /// Offer every identity held by the agent behind `SSH_AUTH_SOCK`.
    async fn try_agent_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
    ) -> ConnectionResult<()> {
        let mut agent = AgentClient::connect_env().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to connect to SSH agent: {}", e))
        })?;

        let identities = agent.request_identities().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to get agent identities: {}", e))
        })?;
        debug!(identity_count = %identities.len(), "Found SSH agent identities");

        for identity in identities {
            let (returned_agent, result) = session
                .authenticate_future(user, identity.clone(), agent)
                .await;
            agent = returned_agent;

            match result {
                Ok(true) => return Ok(()),
                Ok(false) => trace!("Agent identity rejected"),
                Err(e) => trace!(error = %e, "Agent authentication attempt failed"),
            }
        }

        Err(ConnectionError::AuthenticationFailed(
            "No SSH agent identity accepted".to_string(),
        ))
    }

    async fn try_key_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
    ) -> ConnectionResult<()> {
        if !key_path.exists() {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Key file not found: {}",
                key_path.display()
            )));
        }

        let key_pair = load_secret_key(key_path, None).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!(
                "Failed to load key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "Key authentication failed for {}: {}",
                    key_path.display(),
                    e
                ))
            })?;

        if authenticated {
            Ok(())
        } else {
            Err(ConnectionError::AuthenticationFailed(
                "Key authentication failed".to_string(),
            ))
        }
    }

    async fn open_sftp(&self) -> ConnectionResult<SftpSession> {
        let handle_guard = self.handle.read().await;
        let handle = handle_guard
            .as_ref()
            .ok_or(ConnectionError::ConnectionClosed)?;

        let channel = handle.channel_open_session().await.map_err(|e| {
            self.mark_broken();
            ConnectionError::TransferFailed(format!("Failed to open channel: {}", e))
        })?;
        drop(handle_guard);

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        SftpSession::new(channel.into_stream()).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create SFTP session: {}", e))
        })
    }

    async fn create_remote_dirs_sftp(sftp: &SftpSession, path: &Path) {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if current.to_string_lossy() == "/" {
                continue;
            }
            // Already-existing directories fail here; that is fine.
            let _ = sftp.create_dir(current.to_string_lossy().to_string()).await;
        }
    }

    fn mark_broken(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn run_channel(&self, full_command: String) -> ConnectionResult<CommandResult> {
        let handle_guard = self.handle.read().await;
        let handle = handle_guard
            .as_ref()
            .ok_or(ConnectionError::ConnectionClosed)?;

        let mut channel = handle.channel_open_session().await.map_err(|e| {
            self.mark_broken();
            ConnectionError::ExecutionFailed(format!("Failed to open channel: {}", e))
        })?;
        drop(handle_guard);

        channel.exec(true, full_command).await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to execute command: {}", e))
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } => {
                    // ext 1 is stderr
                    if ext == 1 {
                        stderr.extend_from_slice(data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code: i32 = exit_code.map(|e| e as i32).unwrap_or(i32::MAX);
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        trace!(exit_code = %exit_code, "Command completed");

        if exit_code == 0 {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(exit_code, stdout, stderr))
        }
    }
}

/// Default identity files tried after the host's own key.
fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.exists())
        .collect()
}

#[async_trait]
impl Connection for RusshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        // Failed channel opens flip `connected`; a live handle is trusted otherwise.
        self.handle.read().await.is_some()
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        options.validate()?;
        let full_command = options.compose(command);

        trace!(command = %full_command, "Executing remote command");
        self.commands_executed.fetch_add(1, Ordering::Relaxed);

        match options.timeout {
            Some(timeout_secs) => {
                match tokio::time::timeout(
                    Duration::from_secs(timeout_secs),
                    self.run_channel(full_command),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout(timeout_secs)),
                }
            }
            None => self.run_channel(full_command).await,
        }
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        let remote_path = sftp_path(remote_path);
        let remote_path = remote_path.as_path();
        debug!(
            remote = %remote_path.display(),
            size = %content.len(),
            "Uploading content via SFTP"
        );

        let sftp = self.open_sftp().await?;

        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                Self::create_remote_dirs_sftp(&sftp, parent).await;
            }
        }

        let remote_path_str = remote_path.to_string_lossy().to_string();
        let mut remote_file = sftp.create(&remote_path_str).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to create remote file {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        remote_file.write_all(content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to write to remote file: {}", e))
        })?;
        remote_file.shutdown().await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to close remote file: {}", e))
        })?;
        drop(remote_file);

        if let Some(mode) = options.mode {
            let mut attrs = russh_sftp::protocol::FileAttributes::default();
            attrs.permissions = Some(mode);
            sftp.set_metadata(&remote_path_str, attrs)
                .await
                .map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to set file permissions: {}",
                        e
                    ))
                })?;
        }

        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        let remote_path = sftp_path(remote_path);
        let remote_path = remote_path.as_path();
        debug!(remote = %remote_path.display(), "Downloading content via SFTP");

        let sftp = self.open_sftp().await?;
        let remote_path_str = remote_path.to_string_lossy().to_string();
        let mut remote_file = sftp.open(&remote_path_str).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to open remote file {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        let mut content = Vec::new();
        remote_file.read_to_end(&mut content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to read remote file: {}", e))
        })?;

        debug!(size = %content.len(), "Content download completed");
        Ok(content)
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let sftp = self.open_sftp().await?;
        let path = sftp_path(path);
        let path_str = path.to_string_lossy().to_string();
        match sftp.try_exists(&path_str).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Error checking path existence");
                Ok(false)
            }
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        debug!(
            identifier = %self.identifier,
            commands_executed = %self.commands_executed.load(Ordering::Relaxed),
            "Closing SSH connection"
        );

        self.connected.store(false, Ordering::SeqCst);

        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "Connection closed by client", "en")
                .await
            {
                warn!(identifier = %self.identifier, error = %e, "Disconnect failed");
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for RusshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnection")
            .field("identifier", &self.identifier)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

/// SFTP resolves relative paths against the login directory, so a leading
/// `~/` is dropped rather than sent as a literal directory name.
fn sftp_path(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) if rest.as_os_str().is_empty() => PathBuf::from("."),
        Ok(rest) => rest.to_path_buf(),
        Err(_) => path.to_path_buf(),
    }
}
