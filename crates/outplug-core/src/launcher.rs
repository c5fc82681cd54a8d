//! Plugin launcher: command resolution, subprocess startup, handshake and
//! service negotiation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::logbridge::{LogBridge, LogSink, PluginLevel};
use crate::protocol::{Output, PluginError, SERVICE_NAME};
use crate::transport::rpc::codec;
use crate::transport::{
    ALLOWED_TRANSPORTS, ENV_PROTOCOL_VERSIONS, ENV_TRANSPORTS, HANDSHAKE, HandshakeConfig,
    HandshakeError, HandshakeLine, NegotiateError, Network, RpcClient, RpcOutput, Transport,
    transports_env_value,
};

/// Every plugin executable name starts with this.
pub const PLUGIN_PREFIX: &str = "xk6-output-plugin-";

/// How long a reaped-or-killed plugin's diagnostics may take to drain.
const FORWARDER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid plugin command line {0:?}")]
    InvalidCommand(String),

    #[error("failed to start plugin {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("plugin handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("failed to connect to plugin at {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("plugin does not implement the output interface (missing {})", missing.join(", "))]
    InvalidPlugin { missing: Vec<String> },

    #[error("plugin refused the output service: {0}")]
    Dispense(#[source] PluginError),

    #[error("plugin did not become ready within {0:?}")]
    StartTimeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub handshake: HandshakeConfig,
    pub allowed: Vec<Transport>,
    /// Budget for the handshake and service negotiation together.
    pub start_timeout: Duration,
    /// Time between SIGTERM and kill at shutdown.
    pub stop_grace: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE,
            allowed: ALLOWED_TRANSPORTS.to_vec(),
            start_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// An executable reference after prefix normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub path: String,
    /// Base name without [`PLUGIN_PREFIX`]; names the plugin's logger.
    pub plugin_name: String,
}

/// Normalize the first token of a plugin command line.
///
/// The file part gets [`PLUGIN_PREFIX`] unless it already has it; the
/// directory part (including an explicit `./`) is kept verbatim.
pub fn resolve_command(reference: &str) -> ResolvedCommand {
    let (dir, file) = match reference.rfind('/') {
        Some(idx) => reference.split_at(idx + 1),
        None => ("", reference),
    };

    let file = if file.starts_with(PLUGIN_PREFIX) {
        file.to_string()
    } else {
        format!("{PLUGIN_PREFIX}{file}")
    };
    let plugin_name = file
        .strip_prefix(PLUGIN_PREFIX)
        .unwrap_or(&file)
        .to_string();

    ResolvedCommand {
        path: format!("{dir}{file}"),
        plugin_name,
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Find `name` the way a shell would: names containing `/` are checked
/// directly, anything else is searched for on `PATH`.
pub fn look_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// A running, negotiated plugin process.
///
/// Dropping the handle kills the process; [`shutdown`](Self::shutdown)
/// gives it a chance to exit on its own first.
pub struct PluginHandle {
    name: String,
    child: Child,
    output: Arc<RpcOutput>,
    stdin: Option<ChildStdin>,
    forwarders: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn output(&self) -> Arc<dyn Output> {
        Arc::clone(&self.output) as Arc<dyn Output>
    }

    /// Terminate the process: SIGTERM, wait up to `grace`, then kill.
    pub async fn shutdown(mut self, grace: Duration) {
        drop(self.stdin.take());
        terminate(&mut self.child, grace).await;
        drain(std::mem::take(&mut self.forwarders)).await;
        debug!(plugin = %self.name, "plugin process released");
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    if let Ok(raw) = i32::try_from(pid) {
        // SAFETY: pid belongs to a child we spawned and have not reaped.
        let ret = unsafe { libc::kill(raw, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to kill");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "plugin exited"),
        _ => {
            debug!(pid, "plugin did not exit within grace period, killing");
            let _ = child.kill().await;
        }
    }
}

async fn drain(forwarders: Vec<JoinHandle<()>>) {
    for forwarder in forwarders {
        if tokio::time::timeout(FORWARDER_DRAIN, forwarder).await.is_err() {
            debug!("plugin output forwarder still running after drain timeout");
        }
    }
}

async fn forward_stderr(stderr: ChildStderr, bridge: LogBridge) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => bridge.accept_line(&line),
            Ok(None) => break,
            Err(e) => {
                warn!(plugin = bridge.name(), error = %e, "error reading plugin stderr");
                break;
            }
        }
    }
}

/// Stray stdout after a socket handshake is diagnostic noise.
async fn forward_stdout(mut stdout: FramedRead<ChildStdout, LinesCodec>, bridge: LogBridge) {
    while let Some(Ok(line)) = stdout.next().await {
        bridge.accept(PluginLevel::Debug, &line, &[]);
    }
}

fn lines_error(e: LinesCodecError) -> HandshakeError {
    match e {
        LinesCodecError::Io(e) => HandshakeError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            HandshakeError::Malformed("<handshake line too long>".to_string())
        }
    }
}

async fn read_handshake(
    stdout: &mut FramedRead<ChildStdout, LinesCodec>,
    child: &mut Child,
    options: &LaunchOptions,
) -> Result<HandshakeLine, HandshakeError> {
    match stdout.next().await {
        Some(Ok(line)) => HandshakeLine::parse(&line, &options.handshake, &options.allowed),
        Some(Err(e)) => Err(lines_error(e)),
        None => {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("unknown status: {e}"),
            };
            Err(HandshakeError::Exited { status })
        }
    }
}

fn missing_pipe(name: &str) -> LaunchError {
    LaunchError::Handshake(HandshakeError::Io(std::io::Error::other(format!(
        "child {name} was not captured"
    ))))
}

async fn connect_socket(handshake: &HandshakeLine) -> Result<RpcClient, LaunchError> {
    let address = handshake.address.clone();
    match handshake.network {
        Network::Tcp => {
            let stream = TcpStream::connect(&address)
                .await
                .map_err(|source| LaunchError::Connect { address, source })?;
            let (read, write) = stream.into_split();
            Ok(RpcClient::new(FramedRead::new(read, codec()), write))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(&address)
                .await
                .map_err(|source| LaunchError::Connect { address, source })?;
            let (read, write) = stream.into_split();
            Ok(RpcClient::new(FramedRead::new(read, codec()), write))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(LaunchError::Connect {
            address,
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        }),
        Network::Stdio => Err(HandshakeError::NetworkMismatch {
            transport: handshake.transport,
            network: Network::Stdio.as_str(),
        }
        .into()),
    }
}

/// Handshake, connect and negotiate. Returns stdin when the transport does
/// not consume it.
async fn establish(
    child: &mut Child,
    bridge: &LogBridge,
    forwarders: &mut Vec<JoinHandle<()>>,
    options: &LaunchOptions,
) -> Result<(RpcOutput, Option<ChildStdin>), LaunchError> {
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let mut stdout = FramedRead::new(stdout, codec());

    let handshake = read_handshake(&mut stdout, child, options).await?;
    debug!(
        plugin = bridge.name(),
        transport = %handshake.transport,
        address = %handshake.address,
        "plugin handshake complete"
    );

    let (client, stdin) = match handshake.transport {
        Transport::Stdio => (RpcClient::new(stdout, stdin), None),
        Transport::JsonRpc => {
            let client = connect_socket(&handshake).await?;
            forwarders.push(tokio::spawn(forward_stdout(stdout, bridge.clone())));
            (client, Some(stdin))
        }
    };

    let output = Arc::new(client)
        .negotiate(&CancellationToken::new(), SERVICE_NAME)
        .await
        .map_err(|e| match e {
            NegotiateError::MissingCapabilities { missing, .. } => {
                LaunchError::InvalidPlugin { missing }
            }
            NegotiateError::Dispense(e) => LaunchError::Dispense(e),
        })?;
    Ok((output, stdin))
}

/// Start the plugin named by `command_line` and negotiate the output
/// service with it. Plugin diagnostics are forwarded to `sink`.
pub async fn launch(
    command_line: &str,
    sink: Arc<dyn LogSink>,
    options: &LaunchOptions,
) -> Result<PluginHandle, LaunchError> {
    let tokens = shlex::split(command_line)
        .ok_or_else(|| LaunchError::InvalidCommand(command_line.to_string()))?;
    let Some((first, args)) = tokens.split_first() else {
        return Err(LaunchError::InvalidCommand(command_line.to_string()));
    };

    let resolved = resolve_command(first);
    let bridge = LogBridge::new(resolved.plugin_name.clone(), sink);
    let program = look_path(&resolved.path).unwrap_or_else(|| PathBuf::from(&resolved.path));

    let mut child = Command::new(&program)
        .args(args)
        .env(
            options.handshake.magic_cookie_key,
            options.handshake.magic_cookie_value,
        )
        .env(
            ENV_PROTOCOL_VERSIONS,
            options.handshake.protocol_version.to_string(),
        )
        .env(ENV_TRANSPORTS, transports_env_value(&options.allowed))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
    debug!(
        plugin = %resolved.plugin_name,
        program = %program.display(),
        pid = ?child.id(),
        "plugin process spawned"
    );

    let mut forwarders = Vec::new();
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_stderr(stderr, bridge.clone())));
    }

    let established = tokio::time::timeout(
        options.start_timeout,
        establish(&mut child, &bridge, &mut forwarders, options),
    )
    .await
    .unwrap_or(Err(LaunchError::StartTimeout(options.start_timeout)));

    match established {
        Ok((output, stdin)) => Ok(PluginHandle {
            name: resolved.plugin_name,
            child,
            output: Arc::new(output),
            stdin,
            forwarders,
        }),
        Err(e) => {
            warn!(plugin = %resolved.plugin_name, error = %e, "plugin failed to start");
            let _ = child.kill().await;
            drain(forwarders).await;
            Err(e)
        }
    }
}
