//! Host side: launch a plugin subprocess and own it until shutdown.

use std::borrow::Cow;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::{Level, debug, error, info, trace, warn};

use crate::capability::{CONTROL, Capability, PING, method_name};
use crate::error::{BridgeError, HandshakeError, LaunchError, TransportError};
use crate::handshake::{self, Announcement, HandshakeConfig, NETWORK_ENV, NetworkType};
use crate::registry::PluginSet;
use crate::transport::Session;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

/// Executable plus arguments and extra environment for the plugin.
#[derive(Debug, Clone)]
pub struct PluginCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl PluginCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Short name used in logs: the executable's file stem.
    fn label(&self) -> String {
        self.program
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("plugin")
            .to_owned()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub handshake: HandshakeConfig,
    pub plugins: PluginSet,
    pub command: PluginCommand,
    /// How long to wait for the handshake line.
    pub start_timeout: Duration,
    /// How long a terminated plugin gets before it is killed.
    pub kill_grace: Duration,
    /// Network type to ask the plugin for; it may announce another.
    pub network: Option<NetworkType>,
}

impl ClientConfig {
    pub fn new(handshake: HandshakeConfig, plugins: PluginSet, command: PluginCommand) -> Self {
        Self {
            handshake,
            plugins,
            command,
            start_timeout: DEFAULT_START_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            network: None,
        }
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn network(mut self, network: NetworkType) -> Self {
        self.network = Some(network);
        self
    }
}

/// A running, handshaken plugin.
///
/// The child is spawned with kill-on-drop, so dropping the client without
/// calling [`PluginClient::shutdown`] still takes the process down.
pub struct PluginClient {
    name: String,
    session: Session,
    plugins: PluginSet,
    announcement: Announcement,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    kill_grace: Duration,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("handshake", &self.announcement.to_string())
            .finish()
    }
}

/// Spawns the plugin, verifies its handshake and connects the transport.
///
/// On any failure the child is killed and reaped before the error returns.
pub async fn launch(config: ClientConfig) -> Result<PluginClient, BridgeError> {
    let ClientConfig {
        handshake,
        plugins,
        command,
        start_timeout,
        kill_grace,
        network,
    } = config;
    let name = command.label();

    let mut cmd = TokioCommand::new(&command.program);
    cmd.args(&command.args)
        .envs(command.env.iter().cloned())
        .env(&handshake.magic_cookie_key, &handshake.magic_cookie_value)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(network) = network {
        cmd.env(NETWORK_ENV, network.as_ref());
    }

    debug!(plugin = %name, program = %command.program.display(), "spawning plugin");
    let mut child = cmd.spawn().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => LaunchError::NotFound {
            program: command.program.clone(),
        },
        _ => LaunchError::Spawn {
            program: command.program.clone(),
            source: Arc::new(err),
        },
    })?;
    let pid = child.id();

    let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
    let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
        discard(&name, child).await;
        return Err(LaunchError::MissingPipe { pipe: "stdio" }.into());
    };
    relay_lines(name.clone(), Output::Stderr, stderr);

    let mut stdout = BufReader::new(stdout);
    let announcement = match negotiate(&mut stdout, &mut child, &handshake, start_timeout).await {
        Ok(announcement) => announcement,
        Err(err) => {
            warn!(plugin = %name, %err, "handshake failed");
            discard(&name, child).await;
            return Err(err.into());
        }
    };
    info!(plugin = %name, ?pid, handshake = %announcement, "plugin handshake accepted");

    let session = match announcement.network {
        NetworkType::Stdio => Session::spawn(name.clone(), stdout, stdin),
        NetworkType::Tcp => {
            let connect = tokio::time::timeout(start_timeout, TcpStream::connect(&announcement.address)).await;
            let stream = match connect {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    discard(&name, child).await;
                    return Err(LaunchError::Connect {
                        address: announcement.address.clone(),
                        source: Arc::new(err),
                    }
                    .into());
                }
                Err(_) => {
                    discard(&name, child).await;
                    return Err(HandshakeError::Timeout { timeout: start_timeout }.into());
                }
            };
            drop(stdin);
            relay_lines(name.clone(), Output::Stdout, stdout);
            let (reader, writer) = stream.into_split();
            Session::spawn(name.clone(), reader, writer)
        }
    };

    Ok(PluginClient {
        name,
        session,
        plugins,
        announcement,
        child: Mutex::new(Some(child)),
        pid,
        kill_grace,
        shut_down: AtomicBool::new(false),
    })
}

async fn negotiate<R>(
    stdout: &mut R,
    child: &mut Child,
    config: &HandshakeConfig,
    timeout: Duration,
) -> Result<Announcement, HandshakeError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let Some(line) = handshake::read_line(stdout, timeout).await? else {
        let status = match tokio::time::timeout(EXIT_STATUS_WAIT, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        };
        return Err(HandshakeError::Exited { status });
    };
    let announcement = Announcement::parse(&line)?;
    announcement.verify(config)?;
    Ok(announcement)
}

/// Kills and reaps a child that failed to come up.
async fn discard(name: &str, mut child: Child) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(plugin = name, %status, "plugin already exited");
        return;
    }
    if let Err(err) = child.kill().await {
        warn!(plugin = name, %err, "failed to kill plugin");
    }
}

#[derive(Debug, Clone, Copy)]
enum Output {
    Stdout,
    Stderr,
}

/// Emits `$message` at `$level`. Tracing needs both target and level to be
/// constant at each call site, hence the ladder.
macro_rules! relay_event {
    ($target:literal, $level:expr, $name:expr, $message:expr) => {{
        let level = $level;
        if level == Level::ERROR {
            error!(target: $target, plugin = %$name, "{}", $message);
        } else if level == Level::WARN {
            warn!(target: $target, plugin = %$name, "{}", $message);
        } else if level == Level::INFO {
            info!(target: $target, plugin = %$name, "{}", $message);
        } else if level == Level::DEBUG {
            debug!(target: $target, plugin = %$name, "{}", $message);
        } else {
            trace!(target: $target, plugin = %$name, "{}", $message);
        }
    }};
}

/// Forwards each line the plugin writes on `stream` into tracing.
fn relay_lines<R>(name: String, output: Output, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let (level, message) = classify_line(&line);
            match output {
                Output::Stdout => relay_event!("plugin_bridge::stdout", level, name, message),
                Output::Stderr => relay_event!("plugin_bridge::stderr", level, name, message),
            }
        }
    });
}

/// Picks the level and message out of a plugin output line.
///
/// JSON log lines carry their own level (`level` from tracing's JSON
/// format, `@level` from hclog) and message. Anything else is relayed
/// verbatim at info.
fn classify_line(line: &str) -> (Level, Cow<'_, str>) {
    let Ok(Value::Object(record)) = serde_json::from_str::<Value>(line) else {
        return (Level::INFO, Cow::Borrowed(line));
    };
    let level = ["level", "@level"]
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .and_then(|raw| raw.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let message = record
        .get("fields")
        .and_then(|fields| fields.get("message"))
        .or_else(|| record.get("message"))
        .or_else(|| record.get("@message"))
        .and_then(Value::as_str);
    match message {
        Some(message) => (level, Cow::Owned(message.to_owned())),
        None => (level, Cow::Borrowed(line)),
    }
}

impl PluginClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the client stub for capability `name`.
    pub fn dispense<C: Capability>(&self, name: &str) -> Result<C::Client, BridgeError> {
        Ok(self.plugins.dispense::<C>(name, &self.session)?)
    }

    /// Round-trips the built-in ping.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        let reply = self
            .session
            .call_with_timeout(&method_name(CONTROL, PING), Value::Null, PING_TIMEOUT)
            .await?;
        if reply == json!("pong") {
            Ok(())
        } else {
            Err(TransportError::MalformedEnvelope(format!("unexpected ping reply {reply}")).into())
        }
    }

    /// Whether the plugin process is gone.
    pub async fn exited(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Closes the session, asks the plugin to terminate and reaps it.
    ///
    /// The plugin gets `kill_grace` to exit on its own before it is killed.
    /// Only the first call does anything; later calls return `None`.
    pub async fn shutdown(&self) -> Option<ExitStatus> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.session.close();

        let mut child = self.child.lock().await.take()?;
        if let Some(pid) = child.id() {
            if let Err(err) = terminate(pid) {
                debug!(plugin = %self.name, pid, %err, "could not signal plugin");
            }
        }

        let status = match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                warn!(plugin = %self.name, %err, "waiting for plugin failed");
                None
            }
            Err(_) => {
                warn!(plugin = %self.name, grace = ?self.kill_grace, "plugin ignored termination, killing");
                if let Err(err) = child.kill().await {
                    warn!(plugin = %self.name, %err, "failed to kill plugin");
                }
                child.wait().await.ok()
            }
        };
        info!(plugin = %self.name, ?status, "plugin stopped");
        status
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) has no memory-safety requirements. The pid belongs to a
    // child we have not reaped yet, so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> std::io::Result<()> {
    // No polite signal here; the grace period runs out and kill() follows.
    Ok(())
}
