//! Plugin side: announce the handshake and serve until the host goes away.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::Dispatch;
use crate::error::{BridgeError, TransportError};
use crate::handshake::{Announcement, HandshakeConfig, NETWORK_ENV, NetworkType, announce};
use crate::registry::PluginMap;
use crate::transport;

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub handshake: HandshakeConfig,
    pub plugins: PluginMap,
    /// Used unless the host asks for another supported type.
    pub network: NetworkType,
}

impl ServeConfig {
    pub fn new(handshake: HandshakeConfig, plugins: PluginMap) -> Self {
        Self {
            handshake,
            plugins,
            network: NetworkType::Tcp,
        }
    }

    pub fn network(mut self, network: NetworkType) -> Self {
        self.network = network;
        self
    }
}

/// Runs the plugin: cookie check, handshake, serve loop.
///
/// Returns `Ok(())` when the host disconnects or the process is asked to
/// terminate; the binary should then exit 0. Any `Err` is fatal and means a
/// non-zero exit. A missing or wrong cookie fails before anything is written
/// to stdout, so the host sees the process exit without a handshake.
pub async fn serve(config: ServeConfig) -> Result<(), BridgeError> {
    config.handshake.check_env()?;

    let network = requested_network(std::env::var(NETWORK_ENV).ok().as_deref(), config.network);
    let version = config.handshake.protocol_version;
    let dispatcher: Arc<dyn Dispatch> = Arc::new(config.plugins);
    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone());

    let mut stdout = tokio::io::stdout();
    match network {
        NetworkType::Stdio => {
            announce(&mut stdout, &Announcement::new(version, NetworkType::Stdio, "stdio")).await?;
            transport::serve(tokio::io::stdin(), stdout, dispatcher, shutdown).await?;
        }
        NetworkType::Tcp => {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(TransportError::from)?;
            let address = listener.local_addr().map_err(TransportError::from)?;
            announce(&mut stdout, &Announcement::new(version, NetworkType::Tcp, address.to_string())).await?;

            let stream = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted.map_err(TransportError::from)?.0,
            };
            drop(listener);
            debug!(%address, "host connected");
            let (reader, writer) = stream.into_split();
            transport::serve(reader, writer, dispatcher, shutdown).await?;
        }
    }

    info!("host disconnected, plugin exiting");
    Ok(())
}

fn requested_network(requested: Option<&str>, fallback: NetworkType) -> NetworkType {
    match requested.map(str::parse::<NetworkType>) {
        Some(Ok(network)) => network,
        Some(Err(_)) => {
            warn!(requested = ?requested, %fallback, "host asked for an unsupported network type");
            fallback
        }
        None => fallback,
    }
}

/// Cancels `token` on SIGTERM or Ctrl-C.
fn watch_signals(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = term.recv() => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                Err(err) => {
                    warn!(%err, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination requested");
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_preference_wins_when_supported() {
        assert_eq!(requested_network(Some("stdio"), NetworkType::Tcp), NetworkType::Stdio);
        assert_eq!(requested_network(Some("tcp"), NetworkType::Stdio), NetworkType::Tcp);
    }

    #[test]
    fn unsupported_or_absent_preference_falls_back() {
        assert_eq!(requested_network(Some("unix"), NetworkType::Tcp), NetworkType::Tcp);
        assert_eq!(requested_network(None, NetworkType::Stdio), NetworkType::Stdio);
    }

    #[tokio::test]
    async fn refuses_to_serve_without_the_cookie() {
        let config = ServeConfig::new(
            HandshakeConfig::new(1, "PLUGIN_BRIDGE_TEST_COOKIE_NEVER_SET", "hello"),
            PluginMap::new(),
        );
        let err = serve(config).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Handshake(crate::error::HandshakeError::CookieMissing { .. })
        ));
    }
}
