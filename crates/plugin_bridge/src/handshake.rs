//! Handshake between host and plugin.
//!
//! The host passes the magic cookie to the child through the environment.
//! The plugin checks it, then prints one line on stdout before serving:
//!
//! ```text
//! core|app|network|address|protocol[|extra...]
//! 1|1|tcp|127.0.0.1:41234|jsonrpc
//! ```
//!
//! This is a usability check that keeps a user from launching something
//! that is not a plugin. It proves nothing about who built the binary.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use strum_macros::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::HandshakeError;

/// Version of the line format and envelope framing itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Env var the host may set to ask the plugin for a particular network type.
pub const NETWORK_ENV: &str = "PLUGIN_NETWORK";

/// Values both binaries are built with. They must agree exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl HandshakeConfig {
    pub fn new(
        protocol_version: u32,
        magic_cookie_key: impl Into<String>,
        magic_cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version,
            magic_cookie_key: magic_cookie_key.into(),
            magic_cookie_value: magic_cookie_value.into(),
        }
    }

    /// Plugin side: validates the cookie value found in the environment.
    pub fn check_cookie(&self, found: Option<&str>) -> Result<(), HandshakeError> {
        match found {
            None => Err(HandshakeError::CookieMissing {
                key: self.magic_cookie_key.clone(),
            }),
            Some(value) if value != self.magic_cookie_value => Err(HandshakeError::CookieMismatch {
                key: self.magic_cookie_key.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Plugin side: reads the cookie from this process's environment.
    pub fn check_env(&self) -> Result<(), HandshakeError> {
        let found = std::env::var(&self.magic_cookie_key).ok();
        self.check_cookie(found.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum NetworkType {
    /// RPC runs over the child's own stdin/stdout after the handshake line.
    Stdio,
    /// RPC runs over a loopback TCP connection announced in the line.
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
pub enum TransportKind {
    #[strum(serialize = "jsonrpc")]
    JsonRpc,
}

/// Parsed form of the handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub core_version: u32,
    pub app_version: u32,
    pub network: NetworkType,
    pub address: String,
    pub protocol: TransportKind,
    pub extra: Vec<String>,
}

impl Announcement {
    pub fn new(app_version: u32, network: NetworkType, address: impl Into<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            network,
            address: address.into(),
            protocol: TransportKind::JsonRpc,
            extra: Vec::new(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let malformed = |reason: &str| HandshakeError::Malformed {
            line: line.to_owned(),
            reason: reason.to_owned(),
        };

        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 5 {
            return Err(malformed("expected at least 5 '|' separated fields"));
        }

        let core_version = parts[0]
            .parse::<u32>()
            .map_err(|_| malformed("core protocol version is not an integer"))?;
        let app_version = parts[1]
            .parse::<u32>()
            .map_err(|_| malformed("application protocol version is not an integer"))?;
        let network = parts[2]
            .parse::<NetworkType>()
            .map_err(|_| HandshakeError::UnsupportedNetwork(parts[2].to_owned()))?;
        if parts[3].is_empty() {
            return Err(malformed("empty address"));
        }
        let protocol = parts[4]
            .parse::<TransportKind>()
            .map_err(|_| HandshakeError::UnsupportedProtocol(parts[4].to_owned()))?;

        Ok(Self {
            core_version,
            app_version,
            network,
            address: parts[3].to_owned(),
            protocol,
            extra: parts[5..].iter().map(|s| (*s).to_owned()).collect(),
        })
    }

    /// Host side: checks the announced versions against what this host speaks.
    pub fn verify(&self, config: &HandshakeConfig) -> Result<(), HandshakeError> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::CoreVersion {
                expected: CORE_PROTOCOL_VERSION,
                got: self.core_version,
            });
        }
        if self.app_version != config.protocol_version {
            return Err(HandshakeError::AppVersion {
                expected: config.protocol_version,
                got: self.app_version,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.protocol
        )?;
        for extra in &self.extra {
            write!(f, "|{extra}")?;
        }
        Ok(())
    }
}

/// Plugin side: writes the handshake line once and flushes it.
pub async fn announce<W>(writer: &mut W, announcement: &Announcement) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{announcement}\n");
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| HandshakeError::Io(Arc::new(e)))?;
    writer.flush().await.map_err(|e| HandshakeError::Io(Arc::new(e)))?;
    debug!(handshake = %announcement, "announced handshake");
    Ok(())
}

/// Longest handshake line accepted, newline included.
pub const MAX_LINE_LEN: u64 = 4096;

/// Host side: reads the first stdout line within `timeout`.
///
/// Returns `Ok(None)` when the stream ends first, which means the plugin
/// exited without announcing. The line must be ASCII and at most
/// [`MAX_LINE_LEN`] bytes; anything else is reported as malformed.
pub async fn read_line<R>(reader: &mut R, timeout: Duration) -> Result<Option<String>, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LEN);
    let read = match tokio::time::timeout(timeout, limited.read_until(b'\n', &mut raw)).await {
        Err(_) => return Err(HandshakeError::Timeout { timeout }),
        Ok(Err(e)) => return Err(HandshakeError::Io(Arc::new(e))),
        Ok(Ok(read)) => read,
    };
    if read == 0 {
        return Ok(None);
    }

    let malformed = |raw: &[u8], reason: &str| HandshakeError::Malformed {
        line: String::from_utf8_lossy(raw).into_owned(),
        reason: reason.to_owned(),
    };
    if raw.len() as u64 >= MAX_LINE_LEN && raw.last() != Some(&b'\n') {
        return Err(malformed(&raw, "handshake line too long"));
    }
    let line = match String::from_utf8(raw) {
        Ok(line) => line,
        Err(err) => return Err(malformed(err.as_bytes(), "not valid UTF-8")),
    };
    if !line.is_ascii() {
        return Err(malformed(line.as_bytes(), "not ASCII"));
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn config() -> HandshakeConfig {
        HandshakeConfig::new(1, "BASIC_PLUGIN", "hello")
    }

    #[test]
    fn parses_a_tcp_line() {
        let got = Announcement::parse("1|1|tcp|127.0.0.1:4000|jsonrpc\n").unwrap();
        assert_eq!(got.network, NetworkType::Tcp);
        assert_eq!(got.address, "127.0.0.1:4000");
        assert_eq!(got.protocol, TransportKind::JsonRpc);
        assert!(got.extra.is_empty());
        got.verify(&config()).unwrap();
    }

    #[test]
    fn keeps_extra_fields() {
        let got = Announcement::parse("1|1|stdio|stdio|jsonrpc|tls=off|x").unwrap();
        assert_eq!(got.extra, vec!["tls=off".to_owned(), "x".to_owned()]);
        assert_eq!(got.to_string(), "1|1|stdio|stdio|jsonrpc|tls=off|x");
    }

    #[test]
    fn rejects_short_lines() {
        let err = Announcement::parse("1|1|tcp").unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed { .. }));
    }

    #[test]
    fn rejects_non_numeric_versions() {
        let err = Announcement::parse("one|1|tcp|127.0.0.1:1|jsonrpc").unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed { .. }));
    }

    #[test]
    fn rejects_unknown_network_and_protocol() {
        assert!(matches!(
            Announcement::parse("1|1|carrier-pigeon|coop|jsonrpc").unwrap_err(),
            HandshakeError::UnsupportedNetwork(n) if n == "carrier-pigeon"
        ));
        assert!(matches!(
            Announcement::parse("1|1|tcp|127.0.0.1:1|grpc").unwrap_err(),
            HandshakeError::UnsupportedProtocol(p) if p == "grpc"
        ));
    }

    #[test]
    fn version_mismatches_fail_verification() {
        let core = Announcement::parse("2|1|tcp|127.0.0.1:1|jsonrpc").unwrap();
        assert!(matches!(
            core.verify(&config()).unwrap_err(),
            HandshakeError::CoreVersion { expected: 1, got: 2 }
        ));

        let app = Announcement::parse("1|9|tcp|127.0.0.1:1|jsonrpc").unwrap();
        assert!(matches!(
            app.verify(&config()).unwrap_err(),
            HandshakeError::AppVersion { expected: 1, got: 9 }
        ));
    }

    #[test]
    fn cookie_must_be_present_and_equal() {
        let cfg = config();
        assert!(cfg.check_cookie(Some("hello")).is_ok());
        assert!(matches!(
            cfg.check_cookie(None).unwrap_err(),
            HandshakeError::CookieMissing { .. }
        ));
        assert!(matches!(
            cfg.check_cookie(Some("goodbye")).unwrap_err(),
            HandshakeError::CookieMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn announce_then_read_round_trips() {
        let (mut plugin_end, host_end) = tokio::io::duplex(256);
        let sent = Announcement::new(1, NetworkType::Stdio, "stdio");
        announce(&mut plugin_end, &sent).await.unwrap();

        let mut reader = BufReader::new(host_end);
        let line = read_line(&mut reader, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("a line");
        assert_eq!(Announcement::parse(&line).unwrap(), sent);
    }

    #[tokio::test]
    async fn silent_plugin_times_out() {
        let (_plugin_end, host_end) = tokio::io::duplex(64);
        let mut reader = BufReader::new(host_end);
        let err = read_line(&mut reader, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn closed_stream_reports_no_line() {
        let (mut plugin_end, host_end) = tokio::io::duplex(64);
        plugin_end.shutdown().await.unwrap();
        drop(plugin_end);
        let mut reader = BufReader::new(host_end);
        assert!(read_line(&mut reader, Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn binary_junk_is_a_malformed_line() {
        let (mut plugin_end, host_end) = tokio::io::duplex(64);
        plugin_end.write_all(b"\xff\xfe\n").await.unwrap();
        let mut reader = BufReader::new(host_end);
        let err = read_line(&mut reader, Duration::from_secs(1)).await.unwrap_err();
        assert!(
            matches!(err, HandshakeError::Malformed { ref reason, .. } if reason == "not valid UTF-8"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn non_ascii_text_is_a_malformed_line() {
        let (mut plugin_end, host_end) = tokio::io::duplex(64);
        plugin_end.write_all("1|1|stdio|stdiö|jsonrpc\n".as_bytes()).await.unwrap();
        let mut reader = BufReader::new(host_end);
        let err = read_line(&mut reader, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed { ref reason, .. } if reason == "not ASCII"));
    }

    #[tokio::test]
    async fn endless_line_is_cut_off() {
        let (mut plugin_end, host_end) = tokio::io::duplex(64 * 1024);
        let noise = vec![b'a'; MAX_LINE_LEN as usize * 4];
        plugin_end.write_all(&noise).await.unwrap();
        let mut reader = BufReader::new(host_end);
        let err = read_line(&mut reader, Duration::from_secs(1)).await.unwrap_err();
        match err {
            HandshakeError::Malformed { line, reason } => {
                assert_eq!(reason, "handshake line too long");
                assert_eq!(line.len(), MAX_LINE_LEN as usize);
            }
            other => panic!("expected a malformed line, got {other:?}"),
        }
    }
}
