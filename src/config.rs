use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use plugin_bridge::{CdExecutorPlugin, ClientConfig, HandshakeConfig, NetworkType, PluginCommand, PluginSet};

/// Application protocol version shared by host and plugin.
pub const APP_PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_COOKIE_KEY: &str = "BASIC_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "hello";

/// Name the `CdExecutor` capability is registered under on both sides.
pub const PLUGIN_NAME: &str = "cd_executor";
pub const PLUGIN_BINARY: &str = "cd_executor";

/// Handshake both binaries agree on. Not a security boundary: it only stops
/// the plugin binary from being run by hand.
pub fn handshake_config() -> HandshakeConfig {
    HandshakeConfig::new(APP_PROTOCOL_VERSION, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
}

/// What the host may dispense.
pub fn plugin_set() -> PluginSet {
    PluginSet::new().with::<CdExecutorPlugin>(PLUGIN_NAME)
}

/// Loads `.env` from `path`, or from the working directory upwards.
///
/// Returns the file that was loaded. A missing file is not an error; a file
/// that exists but does not parse is.
pub fn load_env(path: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    match path {
        Some(path) if path.exists() => {
            dotenvy::from_path(path).with_context(|| format!("could not load {}", path.display()))?;
            Ok(Some(path.to_path_buf()))
        }
        Some(_) => Ok(None),
        None => match dotenvy::dotenv() {
            Ok(path) => Ok(Some(path)),
            Err(err) if err.not_found() => Ok(None),
            Err(err) => Err(err).context("could not load .env"),
        },
    }
}

/// The plugin binary installed next to the running executable.
pub fn default_plugin_path() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    let dir = exe
        .parent()
        .with_context(|| format!("{} has no parent directory", exe.display()))?;
    Ok(dir.join(format!("{PLUGIN_BINARY}{}", std::env::consts::EXE_SUFFIX)))
}

/// Everything the host needs to start the plugin.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub plugin: PathBuf,
    pub start_timeout: Duration,
    pub kill_grace: Duration,
    pub network: Option<NetworkType>,
}

impl HostConfig {
    pub fn new(plugin: impl Into<PathBuf>) -> Self {
        Self {
            plugin: plugin.into(),
            start_timeout: plugin_bridge::supervisor::DEFAULT_START_TIMEOUT,
            kill_grace: plugin_bridge::supervisor::DEFAULT_KILL_GRACE,
            network: None,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::new(handshake_config(), plugin_set(), PluginCommand::new(&self.plugin))
            .start_timeout(self.start_timeout)
            .kill_grace(self.kill_grace);
        match self.network {
            Some(network) => config.network(network),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn handshake_matches_the_plugin_contract() {
        let config = handshake_config();
        assert_eq!(config.protocol_version, 1);
        assert_eq!(config.magic_cookie_key, "BASIC_PLUGIN");
        assert_eq!(config.magic_cookie_value, "hello");
    }

    #[test]
    fn client_config_carries_host_settings() {
        let mut host = HostConfig::new("/opt/cd_executor");
        host.start_timeout = Duration::from_secs(3);
        host.network = Some(NetworkType::Stdio);

        let client = host.client_config();
        assert_eq!(client.start_timeout, Duration::from_secs(3));
        assert_eq!(client.network, Some(NetworkType::Stdio));
        assert_eq!(client.command.program(), Path::new("/opt/cd_executor"));
        assert!(client.plugins.get(PLUGIN_NAME).is_some());
    }

    #[test]
    fn default_plugin_sits_next_to_the_executable() {
        let path = default_plugin_path().unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(path.parent(), exe.parent());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with(PLUGIN_BINARY));
    }

    #[test]
    fn env_file_is_loaded_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".env");
        let mut f = std::fs::File::create(&file).unwrap();
        writeln!(f, "CDPLUG_CONFIG_TEST_VALUE=loaded").unwrap();

        assert_eq!(load_env(Some(&file)).unwrap(), Some(file.clone()));
        assert_eq!(std::env::var("CDPLUG_CONFIG_TEST_VALUE").unwrap(), "loaded");
        assert_eq!(load_env(Some(&dir.path().join("missing.env"))).unwrap(), None);
    }
}
