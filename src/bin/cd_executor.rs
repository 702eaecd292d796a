use std::process::ExitCode;
use std::sync::Arc;

use cdplug::config::{PLUGIN_NAME, handshake_config};
use cdplug::executor::Executor;
use cdplug::logger::{LogConfig, LogLevel, init_tracing};
use plugin_bridge::{BridgeError, CdExecutorPlugin, HandshakeError, PluginMap, ServeConfig, serve};
use tracing::{debug, error};

#[tokio::main]
async fn main() -> ExitCode {
    // JSON on stderr; stdout carries the handshake.
    let level = std::env::var("CD_EXECUTOR_LOG_LEVEL")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(LogLevel::Debug);
    let _guard = match init_tracing(&LogConfig::new(level, None).json()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("cd_executor: could not initialise logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let plugins = PluginMap::new().with::<CdExecutorPlugin>(PLUGIN_NAME, Arc::new(Executor));
    debug!(plugin = PLUGIN_NAME, "serving");

    match serve(ServeConfig::new(handshake_config(), plugins)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(BridgeError::Handshake(err @ (HandshakeError::CookieMissing { .. } | HandshakeError::CookieMismatch { .. }))) => {
            eprintln!(
                "This binary is a plugin. These are not meant to be executed directly. \
                 Please execute the program that consumes these plugins, which will \
                 load any plugins automatically. ({err})"
            );
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(phase = err.phase(), error = %err, "plugin failed");
            ExitCode::FAILURE
        }
    }
}
