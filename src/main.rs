use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use cdplug::config::{self, HostConfig, PLUGIN_NAME};
use cdplug::logger::{LogConfig, LogFormat, LogLevel, init_tracing};
use clap::{Parser, Subcommand};
use plugin_bridge::{BridgeError, CdExecInput, CdExecutor, CdExecutorPlugin, NetworkType, launch};
use serde_json::Value;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cdplug", about = "Starts the cd_executor plugin and calls it once", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the plugin, run CdExec with the given input and print the result
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Plugin executable. Defaults to `cd_executor` next to this binary
    #[arg(long, env = "CDPLUG_PLUGIN")]
    plugin: Option<PathBuf>,

    /// JSON object handed to CdExec
    #[arg(long, env = "CDPLUG_INPUT", default_value = r#"{"key": "value"}"#)]
    input: String,

    /// Log level (trace, debug, info, warn, error, critical)
    #[arg(long, env = "CDPLUG_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log format on stderr (text or json)
    #[arg(long, env = "CDPLUG_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Also write a daily rolling log file into this directory
    #[arg(long, env = "CDPLUG_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// How long to wait for the plugin handshake
    #[arg(long, env = "CDPLUG_START_TIMEOUT_MS", default_value_t = 60_000)]
    start_timeout_ms: u64,

    /// How long the plugin gets to exit after SIGTERM before it is killed
    #[arg(long, env = "CDPLUG_KILL_GRACE_MS", default_value_t = 2_000)]
    kill_grace_ms: u64,

    /// Ask the plugin for a transport (stdio or tcp)
    #[arg(long, env = "CDPLUG_NETWORK")]
    network: Option<NetworkType>,
}

/// A failure tagged with the step it happened in.
struct Failure {
    phase: &'static str,
    error: anyhow::Error,
}

impl Failure {
    fn new(phase: &'static str, error: impl Into<anyhow::Error>) -> Self {
        Self {
            phase,
            error: error.into(),
        }
    }

    /// Bridge errors know their own phase; anything else keeps the fallback.
    fn classify(fallback: &'static str, error: anyhow::Error) -> Self {
        let phase = match error.downcast_ref::<BridgeError>() {
            Some(BridgeError::Launch(_)) => "launch",
            Some(BridgeError::Handshake(_)) => "handshake",
            _ => fallback,
        };
        Self { phase, error }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> ExitCode {
    // Before parsing so `.env` values feed the `env` fallbacks.
    let env_file = match config::load_env(None) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("cdplug: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Run(args)) => args,
        None => RunArgs::parse_from([env!("CARGO_PKG_NAME")]),
    };

    let mut log_config = LogConfig::new(args.log_level, args.log_dir.clone());
    if args.log_format == LogFormat::Json {
        log_config = log_config.json();
    }
    let _guard = match init_tracing(&log_config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("cdplug: could not initialise logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(file) = env_file {
        info!("Loaded .env from {}", file.display());
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure { phase, error }) => {
            error!(phase, error = %format!("{error:#}"), "cdplug failed");
            eprintln!("cdplug: [{phase}] {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<(), Failure> {
    let input = parse_input(&args.input).map_err(|err| Failure::new("input", err))?;

    let plugin = match args.plugin {
        Some(path) => path,
        None => config::default_plugin_path().map_err(|err| Failure::new("launch", err))?,
    };
    let mut host = HostConfig::new(plugin);
    host.start_timeout = Duration::from_millis(args.start_timeout_ms);
    host.kill_grace = Duration::from_millis(args.kill_grace_ms);
    host.network = args.network;

    info!(plugin = %host.plugin.display(), "starting plugin");
    let client = launch(host.client_config())
        .await
        .map_err(|err| Failure::classify("launch", err.into()))?;

    let result = call(&client, input).await;
    client.shutdown().await;
    let output = result?;

    let rendered = serde_json::to_string(&output).map_err(|err| Failure::new("call", err))?;
    println!("Plugin Result: {rendered}");
    Ok(())
}

async fn call(client: &plugin_bridge::PluginClient, input: CdExecInput) -> Result<plugin_bridge::CdExecOutput, Failure> {
    let executor = client
        .dispense::<CdExecutorPlugin>(PLUGIN_NAME)
        .map_err(|err| Failure::new("dispense", err))?;
    executor.cd_exec(input).await.map_err(|err| Failure::classify("call", err))
}

fn parse_input(raw: &str) -> anyhow::Result<CdExecInput> {
    let value: Value = serde_json::from_str(raw).context("--input is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--input must be a JSON object, got {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_input_is_the_sample_mapping() {
        let args = RunArgs::try_parse_from(["cdplug"]).unwrap();
        let input = parse_input(&args.input).unwrap();
        assert_eq!(input.get("key"), Some(&Value::from("value")));
        assert_eq!(args.log_level, LogLevel::Info);
    }

    #[test]
    fn run_flags_are_parsed() {
        let cli = Cli::try_parse_from([
            "cdplug",
            "run",
            "--plugin",
            "/tmp/cd_executor",
            "--log-level",
            "debug",
            "--start-timeout-ms",
            "250",
            "--network",
            "stdio",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.plugin, Some(PathBuf::from("/tmp/cd_executor")));
        assert_eq!(args.log_level, LogLevel::Debug);
        assert_eq!(args.start_timeout_ms, 250);
        assert_eq!(args.network, Some(NetworkType::Stdio));
    }

    #[test]
    fn input_must_be_an_object() {
        assert!(parse_input("[1, 2]").is_err());
        assert!(parse_input("{not json").is_err());
    }
}
