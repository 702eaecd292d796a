use std::process::Command;
use std::time::Duration;

use cdplug::config::{HostConfig, PLUGIN_NAME, handshake_config, plugin_set};
use cdplug::executor::Executor;
use plugin_bridge::{
    BridgeError, CdExecInput, CdExecutor, CdExecutorPlugin, ClientConfig, DispatchError, HandshakeConfig,
    HandshakeError, NetworkType, PluginClient, PluginCommand, launch,
};
use serde_json::{Value, json};

const PLUGIN: &str = env!("CARGO_BIN_EXE_cd_executor");
const HOST: &str = env!("CARGO_BIN_EXE_cdplug");

fn host(network: Option<NetworkType>) -> HostConfig {
    let mut host = HostConfig::new(PLUGIN);
    host.start_timeout = Duration::from_secs(20);
    host.network = network;
    host
}

async fn start(network: Option<NetworkType>) -> PluginClient {
    launch(host(network).client_config()).await.expect("plugin should start")
}

fn object(value: Value) -> CdExecInput {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[tokio::test]
async fn cd_exec_round_trip_over_tcp() {
    let client = start(None).await;
    assert_eq!(client.announcement().network, NetworkType::Tcp);
    client.ping().await.unwrap();

    let executor = client.dispense::<CdExecutorPlugin>(PLUGIN_NAME).unwrap();
    let output = executor.cd_exec(object(json!({"key": "value"}))).await.unwrap();
    assert!(output.is_success());
    assert_eq!(output.data["processed_keys"], json!(["key"]));
    assert_eq!(output.data["input"], json!({"key": "value"}));

    let status = client.shutdown().await.expect("exit status");
    assert!(status.success(), "plugin exited with {status}");
    assert!(client.exited().await);
}

#[tokio::test]
async fn cd_exec_round_trip_over_stdio() {
    let client = start(Some(NetworkType::Stdio)).await;
    assert_eq!(client.announcement().network, NetworkType::Stdio);

    let executor = client.dispense::<CdExecutorPlugin>(PLUGIN_NAME).unwrap();
    let output = executor.cd_exec(object(json!({"b": 2, "a": [1]}))).await.unwrap();
    assert_eq!(output.status, "success");
    assert_eq!(output.data["processed_keys"], json!(["a", "b"]));

    assert!(client.shutdown().await.is_some());
    assert!(client.shutdown().await.is_none());
}

#[tokio::test]
async fn remote_result_equals_the_in_process_result() {
    let client = start(None).await;
    let remote = client.dispense::<CdExecutorPlugin>(PLUGIN_NAME).unwrap();

    for value in [
        json!({"key": "value"}),
        json!({"nested": {"list": [1, 2.5, null, "x"]}, "flag": true}),
        json!({"unicode": "héllo ✓", "empty": {}}),
    ] {
        let direct = Executor.cd_exec(object(value.clone())).await.unwrap();
        let via_plugin = remote.cd_exec(object(value)).await.unwrap();
        assert_eq!(via_plugin, direct);
    }
    client.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_answer() {
    let client = start(None).await;
    let executor = client.dispense::<CdExecutorPlugin>(PLUGIN_NAME).unwrap();

    let mut calls = tokio::task::JoinSet::new();
    for i in 0..16 {
        let executor = executor.clone();
        calls.spawn(async move {
            let output = executor.cd_exec(object(json!({ "n": i }))).await.unwrap();
            (i, output)
        });
    }
    while let Some(joined) = calls.join_next().await {
        let (i, output) = joined.unwrap();
        assert_eq!(output.data["input"]["n"], json!(i));
    }
    assert_eq!(client.session().in_flight(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn empty_input_comes_back_as_an_application_error() {
    let client = start(None).await;
    let executor = client.dispense::<CdExecutorPlugin>(PLUGIN_NAME).unwrap();

    let err = executor.cd_exec(CdExecInput::new()).await.unwrap_err();
    match err.downcast_ref::<BridgeError>() {
        Some(BridgeError::Application(app)) => assert!(app.message.contains("at least one key"), "{app:?}"),
        other => panic!("expected an application error, got {other:?}"),
    }

    // The session survives a failed call.
    client.ping().await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn unknown_plugin_name_is_refused_locally() {
    let client = start(None).await;
    let err = client.dispense::<CdExecutorPlugin>("cd_runner").unwrap_err();
    assert!(
        matches!(err, BridgeError::Dispatch(DispatchError::UnknownCapability { ref name }) if name == "cd_runner"),
        "got {err:?}"
    );
    client.shutdown().await;
}

#[tokio::test]
async fn wrong_cookie_makes_the_plugin_exit() {
    let config = ClientConfig::new(
        HandshakeConfig::new(1, "BASIC_PLUGIN", "goodbye"),
        plugin_set(),
        PluginCommand::new(PLUGIN),
    )
    .start_timeout(Duration::from_secs(20));

    let err = launch(config).await.unwrap_err();
    assert!(
        matches!(err, BridgeError::Handshake(HandshakeError::Exited { status: Some(1) })),
        "got {err:?}"
    );
}

#[tokio::test]
async fn app_version_mismatch_is_rejected() {
    let mut handshake = handshake_config();
    handshake.protocol_version = 2;
    let config = ClientConfig::new(handshake, plugin_set(), PluginCommand::new(PLUGIN))
        .start_timeout(Duration::from_secs(20));

    let err = launch(config).await.unwrap_err();
    assert!(
        matches!(err, BridgeError::Handshake(HandshakeError::AppVersion { expected: 2, got: 1 })),
        "got {err:?}"
    );
}

#[test]
fn running_the_plugin_by_hand_explains_itself() {
    let output = Command::new(PLUGIN).env_remove("BASIC_PLUGIN").output().unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("This binary is a plugin"));
}

#[test]
fn host_binary_prints_the_plugin_result() {
    let output = Command::new(HOST)
        .args(["run", "--plugin", PLUGIN, "--log-level", "warn"])
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let line = stdout
        .lines()
        .find_map(|line| line.strip_prefix("Plugin Result: "))
        .expect("result line");
    let result: Value = serde_json::from_str(line).unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["data"]["input"], json!({"key": "value"}));
}

#[test]
fn host_binary_names_the_failing_phase() {
    let output = Command::new(HOST)
        .args(["run", "--plugin", PLUGIN, "--log-level", "warn", "--input", "{}"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cdplug: [call]"));

    let output = Command::new(HOST)
        .args(["run", "--plugin", "/definitely/not/here", "--log-level", "warn"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cdplug: [launch]"));
}
