use async_trait::async_trait;
use plugin_bridge::{CdExecInput, CdExecOutput, CdExecutor};
use serde_json::json;
use tracing::{debug, info};

/// The `CdExecutor` the plugin binary serves.
///
/// It runs nothing yet: it reports which keys it received and echoes the
/// input back under `data`.
#[derive(Debug, Default, Clone)]
pub struct Executor;

#[async_trait]
impl CdExecutor for Executor {
    async fn cd_exec(&self, input: CdExecInput) -> anyhow::Result<CdExecOutput> {
        debug!(input = %serde_json::Value::Object(input.clone()), "cd_exec called");
        if input.is_empty() {
            anyhow::bail!("cd_exec needs at least one key in its input");
        }

        let mut keys: Vec<String> = input.keys().cloned().collect();
        keys.sort_unstable();
        let data = json!({
            "processed_keys": keys,
            "input": input,
        });
        info!(keys = keys.len(), "cd_exec finished");
        Ok(CdExecOutput::success(data))
    }
}
