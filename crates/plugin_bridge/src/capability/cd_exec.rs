//! The `CdExec` capability contract shared by host and plugin.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Capability, Dispatch, decode_params, encode_result, method_name};
use crate::error::{ApplicationError, BridgeError, DispatchError, TransportError};
use crate::transport::Session;

pub const CD_EXEC: &str = "CdExec";

/// Open-ended configuration payload: arbitrary string keys to JSON values.
pub type CdExecInput = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdExecOutput {
    pub status: String,
    pub data: Value,
    /// Anything else the implementation chose to report.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CdExecOutput {
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            status: "success".to_owned(),
            data: data.into(),
            extra: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[async_trait]
pub trait CdExecutor: Send + Sync {
    /// Executes with `input`, returning a status/data mapping.
    async fn cd_exec(&self, input: CdExecInput) -> anyhow::Result<CdExecOutput>;
}

/// Registry marker for the `CdExecutor` capability.
pub struct CdExecutorPlugin;

impl Capability for CdExecutorPlugin {
    type Client = CdExecutorClient;
    type Impl = dyn CdExecutor;

    fn client(session: Session, name: &str) -> Self::Client {
        CdExecutorClient {
            session,
            method: method_name(name, CD_EXEC),
        }
    }

    fn server(implementation: Arc<Self::Impl>) -> Arc<dyn Dispatch> {
        Arc::new(CdExecutorServer { implementation })
    }
}

/// Host-side stub. Errors come back as [`BridgeError`] inside the `anyhow`
/// error, so callers can downcast to tell transport from application failures.
#[derive(Debug, Clone)]
pub struct CdExecutorClient {
    session: Session,
    method: String,
}

#[async_trait]
impl CdExecutor for CdExecutorClient {
    async fn cd_exec(&self, input: CdExecInput) -> anyhow::Result<CdExecOutput> {
        let result = self.session.call(&self.method, Value::Object(input)).await?;
        let output = serde_json::from_value(result).map_err(TransportError::from).map_err(BridgeError::from)?;
        Ok(output)
    }
}

pub struct CdExecutorServer {
    implementation: Arc<dyn CdExecutor>,
}

#[async_trait]
impl Dispatch for CdExecutorServer {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        match method {
            CD_EXEC => {
                let input: CdExecInput = decode_params(method, params)?;
                let output = self
                    .implementation
                    .cd_exec(input)
                    .await
                    .map_err(|err| ApplicationError::new(format!("{err:#}")))?;
                encode_result(&output)
            }
            other => Err(DispatchError::UnknownMethod {
                method: other.to_owned(),
            }
            .into()),
        }
    }
}
