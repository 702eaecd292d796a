//! Capabilities: the typed contracts a plugin exposes.
//!
//! A capability ties three things together: the trait callers program
//! against, a client stub that implements that trait by forwarding over a
//! [`Session`], and a server dispatcher that turns incoming envelopes back
//! into trait calls on a concrete implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{BridgeError, DispatchError, TransportError};
use crate::transport::Session;

pub mod cd_exec;

/// Capability name reserved for bridge housekeeping such as `Ping`.
pub const CONTROL: &str = "_control";

/// Server half of a capability: handles `method` with raw `params`.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, BridgeError>;
}

/// Factory pair for one kind of capability.
///
/// `Client` is what the host gets back from a dispense. `Impl` is the trait
/// object the plugin registers; the stub and the concrete type implement the
/// same trait, which the compiler checks on both sides.
pub trait Capability: Send + Sync + 'static {
    type Client: Send + Sync + 'static;
    type Impl: ?Sized + Send + Sync + 'static;

    fn client(session: Session, name: &str) -> Self::Client;

    fn server(implementation: Arc<Self::Impl>) -> Arc<dyn Dispatch>;
}

/// Wire name of `method` on capability `name`.
pub fn method_name(name: &str, method: &str) -> String {
    format!("{name}.{method}")
}

/// Splits `cap.Method` at the last dot.
pub fn split_method(full: &str) -> Option<(&str, &str)> {
    full.rsplit_once('.')
        .filter(|(cap, method)| !cap.is_empty() && !method.is_empty())
}

pub fn decode_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, BridgeError> {
    serde_json::from_value(params).map_err(|err| {
        DispatchError::InvalidParams {
            method: method.to_owned(),
            message: err.to_string(),
        }
        .into()
    })
}

pub fn encode_result<T: Serialize>(value: &T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|err| TransportError::from(err).into())
}

/// Built-in `_control` capability every plugin answers.
pub struct Control;

pub const PING: &str = "Ping";

#[async_trait]
impl Dispatch for Control {
    async fn dispatch(&self, method: &str, _params: Value) -> Result<Value, BridgeError> {
        match method {
            PING => Ok(json!("pong")),
            other => Err(DispatchError::UnknownMethod {
                method: method_name(CONTROL, other),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_the_last_dot() {
        assert_eq!(split_method("cd_executor.CdExec"), Some(("cd_executor", "CdExec")));
        assert_eq!(split_method("a.b.C"), Some(("a.b", "C")));
        assert_eq!(split_method("nodot"), None);
        assert_eq!(split_method(".CdExec"), None);
        assert_eq!(split_method("cd_executor."), None);
    }

    #[test]
    fn bad_params_are_invalid_params() {
        let err = decode_params::<serde_json::Map<String, Value>>("CdExec", json!([1, 2])).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Dispatch(DispatchError::InvalidParams { ref method, .. }) if method == "CdExec"
        ));
    }

    #[tokio::test]
    async fn control_answers_ping() {
        assert_eq!(Control.dispatch(PING, Value::Null).await.unwrap(), json!("pong"));
        assert!(Control.dispatch("Reboot", Value::Null).await.is_err());
    }
}
