//! Name → capability lookup on both sides of the bridge.
//!
//! The host keeps a [`PluginSet`] describing what it may dispense; the
//! plugin keeps a [`PluginMap`] holding the dispatchers it serves. Both are
//! plain values handed to constructors.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::capability::{CONTROL, Capability, Control, Dispatch, split_method};
use crate::error::{BridgeError, DispatchError};
use crate::transport::Session;

/// Which [`Capability`] type a name was registered with.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CapabilityKind {
    type_id: TypeId,
    type_name: &'static str,
}

impl CapabilityKind {
    pub fn of<C: Capability>() -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            type_name: type_name::<C>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub kind: CapabilityKind,
}

/// Host-side table of dispensable capabilities.
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
    plugins: HashMap<String, PluginDescriptor>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<C: Capability>(mut self, name: impl Into<String>) -> Self {
        self.insert::<C>(name);
        self
    }

    /// Registers `name` as capability `C`, returning any previous entry.
    pub fn insert<C: Capability>(&mut self, name: impl Into<String>) -> Option<PluginDescriptor> {
        let name = name.into();
        let descriptor = PluginDescriptor {
            name: name.clone(),
            kind: CapabilityKind::of::<C>(),
        };
        self.plugins.insert(name, descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Builds the client stub for `name`. Purely local: nothing is sent.
    pub fn dispense<C: Capability>(&self, name: &str, session: &Session) -> Result<C::Client, DispatchError> {
        let descriptor = self.plugins.get(name).ok_or_else(|| DispatchError::UnknownCapability {
            name: name.to_owned(),
        })?;

        let requested = CapabilityKind::of::<C>();
        if descriptor.kind != requested {
            return Err(DispatchError::KindMismatch {
                name: name.to_owned(),
                registered: descriptor.kind.name(),
                requested: requested.name(),
            });
        }

        debug!(plugin = name, kind = requested.name(), session = %session.id(), "dispensing capability");
        Ok(C::client(session.clone(), name))
    }
}

/// Plugin-side table of served capabilities.
///
/// Itself a [`Dispatch`]: it splits `cap.Method`, routes to the registered
/// dispatcher and answers the built-in `_control` capability.
#[derive(Clone, Default)]
pub struct PluginMap {
    dispatchers: HashMap<String, Arc<dyn Dispatch>>,
}

impl fmt::Debug for PluginMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.dispatchers.keys()).finish()
    }
}

impl PluginMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<C: Capability>(mut self, name: impl Into<String>, implementation: Arc<C::Impl>) -> Self {
        self.register::<C>(name, implementation);
        self
    }

    pub fn register<C: Capability>(&mut self, name: impl Into<String>, implementation: Arc<C::Impl>) -> &mut Self {
        self.register_dispatcher(name, C::server(implementation))
    }

    pub fn register_dispatcher(&mut self, name: impl Into<String>, dispatcher: Arc<dyn Dispatch>) -> &mut Self {
        self.dispatchers.insert(name.into(), dispatcher);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dispatchers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dispatchers.keys().map(String::as_str)
    }
}

#[async_trait]
impl Dispatch for PluginMap {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let Some((capability, local)) = split_method(method) else {
            return Err(DispatchError::UnknownMethod {
                method: method.to_owned(),
            }
            .into());
        };

        if capability == CONTROL {
            return Control.dispatch(local, params).await;
        }

        let dispatcher = self
            .dispatchers
            .get(capability)
            .ok_or_else(|| DispatchError::UnknownCapability {
                name: capability.to_owned(),
            })?;
        dispatcher.dispatch(local, params).await
    }
}
