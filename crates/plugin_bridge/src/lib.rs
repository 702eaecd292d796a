//! Bridge between a long-lived host process and plugin subprocesses.
//!
//! The host [`launch`]es a plugin executable, reads the one-line handshake
//! the plugin prints on stdout, connects a JSON-RPC [`Session`] to it and
//! dispenses typed client stubs from a [`PluginSet`]. The plugin side calls
//! [`serve`] with a [`PluginMap`] of concrete implementations.
//!
//! ```ignore
//! // host
//! let config = ClientConfig::new(handshake, PluginSet::new().with::<CdExecutorPlugin>("cd_executor"),
//!     PluginCommand::new("./plugin/executor"));
//! let client = launch(config).await?;
//! let executor = client.dispense::<CdExecutorPlugin>("cd_executor")?;
//! let output = executor.cd_exec(input).await?;
//! client.shutdown().await;
//!
//! // plugin
//! let plugins = PluginMap::new().with::<CdExecutorPlugin>("cd_executor", Arc::new(MyExecutor));
//! serve(ServeConfig::new(handshake, plugins)).await?;
//! ```

pub mod capability;
pub mod error;
pub mod handshake;
pub mod jsonrpc;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use capability::cd_exec::{CdExecInput, CdExecOutput, CdExecutor, CdExecutorClient, CdExecutorPlugin};
pub use capability::{Capability, Dispatch};
pub use error::{ApplicationError, BridgeError, DispatchError, HandshakeError, LaunchError, TransportError};
pub use handshake::{Announcement, CORE_PROTOCOL_VERSION, HandshakeConfig, NetworkType};
pub use registry::{CapabilityKind, PluginDescriptor, PluginMap, PluginSet};
pub use server::{ServeConfig, serve};
pub use supervisor::{ClientConfig, PluginClient, PluginCommand, launch};
pub use transport::Session;
