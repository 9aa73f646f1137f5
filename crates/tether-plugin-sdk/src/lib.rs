pub mod manifest;
pub mod rpc;

pub use manifest::PluginManifest;
pub use rpc::{dispatch, CallArgs, MissingArgument, RpcRequest, RpcResponse};

use async_trait::async_trait;
use serde_json::Value;

/// Lifecycle and method surface a host runtime drives.
///
/// The host calls [`Plugin::on_load`] once on activation, routes UI calls
/// through [`Plugin::call`], and calls [`Plugin::on_unload`] once on
/// deactivation.
#[async_trait]
pub trait Plugin: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> &str;
    async fn on_load(&self) -> Result<(), Self::Error>;
    async fn on_unload(&self) -> Result<(), Self::Error>;
    async fn call(&self, method: &str, args: CallArgs) -> Result<Value, Self::Error>;
}
