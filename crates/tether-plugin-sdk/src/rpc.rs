use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Plugin;

/// One host → plugin method call, framed as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub args: CallArgs,
}

/// Reply to an [`RpcRequest`]; exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Method arguments, passed either by name (`{"key": ..}`) or by position (`["key", ..]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallArgs(pub Value);

#[derive(Debug, thiserror::Error)]
#[error("missing argument `{name}` (position {index})")]
pub struct MissingArgument {
    pub name: String,
    pub index: usize,
}

impl CallArgs {
    pub fn none() -> Self {
        Self(Value::Null)
    }

    pub fn named(value: Value) -> Self {
        Self(value)
    }

    pub fn positional(values: Vec<Value>) -> Self {
        Self(Value::Array(values))
    }

    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        match &self.0 {
            Value::Object(map) => map.get(name),
            Value::Array(items) => items.get(index),
            _ => None,
        }
    }

    pub fn require(&self, index: usize, name: &str) -> Result<&Value, MissingArgument> {
        self.get(index, name).ok_or_else(|| MissingArgument {
            name: name.to_string(),
            index,
        })
    }

    /// Like [`CallArgs::get`] but substitutes `null` when absent.
    pub fn get_or_null(&self, index: usize, name: &str) -> Value {
        self.get(index, name).cloned().unwrap_or(Value::Null)
    }
}

/// Routes a request to the plugin, converting any failure into an error response.
pub async fn dispatch<P: Plugin + ?Sized>(plugin: &P, request: RpcRequest) -> RpcResponse {
    match plugin.call(&request.method, request.args).await {
        Ok(result) => RpcResponse::success(request.id, result),
        Err(err) => {
            tracing::warn!(
                plugin = plugin.name(),
                method = %request.method,
                error = %err,
                "plugin call failed"
            );
            RpcResponse::failure(request.id, err.to_string())
        }
    }
}
