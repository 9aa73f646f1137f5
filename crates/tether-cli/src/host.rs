use std::future::Future;

use anyhow::{Context, Result};
use tether_plugin_sdk::{dispatch, Plugin, RpcRequest, RpcResponse};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Serves newline-delimited JSON requests until input closes or `shutdown` fires.
///
/// Every line gets exactly one response line; malformed requests are answered
/// with id 0 and an error rather than ending the session.
pub async fn serve<P, R, W, S>(plugin: &P, input: R, output: &mut W, shutdown: S) -> Result<u64>
where
    P: Plugin + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut served = 0;
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received; closing request stream");
                break;
            }
            line = lines.next_line() => line.context("failed to read request")?,
        };
        let Some(line) = line else {
            tracing::debug!("request stream closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!(id = request.id, method = %request.method, "request");
                dispatch(plugin, request).await
            }
            Err(err) => {
                tracing::warn!(error = %err, "malformed request");
                RpcResponse::failure(0, format!("malformed request: {err}"))
            }
        };
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        output
            .write_all(&encoded)
            .await
            .context("failed to write response")?;
        output.flush().await?;
        served += 1;
    }

    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{config::BackendCommand, ProcessSupervisor, SettingsStore, ShimPlugin};
    use tokio::io::BufReader;

    fn plugin(dir: &std::path::Path) -> ShimPlugin {
        ShimPlugin::from_parts(
            "cli-test",
            SettingsStore::new(dir.join("settings.json")),
            ProcessSupervisor::new(BackendCommand::new(
                dir.join("backend"),
                dir.join("settings.json"),
                dir.join("backend.log"),
            )),
        )
    }

    async fn run(plugin: &ShimPlugin, input: &str) -> Vec<RpcResponse> {
        let mut output = Vec::new();
        serve(
            plugin,
            BufReader::new(input.as_bytes()),
            &mut output,
            std::future::pending(),
        )
        .await
        .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn answers_each_request_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin(dir.path());
        let input = concat!(
            r#"{"id": 1, "method": "settings_setSetting", "args": {"key": "gain", "value": 7}}"#,
            "\n\n",
            r#"{"id": 2, "method": "settings_getSetting", "args": ["gain", 0]}"#,
            "\n",
            r#"{"id": 3, "method": "settings_commit"}"#,
            "\n",
        );

        let responses = run(&plugin, input).await;
        assert_eq!(
            responses,
            vec![
                RpcResponse::success(1, json!(null)),
                RpcResponse::success(2, json!(7)),
                RpcResponse::success(3, json!(null)),
            ]
        );
        assert!(dir.path().join("settings.json").exists());
    }

    #[tokio::test]
    async fn malformed_line_does_not_end_session() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin(dir.path());
        let input = "not json\n{\"id\": 5, \"method\": \"settings_read\"}\n";

        let responses = run(&plugin, input).await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, 0);
        assert!(responses[0].is_error());
        assert_eq!(responses[1], RpcResponse::success(5, json!({})));
    }

    #[tokio::test]
    async fn shutdown_stops_serving() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin(dir.path());
        let mut output = Vec::new();
        let served = serve(
            &plugin,
            BufReader::new(tokio::io::empty()),
            &mut output,
            std::future::ready(()),
        )
        .await
        .unwrap();
        assert_eq!(served, 0);
        assert!(output.is_empty());
    }
}
