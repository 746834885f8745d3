mod actor;
mod config;
mod link;

use std::time::Duration;

use console_bridge_core::{ConsoleError, ExpectedKind, SubmitOutcome};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;

use crate::actor::{ConsoleHandle, ProbeSpec, Request};
use crate::config::ServerConfig;

const DEFAULT_PROBE_WAIT: Duration = Duration::from_secs(3);
const MAX_PROBE_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleConnectParams {
    /// `host:port`; defaults to CONSOLE_ENDPOINT.
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleDisconnectParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleSubmitProbeParams {
    expression: String,
    label: String,
    #[serde(default = "default_true")]
    discard: bool,
    /// number, integer, boolean, text or any
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    expensive: bool,
    /// How long to wait for the reply; 0 returns right after queueing.
    #[serde(default)]
    wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleCommandParams {
    text: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleSetPolledParams {
    identifier: String,
    expression: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleRemoveAliasParams {
    identifier: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleForceResumeParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleStatusParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConsoleRecentOutputParams {
    #[serde(default)]
    since_seq: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone)]
struct ConsoleMcpServer {
    tool_router: ToolRouter<Self>,
    console: ConsoleHandle,
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

fn actor_error(err: anyhow::Error) -> McpError {
    to_mcp_error(format!("{err:#}"))
}

fn parse_kind(kind: Option<&str>) -> Result<ExpectedKind, McpError> {
    match kind {
        None => Ok(ExpectedKind::Lenient),
        Some(kind) => kind
            .parse()
            .map_err(|e: ConsoleError| McpError::invalid_params(e.to_string(), None)),
    }
}

/// `None` means the caller does not wait for the reply.
fn probe_wait(wait_ms: Option<u64>) -> Option<Duration> {
    match wait_ms {
        None => Some(DEFAULT_PROBE_WAIT),
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms).min(MAX_PROBE_WAIT)),
    }
}

#[tool_router]
impl ConsoleMcpServer {
    fn new(console: ConsoleHandle) -> Self {
        Self {
            tool_router: Self::tool_router(),
            console,
        }
    }

    #[tool(description = "Open the line channel to the remote console and start a session")]
    async fn console_connect(
        &self,
        params: Parameters<ConsoleConnectParams>,
    ) -> Result<CallToolResult, McpError> {
        let endpoint = params.0.endpoint;
        let peer = self
            .console
            .call(|reply| Request::Connect { endpoint, reply })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "peer": peer,
        })))
    }

    #[tool(description = "Close the console connection")]
    async fn console_disconnect(
        &self,
        _params: Parameters<ConsoleDisconnectParams>,
    ) -> Result<CallToolResult, McpError> {
        let was_connected = self
            .console
            .call(|reply| Request::Disconnect { reply })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "was_connected": was_connected,
        })))
    }

    #[tool(description = "Queue a labeled probe expression and optionally wait for its decoded value")]
    async fn console_submit_probe(
        &self,
        params: Parameters<ConsoleSubmitProbeParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let kind = parse_kind(params.kind.as_deref())?;
        let wait = probe_wait(params.wait_ms);
        let label = params.label.clone();

        let spec = ProbeSpec {
            expression: params.expression,
            label: params.label,
            discard: params.discard,
            kind,
            expensive: params.expensive,
            wait: wait.is_some(),
        };
        let submitted = self
            .console
            .call(|reply| Request::Probe { spec, reply })
            .await
            .map_err(actor_error)?;

        let (value, timed_out) = match (submitted.value, wait) {
            (Some(rx), Some(wait)) => match timeout(wait, rx).await {
                Ok(Ok(value)) => (Some(value), false),
                Ok(Err(_)) => (None, false),
                Err(_) => (None, true),
            },
            _ => (None, false),
        };

        Ok(CallToolResult::structured(json!({
            "ok": submitted.outcome.is_queued(),
            "label": label,
            "outcome": submitted.outcome,
            "value": value,
            "timed_out": timed_out,
        })))
    }

    #[tool(description = "Send operator input; the reply shows up in console_recent_output")]
    async fn console_command(
        &self,
        params: Parameters<ConsoleCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let text = params.0.text;
        let outcome = self
            .console
            .call(|reply| Request::Command { text, reply })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": outcome == SubmitOutcome::Queued,
            "outcome": outcome,
        })))
    }

    #[tool(description = "Register a polled alias or toggle its polling")]
    async fn console_set_polled(
        &self,
        params: Parameters<ConsoleSetPolledParams>,
    ) -> Result<CallToolResult, McpError> {
        let ConsoleSetPolledParams {
            identifier,
            expression,
            enabled,
        } = params.0;
        let alias = identifier.clone();
        self.console
            .call(|reply| Request::SetPolled {
                identifier,
                expression,
                enabled,
                reply,
            })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "identifier": alias,
            "polled": enabled,
        })))
    }

    #[tool(description = "Forget a polled alias")]
    async fn console_remove_alias(
        &self,
        params: Parameters<ConsoleRemoveAliasParams>,
    ) -> Result<CallToolResult, McpError> {
        let identifier = params.0.identifier;
        let removed = self
            .console
            .call(|reply| Request::RemoveAlias { identifier, reply })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "removed": removed,
        })))
    }

    #[tool(description = "Clear a traffic suspension left by an unfinished multi-line command")]
    async fn console_force_resume(
        &self,
        _params: Parameters<ConsoleForceResumeParams>,
    ) -> Result<CallToolResult, McpError> {
        let resumed = self
            .console
            .call(|reply| Request::ForceResume { reply })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "resumed": resumed,
        })))
    }

    #[tool(description = "Session state, queue contents and polled alias values")]
    async fn console_status(
        &self,
        _params: Parameters<ConsoleStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        let status = self
            .console
            .call(|reply| Request::Status { reply })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "status": status,
        })))
    }

    #[tool(description = "Read displayed console lines with sequence number at or after since_seq")]
    async fn console_recent_output(
        &self,
        params: Parameters<ConsoleRecentOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        let since_seq = params.0.since_seq.unwrap_or(0);
        let page = self
            .console
            .call(|reply| Request::RecentOutput { since_seq, reply })
            .await
            .map_err(actor_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "lines": page.lines,
            "next_seq": page.next_seq,
        })))
    }
}

#[tool_handler]
impl ServerHandler for ConsoleMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Console MCP Server multiplexing labeled probes and operator commands over one remote console line channel"
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the MCP protocol
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = ServerConfig::from_env()?;
    tracing::info!(endpoint = %config.endpoint, "Starting Console MCP Server on stdio...");

    let server = ConsoleMcpServer::new(ConsoleHandle::spawn(config)?);
    server.serve(transport::stdio()).await?.waiting().await?;

    Ok(())
}
