use crate::config::{endpoint_url, COMMAND_PATH};
use async_trait::async_trait;
use opsdeck_core::command::{
    decode_body, server_error_message, AgentCommand, CommandRequest, DispatchError,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Anything that can relay one command to the agent. The gateway sends exactly once;
/// retrying is the caller's decision.
#[async_trait]
pub trait CommandDispatch: Send + Sync + 'static {
    async fn dispatch(
        &self,
        command: &str,
        args: Value,
        token: &str,
        timeout: Duration,
    ) -> Result<Value, DispatchError>;
}

#[derive(Clone, Debug)]
pub struct CommandGateway {
    client: reqwest::Client,
    endpoint: Url,
}

impl CommandGateway {
    pub fn new(base_url: &Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &Url) -> Self {
        Self {
            client,
            endpoint: endpoint_url(base_url, COMMAND_PATH),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn send(&self, command: &AgentCommand, token: &str) -> Result<Value, DispatchError> {
        self.dispatch(command.name(), command.args(), token, command.timeout())
            .await
    }
}

#[async_trait]
impl CommandDispatch for CommandGateway {
    async fn dispatch(
        &self,
        command: &str,
        args: Value,
        token: &str,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let mut url = self.endpoint.clone();
        if !token.is_empty() {
            url.query_pairs_mut().append_pair("token", token);
        }
        let body = CommandRequest::new(command, args);
        debug!(event = "command_dispatch", command, timeout_ms = timeout.as_millis() as u64);
        let result = fetch_json(self.client.post(url).json(&body), timeout).await;
        if let Err(err) = &result {
            warn!(event = "command_failed", command, error = %err);
        }
        result
    }
}

/// Send one request under a client-side deadline that covers the whole exchange,
/// including reading the body, and normalize the response.
pub(crate) async fn fetch_json(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<Value, DispatchError> {
    let exchange = async {
        let response = request
            .send()
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        Ok::<_, DispatchError>((status, text))
    };
    let (status, text) = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| DispatchError::TimedOut(timeout))??;

    // TODO: return `DispatchError::Decode` for unparsed 2xx bodies once every agent
    // command is known to return JSON; callers currently treat null as success.
    let body = match decode_body(&text) {
        Ok(body) => body,
        Err(err) => {
            if status.is_success() {
                warn!(
                    event = "response_body_unparsed",
                    status = status.as_u16(),
                    error = %err
                );
            }
            Value::Null
        }
    };

    if !status.is_success() {
        return Err(DispatchError::Server {
            status: status.as_u16(),
            message: server_error_message(status.as_u16(), &body),
        });
    }
    Ok(body)
}
