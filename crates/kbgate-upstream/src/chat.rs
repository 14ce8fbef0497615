use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kbgate_contracts::{UpstreamHistoryEnvelope, UpstreamHistoryItem};
use kbgate_core::{ByteStream, CoreError, UpstreamChat, UpstreamChatRequest, unix_seconds};
use reqwest::{Client, StatusCode, header};
use serde_json::json;
use tracing::{debug, error, instrument};

const JSON_UTF8: &str = "application/json;charset=UTF-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEndpoints {
    pub chat_url: String,
    pub history_url: String,
    pub assistant_id: String,
    pub session_sign: String,
    pub ask_type: String,
    pub timeout_seconds: u64,
}

/// Client for the knowledge-base chat and history endpoints.
pub struct KbChatClient {
    endpoints: ChatEndpoints,
    http: Client,
}

impl KbChatClient {
    pub fn new(endpoints: ChatEndpoints) -> Result<Self, CoreError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(endpoints.timeout_seconds))
            .build()
            .map_err(|err| CoreError::Upstream(format!("upstream client init failed: {err}")))?;
        Ok(Self { endpoints, http })
    }
}

#[async_trait]
impl UpstreamChat for KbChatClient {
    #[instrument(skip_all, fields(model_id = request.upstream_model_id))]
    async fn send(
        &self,
        request: UpstreamChatRequest<'_>,
        token: &str,
    ) -> Result<ByteStream, CoreError> {
        let request_id = unix_seconds().to_string();
        let response = self
            .http
            .post(&self.endpoints.chat_url)
            .header(header::AUTHORIZATION, token)
            .header(header::CONTENT_TYPE, JSON_UTF8)
            .query(&[
                ("sessionId", request.session_key),
                ("assistantId", self.endpoints.assistant_id.as_str()),
                ("modelId", request.upstream_model_id),
                ("sessionSign", self.endpoints.session_sign.as_str()),
                ("askType", self.endpoints.ask_type.as_str()),
                ("requestId", request_id.as_str()),
            ])
            .body(json!({ "query": request.prompt, "images": [] }).to_string())
            .send()
            .await
            .map_err(|err| CoreError::Upstream(format!("upstream request failed: {err}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            error!(event = "upstream.chat.status", status = status.as_u16());
            return Err(CoreError::UpstreamStatus { status: status.as_u16() });
        }
        debug!(event = "upstream.chat.opened", request_id = %request_id);

        Ok(response
            .bytes_stream()
            .map_err(|err| CoreError::Upstream(format!("upstream stream read failed: {err}")))
            .boxed())
    }

    #[instrument(skip_all)]
    async fn history(&self, token: &str) -> Result<Vec<Vec<UpstreamHistoryItem>>, CoreError> {
        let response = self
            .http
            .get(&self.endpoints.history_url)
            .header(header::AUTHORIZATION, token)
            .header(header::CONTENT_TYPE, "application/json")
            .query(&[("assistantId", self.endpoints.assistant_id.as_str())])
            .send()
            .await
            .map_err(|err| CoreError::Upstream(format!("history request failed: {err}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(CoreError::UpstreamStatus { status: status.as_u16() });
        }

        let envelope = response
            .json::<UpstreamHistoryEnvelope>()
            .await
            .map_err(|err| CoreError::Upstream(format!("history response parse failed: {err}")))?;
        debug!(event = "upstream.history.loaded", code = envelope.code, sessions = envelope.result.len());
        Ok(envelope.result)
    }
}
