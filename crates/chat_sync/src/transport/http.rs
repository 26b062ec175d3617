use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};
use shared::{
    domain::{ConversationId, MessageId},
    error::ApiError,
    protocol::{
        ConversationSummary, MarkReadHttpRequest, MessagePage, MessagePayload, OutboundMessage,
        PageQuery,
    },
};
use tracing::debug;

use super::RestClient;
use crate::error::SyncError;

/// REST adapter over the conversation API.
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    http: Client,
    server_url: String,
}

impl HttpRestClient {
    pub fn new(server_url: &str, request_timeout: Duration) -> Result<Self, SyncError> {
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(SyncError::Validation(format!(
                "server_url must start with http:// or https://: {server_url}"
            )));
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| SyncError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(http, server_url))
    }

    pub fn with_client(http: Client, server_url: &str) -> Self {
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn conversation_url(&self, conversation_id: &ConversationId, tail: &str) -> String {
        let id = url::form_urlencoded::byte_serialize(conversation_id.as_str().as_bytes())
            .collect::<String>();
        format!("{}/conversations/{id}{tail}", self.server_url)
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        query: &PageQuery,
    ) -> Result<MessagePage, SyncError> {
        let response = self
            .http
            .get(self.conversation_url(conversation_id, "/messages"))
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;
        classify_status(response)
            .await?
            .json()
            .await
            .map_err(classify_transport)
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary, SyncError> {
        let response = self
            .http
            .get(self.conversation_url(conversation_id, ""))
            .send()
            .await
            .map_err(classify_transport)?;
        classify_status(response)
            .await?
            .json()
            .await
            .map_err(classify_transport)
    }

    async fn post_message(&self, message: &OutboundMessage) -> Result<MessagePayload, SyncError> {
        let response = self
            .http
            .post(self.conversation_url(&message.conversation_id, "/messages"))
            .json(message)
            .send()
            .await
            .map_err(classify_transport)?;
        classify_status(response)
            .await?
            .json()
            .await
            .map_err(classify_transport)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), SyncError> {
        let response = self
            .http
            .post(self.conversation_url(conversation_id, "/read"))
            .json(&MarkReadHttpRequest {
                message_ids: message_ids.to_vec(),
            })
            .send()
            .await
            .map_err(classify_transport)?;
        classify_status(response).await?;
        Ok(())
    }
}

fn classify_transport(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else if err.is_decode() {
        SyncError::Validation(format!("malformed response body: {err}"))
    } else {
        SyncError::Network(err.to_string())
    }
}

/// Passes successful responses through; maps everything else onto the
/// error taxonomy. A `Retry-After` header in seconds is carried on 429s.
pub async fn classify_status(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|error| error.message)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                status.to_string()
            } else {
                body
            }
        });
    debug!(status = status.as_u16(), path = %url, "http: request failed: {message}");
    Err(error_for_status(status, retry_after, message))
}

pub(crate) fn error_for_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED => SyncError::Unauthorized(message),
        StatusCode::FORBIDDEN => SyncError::Forbidden(message),
        StatusCode::NOT_FOUND => SyncError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SyncError::Timeout,
        status if status.is_server_error() => SyncError::Network(message),
        _ => SyncError::Validation(message),
    }
}

#[cfg(test)]
#[path = "../tests/http_tests.rs"]
mod tests;
