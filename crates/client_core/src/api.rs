use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ThreadId, UserId},
    error::ApiError,
    protocol::{
        CreatePrivateThreadRequest, DirectoryUser, MarkReadRequest, MessagePayload,
        SendMessageRequest, ThreadSummary,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: None,
            bytes,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Request/response side of the chat backend.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_threads(&self, user_id: UserId) -> Result<Vec<ThreadSummary>>;
    /// One page, newest first.
    async fn list_messages(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
        page: u32,
        size: u32,
    ) -> Result<Vec<MessagePayload>>;
    async fn mark_read(
        &self,
        thread_id: ThreadId,
        request: MarkReadRequest,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(
        &self,
        request: SendMessageRequest,
        attachment: Option<AttachmentUpload>,
    ) -> Result<MessagePayload>;
    async fn list_users(&self) -> Result<Vec<DirectoryUser>>;
    async fn create_private_thread(
        &self,
        request: CreatePrivateThreadRequest,
    ) -> Result<ThreadSummary>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesQuery {
    user_id: i64,
    page: u32,
    size: u32,
}

pub struct HttpMessagingApi {
    http: Client,
    server_url: String,
}

impl HttpMessagingApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chat{path}", self.server_url)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::from_status(status.as_u16(), &body).into());
    }
    response
        .json()
        .await
        .with_context(|| format!("unexpected response body (status {status})"))
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn list_threads(&self, user_id: UserId) -> Result<Vec<ThreadSummary>> {
        let response = self
            .http
            .get(self.url("/threads"))
            .query(&[("userId", user_id.0)])
            .send()
            .await
            .context("failed to list threads")?;
        decode(response).await
    }

    async fn list_messages(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
        page: u32,
        size: u32,
    ) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(self.url(&format!("/threads/{}/messages", thread_id.0)))
            .query(&ListMessagesQuery {
                user_id: user_id.0,
                page,
                size: size.clamp(1, 200),
            })
            .send()
            .await
            .with_context(|| format!("failed to list messages for thread {thread_id}"))?;
        decode(response).await
    }

    async fn mark_read(
        &self,
        thread_id: ThreadId,
        request: MarkReadRequest,
    ) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .post(self.url(&format!("/threads/{}/read", thread_id.0)))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to mark thread {thread_id} read"))?;
        decode(response).await
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
        attachment: Option<AttachmentUpload>,
    ) -> Result<MessagePayload> {
        let payload = serde_json::to_string(&request).context("failed to encode message")?;
        let mut form = Form::new().part(
            "payload",
            Part::text(payload)
                .mime_str("application/json")
                .map_err(|e| anyhow!("invalid payload mime type: {e}"))?,
        );
        if let Some(attachment) = attachment {
            let mime = attachment
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let part = Part::bytes(attachment.bytes)
                .file_name(attachment.file_name)
                .mime_str(&mime)
                .with_context(|| format!("invalid attachment mime type: {mime}"))?;
            form = form.part("file", part);
        }

        let response = self
            .http
            .post(self.url("/messages"))
            .multipart(form)
            .send()
            .await
            .context("failed to submit message")?;
        decode(response).await
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>> {
        let response = self
            .http
            .get(self.url("/users"))
            .send()
            .await
            .context("failed to list users")?;
        decode(response).await
    }

    async fn create_private_thread(
        &self,
        request: CreatePrivateThreadRequest,
    ) -> Result<ThreadSummary> {
        let response = self
            .http
            .post(self.url("/threads/private"))
            .json(&request)
            .send()
            .await
            .context("failed to create private thread")?;
        decode(response).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
