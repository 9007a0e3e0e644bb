//! REST adapters for the remote store and media upload collaborators.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{ConversationRow, MessageRow, NewMessage, ParticipantRow},
};

use crate::{MediaUploader, ProgressFn, RemoteStore};

pub struct RestRemoteStore {
    http: Client,
    server_url: String,
}

impl RestRemoteStore {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }
}

/// Normalizes transport-level failures into messages the connectivity
/// classifier recognizes; everything else keeps its HTTP context.
fn transport_error(context: &str, err: reqwest::Error) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow!("backend unreachable during {context}: {err}")
    } else {
        anyhow::Error::new(err).context(format!("{context} failed"))
    }
}

/// Prefers the backend's structured error body over a bare status code.
async fn error_from_response(context: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(body) => ApiException::new(body.code, body.message).into(),
        Err(_) => anyhow!("{context} failed with status {status}"),
    }
}

fn joined_ids(conversation_ids: &[ConversationId]) -> String {
    conversation_ids
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn conversations_for_user(&self, user_id: &UserId) -> Result<Vec<ConversationRow>> {
        let rows = self
            .http
            .get(format!("{}/conversations", self.server_url))
            .query(&[("user_id", user_id.as_str())])
            .send()
            .await
            .map_err(|err| transport_error("conversation list", err))?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }

    async fn last_messages(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<Vec<MessageRow>> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .http
            .get(format!("{}/conversations/last_messages", self.server_url))
            .query(&[("ids", joined_ids(conversation_ids))])
            .send()
            .await
            .map_err(|err| transport_error("last message fetch", err))?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }

    async fn participants(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<Vec<ParticipantRow>> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .http
            .get(format!("{}/conversations/participants", self.server_url))
            .query(&[("ids", joined_ids(conversation_ids))])
            .send()
            .await
            .map_err(|err| transport_error("participant fetch", err))?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }

    async fn messages_before(
        &self,
        conversation_id: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339_opts(SecondsFormat::Micros, true)));
        }
        let rows = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id
            ))
            .query(&query)
            .send()
            .await
            .map_err(|err| transport_error("message fetch", err))?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        let response = self
            .http
            .post(format!("{}/messages", self.server_url))
            .json(&message)
            .send()
            .await
            .map_err(|err| transport_error("message write", err))?;
        if !response.status().is_success() {
            return Err(error_from_response("message write", response).await);
        }
        Ok(response.json().await?)
    }

    async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/message_reads", self.server_url))
            .json(&serde_json::json!({
                "message_id": message_id,
                "user_id": user_id,
                "read_at": read_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            }))
            .send()
            .await
            .map_err(|err| transport_error("read receipt upsert", err))?;
        if response.status() == StatusCode::CONFLICT {
            return Err(
                ApiException::new(ErrorCode::Conflict, "read receipt already recorded").into(),
            );
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn leave_conversation(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        self.http
            .delete(format!(
                "{}/conversations/{}/members/{}",
                self.server_url, conversation_id, user_id
            ))
            .send()
            .await
            .map_err(|err| transport_error("membership removal", err))?
            .error_for_status()?;
        Ok(())
    }
}

pub struct RestMediaUploader {
    http: Client,
    server_url: String,
}

impl RestMediaUploader {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    url: String,
}

#[async_trait]
impl MediaUploader for RestMediaUploader {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        progress: Option<ProgressFn>,
    ) -> Result<String> {
        if let Some(progress) = &progress {
            progress(0);
        }
        let response: FileUploadResponse = self
            .http
            .post(format!("{}/files/upload", self.server_url))
            .query(&[("filename", filename)])
            .body(bytes)
            .send()
            .await
            .map_err(|err| transport_error("file upload", err))?
            .error_for_status()?
            .json()
            .await?;
        if let Some(progress) = &progress {
            progress(100);
        }
        Ok(response.url)
    }
}
