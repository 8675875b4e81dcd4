//! HTTP client for the support API.
//!
//! Wraps reqwest::Client with bearer-token injection and decodes the server's
//! failure envelope back into a typed error.

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::attachment::Upload;
use crate::chat::{ChatDetail, ChatMessage, ChatSession};
use crate::error::{ErrorEnvelope, ErrorKind};
use crate::http::server::{
    AssignRequest, CreateChatRequest, DeleteResponse, MarkReadResponse, SendMessageRequest,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{message}")]
    Api {
        status: u16,
        kind: ErrorKind,
        message: String,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("no chat is open")]
    NoActiveChat,
}

impl ClientError {
    /// `None` for failures that never reached the server.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Api { kind, .. } => Some(*kind),
            ClientError::Transport(_) | ClientError::NoActiveChat => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind() == Some(ErrorKind::Unauthorized)
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Clone, Debug)]
pub struct SupportClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl SupportClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Same server, different credential.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.into(),
        }
    }

    pub async fn list_sessions(&self, assigned_only: bool) -> ClientResult<Vec<ChatSession>> {
        let resp = self
            .http
            .get(self.url("/api/chats"))
            .bearer_auth(&self.token)
            .query(&[("assigned_only", assigned_only)])
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn get_session(&self, chat_id: &str) -> ClientResult<ChatDetail> {
        let resp = self
            .http
            .get(self.url(&format!("/api/chats/{}", chat_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn create_session(&self, title: &str, message: &str) -> ClientResult<ChatDetail> {
        let body = CreateChatRequest {
            title: title.to_string(),
            message: message.to_string(),
        };
        let resp = self
            .http
            .post(self.url("/api/chats"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn send_message(&self, chat_id: &str, message: &str) -> ClientResult<ChatMessage> {
        let body = SendMessageRequest {
            message: message.to_string(),
        };
        let resp = self
            .http
            .post(self.url(&format!("/api/chats/{}/messages", chat_id)))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        decode(resp).await
    }

    /// Multipart path: the payload goes in `file`, the role hint in `kind`.
    pub async fn send_attachment(
        &self,
        chat_id: &str,
        caption: Option<&str>,
        upload: Upload,
    ) -> ClientResult<ChatMessage> {
        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.mime)?;

        let mut form = reqwest::multipart::Form::new()
            .text("kind", upload.role.as_str())
            .part("file", part);
        if let Some(caption) = caption {
            form = form.text("message", caption.to_string());
        }

        let resp = self
            .http
            .post(self.url(&format!("/api/chats/{}/attachments", chat_id)))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        decode(resp).await
    }

    /// Claim a chat for the token's owner.
    pub async fn assign(&self, chat_id: &str) -> ClientResult<ChatSession> {
        let resp = self
            .http
            .post(self.url(&format!("/api/chats/{}/assign", chat_id)))
            .bearer_auth(&self.token)
            .json(&AssignRequest::default())
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn close(&self, chat_id: &str) -> ClientResult<ChatSession> {
        let resp = self
            .http
            .post(self.url(&format!("/api/chats/{}/close", chat_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn delete(&self, chat_id: &str) -> ClientResult<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/chats/{}", chat_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let _: DeleteResponse = decode(resp).await?;
        Ok(())
    }

    pub async fn mark_read(&self, chat_id: &str) -> ClientResult<u64> {
        let resp = self
            .http
            .post(self.url(&format!("/api/chats/{}/read", chat_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body: MarkReadResponse = decode(resp).await?;
        Ok(body.updated)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> ClientResult<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    let text = resp.text().await?;
    tracing::debug!("API error {}: {}", status, text);

    Err(match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(envelope) => ClientError::Api {
            status: status.as_u16(),
            kind: envelope.error.kind,
            message: envelope.error.message,
        },
        // Something in front of the server answered (proxy, wrong port).
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            kind: if status == reqwest::StatusCode::UNAUTHORIZED {
                ErrorKind::Unauthorized
            } else {
                ErrorKind::Internal
            },
            message: text,
        },
    })
}
