use crate::entity::{Actor, Role};
use crate::error::{ChatError, ChatResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

pub const IMAGE_PLACEHOLDER: &str = "[image]";
pub const FILE_PLACEHOLDER: &str = "[file]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Open,
    Assigned,
    Closed,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Open => "open",
            ChatStatus::Assigned => "assigned",
            ChatStatus::Closed => "closed",
        }
    }
}

impl FromStr for ChatStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ChatStatus::Open),
            "assigned" => Ok(ChatStatus::Assigned),
            "closed" => Ok(ChatStatus::Closed),
            other => Err(anyhow::anyhow!("unknown chat status: {}", other)),
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }
}

impl FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            other => Err(anyhow::anyhow!("unknown message kind: {}", other)),
        }
    }
}

/// Where an uploaded payload ended up, plus what the uploader told us about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub attachment: Option<AttachmentRef>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// A message that has passed validation but has no store id yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub body: String,
    pub kind: MessageKind,
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn text(chat_id: &str, sender: &Actor, body: &str) -> ChatResult<Self> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::Validation("message must not be empty".into()));
        }

        Ok(Self {
            chat_id: chat_id.to_string(),
            sender_id: sender.id.clone(),
            sender_role: sender.role,
            body: body.to_string(),
            kind: MessageKind::Text,
            attachment: None,
            created_at: Utc::now(),
        })
    }

    /// The caption falls back to a placeholder so the list view has something to show.
    pub fn attachment(
        chat_id: &str,
        sender: &Actor,
        caption: Option<&str>,
        kind: MessageKind,
        attachment: AttachmentRef,
    ) -> Self {
        let caption = caption.map(str::trim).filter(|c| !c.is_empty());
        let body = match (caption, kind) {
            (Some(c), _) => c.to_string(),
            (None, MessageKind::Image) => IMAGE_PLACEHOLDER.to_string(),
            (None, _) => FILE_PLACEHOLDER.to_string(),
        };

        Self {
            chat_id: chat_id.to_string(),
            sender_id: sender.id.clone(),
            sender_role: sender.role,
            body,
            kind,
            attachment: Some(attachment),
            created_at: Utc::now(),
        }
    }

    pub fn into_message(self, id: i64) -> ChatMessage {
        ChatMessage {
            id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            sender_role: self.sender_role,
            body: self.body,
            kind: self.kind,
            attachment: self.attachment,
            is_read: false,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub status: ChatStatus,
    pub customer_id: String,
    pub admin_id: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    /// Bumped on every write to the session row.
    pub revision: i64,
}

/// A session together with its messages in store order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatDetail {
    pub session: ChatSession,
    pub messages: Vec<ChatMessage>,
}

/// What a claim request should do once the current row has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPlan {
    Take,
    AlreadyOwned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePlan {
    Close,
    AlreadyClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPlan {
    /// The send must claim the session in the same transaction.
    pub claim: bool,
}

impl ChatSession {
    pub fn new(customer_id: impl Into<String>, title: &str) -> ChatResult<Self> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::Validation("title must not be empty".into()));
        }

        let now = Utc::now();
        Ok(Self {
            id: format!("chat_{}", Uuid::new_v4().simple()),
            title: title.to_string(),
            status: ChatStatus::Open,
            customer_id: customer_id.into(),
            admin_id: None,
            last_message_at: now,
            created_at: now,
            closed_at: None,
            closed_by: None,
            revision: 1,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.status == ChatStatus::Closed
    }

    pub fn is_owned_by(&self, admin_id: &str) -> bool {
        self.admin_id.as_deref() == Some(admin_id)
    }

    /// Customers only see their own chats; staff see everything.
    pub fn ensure_visible_to(&self, actor: &Actor) -> ChatResult<()> {
        if actor.is_staff() || self.customer_id == actor.id {
            Ok(())
        } else {
            Err(ChatError::Forbidden(format!(
                "chat {} belongs to another customer",
                self.id
            )))
        }
    }

    pub fn plan_claim(&self, admin: &Actor) -> ChatResult<ClaimPlan> {
        if !admin.is_staff() {
            return Err(ChatError::Forbidden("only staff can claim chats".into()));
        }

        match self.status {
            ChatStatus::Open => Ok(ClaimPlan::Take),
            ChatStatus::Assigned if self.is_owned_by(&admin.id) => Ok(ClaimPlan::AlreadyOwned),
            ChatStatus::Assigned => Err(self.assigned_elsewhere()),
            ChatStatus::Closed => Err(ChatError::chat_closed(&self.id)),
        }
    }

    pub fn plan_send(&self, sender: &Actor) -> ChatResult<SendPlan> {
        self.ensure_visible_to(sender)?;
        if self.is_closed() {
            return Err(ChatError::chat_closed(&self.id));
        }

        match sender.role {
            Role::Customer => Ok(SendPlan { claim: false }),
            Role::Staff => match self.status {
                ChatStatus::Open => Ok(SendPlan { claim: true }),
                _ if self.is_owned_by(&sender.id) => Ok(SendPlan { claim: false }),
                // Same outcome as losing the claim race: re-fetch and see who won.
                _ => Err(self.assigned_elsewhere()),
            },
        }
    }

    pub fn plan_close(&self, actor: &Actor) -> ChatResult<ClosePlan> {
        self.ensure_visible_to(actor)?;
        if self.is_closed() {
            return Ok(ClosePlan::AlreadyClosed);
        }

        match actor.role {
            Role::Customer => Ok(ClosePlan::Close),
            Role::Staff if self.is_owned_by(&actor.id) => Ok(ClosePlan::Close),
            Role::Staff if self.status == ChatStatus::Open => Err(ChatError::Forbidden(format!(
                "chat {} is unassigned, claim it before closing",
                self.id
            ))),
            Role::Staff => Err(ChatError::Forbidden(format!(
                "chat {} is assigned to another admin",
                self.id
            ))),
        }
    }

    fn assigned_elsewhere(&self) -> ChatError {
        ChatError::Conflict(format!(
            "chat {} is already assigned to {}",
            self.id,
            self.admin_id.as_deref().unwrap_or("another admin")
        ))
    }
}
