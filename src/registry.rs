use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{info, warn};

use crate::attachment::{AttachmentPolicy, BlobStore, Upload};
use crate::bus::{ChatEvent, EventBus};
use crate::chat::{
    ChatDetail, ChatMessage, ChatSession, ChatStatus, ClaimPlan, ClosePlan, NewMessage, SendPlan,
};
use crate::entity::Actor;
use crate::error::{ChatError, ChatResult};
use crate::store::{AppendOutcome, SessionFilter, Store};

/// Owns chat sessions: validates every mutation against the lifecycle rules and
/// serialises mutations of the same chat behind a per-chat lock.
pub struct SessionRegistry {
    store: Store,
    blobs: BlobStore,
    policy: AttachmentPolicy,
    event_bus: Arc<EventBus>,
    locks: LockMap,
}

impl SessionRegistry {
    pub fn new(
        store: Store,
        blobs: BlobStore,
        policy: AttachmentPolicy,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            blobs,
            policy,
            event_bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AttachmentPolicy {
        &self.policy
    }

    /// Opens a chat with its first message. Both are returned so the caller can
    /// render without a follow-up fetch.
    pub async fn create_session(
        &self,
        actor: &Actor,
        title: &str,
        message: &str,
    ) -> ChatResult<ChatDetail> {
        if actor.is_staff() {
            return Err(ChatError::Forbidden("only customers can open chats".into()));
        }

        let session = ChatSession::new(&actor.id, title)?;
        let mut first = NewMessage::text(&session.id, actor, message)?;
        // Keep the session's activity timestamp identical to its first message.
        first.created_at = session.last_message_at;

        let first = self.store.create_session(&session, first).await?;

        info!(chat_id = %session.id, actor = %actor, "Chat opened");
        self.event_bus
            .publish(ChatEvent::SessionCreated(session.clone()));

        Ok(ChatDetail {
            session,
            messages: vec![first],
        })
    }

    pub async fn list_sessions(
        &self,
        actor: &Actor,
        assigned_only: bool,
    ) -> ChatResult<Vec<ChatSession>> {
        let filter = if actor.is_staff() {
            SessionFilter {
                customer_id: None,
                admin_id: assigned_only.then(|| actor.id.clone()),
            }
        } else {
            SessionFilter {
                customer_id: Some(actor.id.clone()),
                admin_id: None,
            }
        };

        Ok(self.store.list_sessions(&filter).await?)
    }

    pub async fn get_detail(&self, actor: &Actor, chat_id: &str) -> ChatResult<ChatDetail> {
        let session = self.load(chat_id).await?;
        session.ensure_visible_to(actor)?;
        let messages = self.store.list_messages(chat_id).await?;
        Ok(ChatDetail { session, messages })
    }

    /// Claim an open chat. `admin_id`, when given, must name the caller.
    pub async fn assign(
        &self,
        actor: &Actor,
        chat_id: &str,
        admin_id: Option<&str>,
    ) -> ChatResult<ChatSession> {
        if let Some(admin_id) = admin_id {
            if admin_id != actor.id {
                return Err(ChatError::Forbidden(
                    "admins can only claim chats for themselves".into(),
                ));
            }
        }

        let _guard = self.lock_chat(chat_id).await;

        let session = self.load(chat_id).await?;
        match session.plan_claim(actor)? {
            ClaimPlan::AlreadyOwned => Ok(session),
            ClaimPlan::Take => {
                if !self.store.claim(chat_id, &actor.id).await? {
                    let current = self.load(chat_id).await?;
                    warn!(chat_id, actor = %actor, winner = ?current.admin_id, "Claim lost");
                    return Err(ChatError::Conflict(format!(
                        "chat {} was already claimed by {}",
                        chat_id,
                        current.admin_id.as_deref().unwrap_or("another admin")
                    )));
                }

                info!(chat_id, actor = %actor, "Chat claimed");
                self.event_bus.publish(ChatEvent::SessionAssigned {
                    chat_id: chat_id.to_string(),
                    admin_id: actor.id.clone(),
                });
                self.load(chat_id).await
            }
        }
    }

    pub async fn send_message(
        &self,
        actor: &Actor,
        chat_id: &str,
        body: &str,
    ) -> ChatResult<ChatMessage> {
        let _guard = self.lock_chat(chat_id).await;

        let session = self.load(chat_id).await?;
        let plan = session.plan_send(actor)?;
        let msg = NewMessage::text(chat_id, actor, body)?;

        self.append(actor, plan, msg).await
    }

    /// Store the payload, then append a message pointing at it. Policy failures
    /// happen before anything is written; a failed append removes the blob again.
    pub async fn send_attachment(
        &self,
        actor: &Actor,
        chat_id: &str,
        caption: Option<&str>,
        upload: Upload,
    ) -> ChatResult<ChatMessage> {
        self.policy.check(&upload)?;
        if let Some(caption) = caption {
            self.policy.check_caption(caption)?;
        }

        let _guard = self.lock_chat(chat_id).await;

        let session = self.load(chat_id).await?;
        let plan = session.plan_send(actor)?;

        let stored = self.blobs.put(chat_id, &upload).await?;
        let msg = NewMessage::attachment(chat_id, actor, caption, upload.role.kind(), stored.clone());

        match self.append(actor, plan, msg).await {
            Ok(message) => Ok(message),
            Err(e) => {
                self.blobs.remove(&stored).await;
                Err(e)
            }
        }
    }

    /// Closing an already closed chat is a successful no-op.
    pub async fn close_session(&self, actor: &Actor, chat_id: &str) -> ChatResult<ChatSession> {
        let _guard = self.lock_chat(chat_id).await;

        let session = self.load(chat_id).await?;
        match session.plan_close(actor)? {
            ClosePlan::AlreadyClosed => Ok(session),
            ClosePlan::Close => {
                self.store.close(chat_id, &actor.id, Utc::now()).await?;

                info!(chat_id, actor = %actor, "Chat closed");
                self.event_bus.publish(ChatEvent::SessionClosed {
                    chat_id: chat_id.to_string(),
                    closed_by: actor.id.clone(),
                    was_unassigned: session.status == ChatStatus::Open,
                });
                self.load(chat_id).await
            }
        }
    }

    /// Staff-only hard delete of a chat, its messages and its stored files.
    pub async fn delete_session(&self, actor: &Actor, chat_id: &str) -> ChatResult<()> {
        if !actor.is_staff() {
            return Err(ChatError::Forbidden("only staff can delete chats".into()));
        }

        {
            let _guard = self.lock_chat(chat_id).await;
            if !self.store.delete(chat_id).await? {
                return Err(ChatError::chat_not_found(chat_id));
            }
        }

        if let Err(e) = self.blobs.remove_chat(chat_id).await {
            warn!(chat_id, "Chat deleted but attachments remain: {:#}", e);
        }

        info!(chat_id, actor = %actor, "Chat deleted");
        self.event_bus.publish(ChatEvent::SessionDeleted {
            chat_id: chat_id.to_string(),
            deleted_by: actor.id.clone(),
        });
        Ok(())
    }

    /// Marks the other party's messages as read for `actor`.
    pub async fn mark_read(&self, actor: &Actor, chat_id: &str) -> ChatResult<u64> {
        let session = self.load(chat_id).await?;
        session.ensure_visible_to(actor)?;
        Ok(self.store.mark_read(chat_id, &actor.id).await?)
    }

    async fn append(
        &self,
        actor: &Actor,
        plan: SendPlan,
        msg: NewMessage,
    ) -> ChatResult<ChatMessage> {
        let chat_id = msg.chat_id.clone();
        let claim_for = plan.claim.then_some(actor.id.as_str());

        match self.store.append_message(msg, claim_for).await? {
            AppendOutcome::Appended(message) => {
                if plan.claim {
                    info!(chat_id = %chat_id, actor = %actor, "Chat claimed by first reply");
                    self.event_bus.publish(ChatEvent::SessionAssigned {
                        chat_id: chat_id.clone(),
                        admin_id: actor.id.clone(),
                    });
                }
                self.event_bus
                    .publish(ChatEvent::MessagePosted(message.clone()));
                Ok(message)
            }
            AppendOutcome::ClaimLost => Err(ChatError::Conflict(format!(
                "chat {} was claimed by another admin",
                chat_id
            ))),
            AppendOutcome::NotWritable => Err(ChatError::chat_closed(&chat_id)),
        }
    }

    async fn load(&self, chat_id: &str) -> ChatResult<ChatSession> {
        self.store
            .get_session(chat_id)
            .await?
            .ok_or_else(|| ChatError::chat_not_found(chat_id))
    }

    async fn lock_chat(&self, chat_id: &str) -> ChatGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(chat_id.to_string())
            .or_default()
            .clone();

        let mut guard = ChatGuard {
            locks: &self.locks,
            chat_id: chat_id.to_string(),
            held: None,
        };
        // Built before waiting so a cancelled wait still prunes the entry.
        guard.held = Some(lock.lock_owned().await);
        guard
    }
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one chat. The map entry is dropped with the last holder,
/// so unknown ids and finished chats leave nothing behind.
struct ChatGuard<'a> {
    locks: &'a LockMap,
    chat_id: String,
    held: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ChatGuard<'_> {
    fn drop(&mut self) {
        self.held.take();

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold their own clone, so a count of one means only the map is left.
        if locks
            .get(&self.chat_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.chat_id);
        }
    }
}
