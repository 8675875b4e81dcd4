//! Drives one signed-in user's view of the support desk.
//!
//! Commands go straight to the server and their responses are folded into the
//! local [`ViewState`]. Two pollers keep it fresh in between: one for the
//! session list, one for the chat on screen. Failures never escape as panics;
//! they land in [`ViewState::notice`] or, for a dead credential, raise
//! [`ViewState::needs_sign_in`] and stop polling.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::attachment::Upload;
use crate::chat::{ChatDetail, ChatMessage, ChatSession, ChatStatus};
use crate::client::api::{ClientError, ClientResult, SupportClient};
use crate::client::poller::{PollConfig, Poller, TickControl};
use crate::client::snapshot::{MessageSnapshot, SessionListSnapshot};
use crate::entity::Actor;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: Option<ErrorKind>,
    pub text: String,
}

impl From<&ClientError> for Notice {
    fn from(err: &ClientError) -> Self {
        Self {
            kind: err.kind(),
            text: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveChat {
    pub session: ChatSession,
    pub messages: MessageSnapshot,
}

impl ActiveChat {
    /// The admin holding the chat, if it is someone other than `me`.
    pub fn assigned_elsewhere(&self, me: &str) -> Option<&str> {
        match (&self.session.status, self.session.admin_id.as_deref()) {
            (ChatStatus::Assigned, Some(admin)) if admin != me => Some(admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub sessions: SessionListSnapshot,
    pub active: Option<ActiveChat>,
    pub notice: Option<Notice>,
    pub needs_sign_in: bool,
    pub draft: String,
}

impl ViewState {
    fn is_active(&self, chat_id: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.session.id == chat_id)
    }

    /// Folds a fresh copy of a session into the list and the open chat.
    fn apply_session(&mut self, session: &ChatSession) {
        if self.sessions.get(&session.id).is_some() {
            self.sessions.upsert(session.clone());
        }
        if let Some(active) = self.active.as_mut().filter(|a| a.session.id == session.id) {
            active.session = session.clone();
        }
    }
}

pub struct SessionController {
    client: SupportClient,
    me: Actor,
    config: PollConfig,
    assigned_only: bool,
    state: Arc<Mutex<ViewState>>,
    list_poller: Poller,
    message_poller: Poller,
    /// Lets the list poller end message polling when the credential dies.
    message_task: Arc<Mutex<Option<AbortHandle>>>,
}

impl SessionController {
    pub fn new(client: SupportClient, me: Actor, config: PollConfig) -> Self {
        Self {
            client,
            me,
            config,
            assigned_only: false,
            state: Arc::new(Mutex::new(ViewState::default())),
            list_poller: Poller::new("session-list"),
            message_poller: Poller::new("messages"),
            message_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Staff only: limit the list to chats this admin holds.
    pub fn assigned_only(mut self, assigned_only: bool) -> Self {
        self.assigned_only = assigned_only;
        self
    }

    pub fn me(&self) -> &Actor {
        &self.me
    }

    /// A copy of the current view.
    pub fn view(&self) -> ViewState {
        self.lock().clone()
    }

    pub fn is_polling_list(&self) -> bool {
        self.list_poller.is_running()
    }

    pub fn is_polling_messages(&self) -> bool {
        self.message_poller.is_running()
    }

    /// The admin holding the open chat, when that is not the signed-in user.
    pub fn active_assigned_elsewhere(&self) -> Option<String> {
        self.lock()
            .active
            .as_ref()
            .and_then(|a| a.assigned_elsewhere(&self.me.id))
            .map(str::to_string)
    }

    pub fn dismiss_notice(&mut self) {
        self.lock().notice = None;
    }

    /// Loads the session list once and keeps it refreshed.
    pub async fn start(&mut self) -> ClientResult<()> {
        self.refresh_list().await?;

        let client = self.client.clone();
        let assigned_only = self.assigned_only;
        let state = self.state.clone();
        let message_task = self.message_task.clone();
        self.list_poller.start(
            self.config.list_interval,
            move || {
                let client = client.clone();
                async move { client.list_sessions(assigned_only).await }
            },
            move |result| on_list_tick(&state, &message_task, result),
        );
        Ok(())
    }

    pub async fn refresh_list(&mut self) -> ClientResult<()> {
        let result = self.client.list_sessions(self.assigned_only).await;
        let sessions = self.surface(result)?;
        self.lock().sessions.reconcile(sessions);
        Ok(())
    }

    /// Puts a chat on screen and starts polling its messages.
    pub async fn open_session(&mut self, chat_id: &str) -> ClientResult<()> {
        self.message_poller.stop();
        let result = self.client.get_session(chat_id).await;
        let detail = self.surface(result)?;
        self.focus(detail);
        Ok(())
    }

    pub fn leave_session(&mut self) {
        self.message_poller.stop();
        let mut view = self.lock();
        view.active = None;
        view.draft.clear();
    }

    /// Customer only. The new chat opens immediately from the response.
    pub async fn create_session(&mut self, title: &str, message: &str) -> ClientResult<ChatSession> {
        let result = self.client.create_session(title, message).await;
        let detail = self.surface(result)?;
        let session = detail.session.clone();
        info!(chat_id = %session.id, "Created chat");

        self.lock().sessions.upsert(session.clone());
        self.focus(detail);
        Ok(session)
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.lock().draft = draft.into();
    }

    /// Sends the compose draft to the open chat. The draft is only cleared
    /// once the server accepted it.
    pub async fn send_draft(&mut self) -> ClientResult<ChatMessage> {
        let (chat_id, body) = {
            let view = self.lock();
            match &view.active {
                Some(active) => (active.session.id.clone(), view.draft.clone()),
                None => return Err(ClientError::NoActiveChat),
            }
        };

        let result = self.client.send_message(&chat_id, &body).await;
        let message = self.surface(result)?;

        let mut view = self.lock();
        view.draft.clear();
        if let Some(active) = view.active.as_mut().filter(|a| a.session.id == chat_id) {
            active.messages.push_confirmed(message.clone());
        }
        Ok(message)
    }

    pub async fn send_attachment(
        &mut self,
        caption: Option<&str>,
        upload: Upload,
    ) -> ClientResult<ChatMessage> {
        let chat_id = self.active_id()?;
        let result = self.client.send_attachment(&chat_id, caption, upload).await;
        let message = self.surface(result)?;

        let mut view = self.lock();
        if let Some(active) = view.active.as_mut().filter(|a| a.session.id == chat_id) {
            active.messages.push_confirmed(message.clone());
        }
        Ok(message)
    }

    /// Staff only. Losing the race re-reads the chat so the view shows who
    /// holds it; the claim itself is not retried.
    pub async fn claim(&mut self, chat_id: &str) -> ClientResult<ChatSession> {
        match self.client.assign(chat_id).await {
            Ok(session) => {
                info!(chat_id, "Claimed chat");
                self.lock().apply_session(&session);
                Ok(session)
            }
            Err(e) if e.kind() == Some(ErrorKind::Conflict) => {
                match self.client.get_session(chat_id).await {
                    Ok(detail) => {
                        debug!(chat_id, admin = ?detail.session.admin_id, "Claim lost");
                        let mut view = self.lock();
                        view.apply_session(&detail.session);
                        if let Some(active) =
                            view.active.as_mut().filter(|a| a.session.id == chat_id)
                        {
                            active.messages.reconcile(detail.messages);
                        }
                    }
                    Err(refetch) => warn!(chat_id, "Failed to re-read lost claim: {}", refetch),
                }
                let err = self.surface_err(e);
                if let Some(admin) = self.active_assigned_elsewhere() {
                    if let Some(notice) = self.lock().notice.as_mut() {
                        notice.text = format!("{} is already handling this chat", admin);
                    }
                }
                Err(err)
            }
            Err(e) => Err(self.surface_err(e)),
        }
    }

    pub async fn close(&mut self, chat_id: &str) -> ClientResult<ChatSession> {
        let result = self.client.close(chat_id).await;
        let session = self.surface(result)?;
        info!(chat_id, "Closed chat");

        let mut view = self.lock();
        view.apply_session(&session);
        if view.is_active(chat_id) {
            drop(view);
            self.message_poller.stop();
        }
        Ok(session)
    }

    /// Staff only.
    pub async fn delete(&mut self, chat_id: &str) -> ClientResult<()> {
        let result = self.client.delete(chat_id).await;
        self.surface(result)?;
        info!(chat_id, "Deleted chat");

        let mut view = self.lock();
        view.sessions.remove(chat_id);
        if view.is_active(chat_id) {
            view.active = None;
            view.draft.clear();
            drop(view);
            self.message_poller.stop();
        }
        Ok(())
    }

    pub async fn mark_read(&mut self) -> ClientResult<u64> {
        let chat_id = self.active_id()?;
        let result = self.client.mark_read(&chat_id).await;
        self.surface(result)
    }

    /// Stops all polling and forgets local state.
    pub fn sign_out(&mut self) {
        self.list_poller.stop();
        self.message_poller.stop();
        *self.lock() = ViewState::default();
    }

    fn focus(&mut self, detail: ChatDetail) {
        let chat_id = detail.session.id.clone();
        let closed = detail.session.is_closed();
        {
            let mut view = self.lock();
            view.apply_session(&detail.session);
            view.active = Some(ActiveChat {
                session: detail.session,
                messages: MessageSnapshot::new(detail.messages),
            });
            view.draft.clear();
        }

        if closed {
            self.message_poller.stop();
            return;
        }

        let client = self.client.clone();
        let state = self.state.clone();
        let fetch_id = chat_id.clone();
        self.message_poller.start(
            self.config.message_interval,
            move || {
                let client = client.clone();
                let chat_id = fetch_id.clone();
                async move { client.get_session(&chat_id).await }
            },
            move |result| on_message_tick(&state, &chat_id, result),
        );
        *lock(&self.message_task) = self.message_poller.abort_handle();
    }

    fn active_id(&self) -> ClientResult<String> {
        self.lock()
            .active
            .as_ref()
            .map(|a| a.session.id.clone())
            .ok_or(ClientError::NoActiveChat)
    }

    fn surface<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        result.map_err(|e| self.surface_err(e))
    }

    fn surface_err(&mut self, err: ClientError) -> ClientError {
        if err.is_unauthorized() {
            warn!("Credential rejected, signing out");
            self.list_poller.stop();
            self.message_poller.stop();
            self.lock().needs_sign_in = true;
        } else {
            debug!("Command failed: {}", err);
            self.lock().notice = Some(Notice::from(&err));
        }
        err
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        lock(&self.state)
    }
}

fn on_list_tick(
    state: &Mutex<ViewState>,
    message_task: &Mutex<Option<AbortHandle>>,
    result: ClientResult<Vec<ChatSession>>,
) -> TickControl {
    let mut view = lock(state);
    match result {
        Ok(sessions) => {
            if view.sessions.reconcile(sessions) {
                debug!("Session list changed");
            }
            TickControl::Continue
        }
        Err(e) if e.is_unauthorized() => {
            view.needs_sign_in = true;
            if let Some(task) = lock(message_task).take() {
                task.abort();
            }
            TickControl::Stop
        }
        Err(e) => {
            warn!("Session list poll failed, retrying next tick: {}", e);
            TickControl::Continue
        }
    }
}

fn on_message_tick(
    state: &Mutex<ViewState>,
    chat_id: &str,
    result: ClientResult<ChatDetail>,
) -> TickControl {
    let mut view = lock(state);
    if view.needs_sign_in || !view.is_active(chat_id) {
        return TickControl::Stop;
    }

    match result {
        Ok(detail) => {
            let closed = detail.session.is_closed();
            view.apply_session(&detail.session);
            if let Some(active) = view.active.as_mut() {
                if active.messages.reconcile(detail.messages) {
                    debug!(chat_id, count = active.messages.len(), "Messages changed");
                }
            }
            if closed {
                debug!(chat_id, "Chat closed, message polling stops");
                TickControl::Stop
            } else {
                TickControl::Continue
            }
        }
        Err(e) if e.kind() == Some(ErrorKind::NotFound) => {
            view.active = None;
            view.sessions.remove(chat_id);
            view.notice = Some(Notice::from(&e));
            TickControl::Stop
        }
        Err(e) if e.is_unauthorized() => {
            view.needs_sign_in = true;
            TickControl::Stop
        }
        Err(e) => {
            warn!(chat_id, "Message poll failed, retrying next tick: {}", e);
            TickControl::Continue
        }
    }
}

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
