use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use supportline::attachment::{AttachmentPolicy, AttachmentRole, BlobStore, Upload};
use supportline::bus::EventBus;
use supportline::chat::{ChatStatus, MessageKind, IMAGE_PLACEHOLDER};
use supportline::client::controller::ViewState;
use supportline::client::poller::PollConfig;
use supportline::client::{ClientError, SessionController, SupportClient};
use supportline::entity::{Actor, Role};
use supportline::error::{ErrorEnvelope, ErrorKind};
use supportline::http::ApiServer;
use supportline::registry::SessionRegistry;
use supportline::store::Store;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const CUSTOMER_TOKEN: &str = "tok-customer";
const OTHER_CUSTOMER_TOKEN: &str = "tok-customer-2";
const ADMIN_A_TOKEN: &str = "tok-admin-a";
const ADMIN_B_TOKEN: &str = "tok-admin-b";
const MAX_BYTES: u64 = 1024;

struct TestServer {
    base_url: String,
    _uploads: TempDir,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let uploads = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let policy = AttachmentPolicy {
            max_bytes: MAX_BYTES,
            ..Default::default()
        };
        let registry = Arc::new(SessionRegistry::new(
            store,
            BlobStore::new(uploads.path()),
            policy,
            Arc::new(EventBus::new()),
        ));

        let tokens: HashMap<String, Actor> = [
            (CUSTOMER_TOKEN, customer()),
            (OTHER_CUSTOMER_TOKEN, Actor::customer("cust-2")),
            (ADMIN_A_TOKEN, admin_a()),
            (ADMIN_B_TOKEN, admin_b()),
        ]
        .into_iter()
        .map(|(token, actor)| (token.to_string(), actor))
        .collect();

        let app = ApiServer::new(registry, Arc::new(tokens)).router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            _uploads: uploads,
            task,
        }
    }

    fn client(&self, token: &str) -> SupportClient {
        SupportClient::new(&self.base_url, token).unwrap()
    }

    fn controller(&self, token: &str, me: Actor) -> SessionController {
        let fast = PollConfig {
            list_interval: Duration::from_millis(50),
            message_interval: Duration::from_millis(25),
        };
        SessionController::new(self.client(token), me, fast)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn customer() -> Actor {
    Actor::new("cust-1", "Casey", Role::Customer)
}

fn admin_a() -> Actor {
    Actor::new("admin-a", "Alex", Role::Staff)
}

fn admin_b() -> Actor {
    Actor::new("admin-b", "Blair", Role::Staff)
}

fn png(len: usize) -> Upload {
    Upload {
        role: AttachmentRole::Image,
        file_name: "receipt.png".into(),
        mime: "image/png".into(),
        bytes: vec![0x89; len],
    }
}

/// Polls the controller's view until `check` holds or a second has passed.
async fn eventually(controller: &SessionController, check: impl Fn(&ViewState) -> bool) -> bool {
    for _ in 0..40 {
        if check(&controller.view()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn refund_question_scenario() {
    let server = TestServer::spawn().await;
    let cust = server.client(CUSTOMER_TOKEN);
    let a = server.client(ADMIN_A_TOKEN);
    let b = server.client(ADMIN_B_TOKEN);

    let created = cust
        .create_session("Refund question", "I was charged twice")
        .await
        .unwrap();
    let chat_id = created.session.id.clone();
    assert_eq!(created.session.status, ChatStatus::Open);
    assert_eq!(created.messages.len(), 1);

    // Both admins see the open chat.
    for admin in [&a, &b] {
        let listed = admin.list_sessions(false).await.unwrap();
        assert!(listed
            .iter()
            .any(|s| s.id == chat_id && s.status == ChatStatus::Open));
    }

    let (ra, rb) = tokio::join!(a.assign(&chat_id), b.assign(&chat_id));
    let (winner, winner_id, loser) = match (ra, rb) {
        (Ok(session), Err(e)) => (a.clone(), session.admin_id.clone(), (b.clone(), e)),
        (Err(e), Ok(session)) => (b.clone(), session.admin_id.clone(), (a.clone(), e)),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    let (loser, claim_err) = loser;
    assert_eq!(claim_err.kind(), Some(ErrorKind::Conflict));

    // The loser re-reads and learns who won.
    let seen = loser.get_session(&chat_id).await.unwrap();
    assert_eq!(seen.session.status, ChatStatus::Assigned);
    assert_eq!(seen.session.admin_id, winner_id);

    let err = loser.send_message(&chat_id, "I can help").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Conflict));

    winner
        .send_message(&chat_id, "Looking into it now")
        .await
        .unwrap();

    let detail = cust.get_session(&chat_id).await.unwrap();
    let bodies: Vec<_> = detail.messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, ["I was charged twice", "Looking into it now"]);
    assert!(detail.messages[0].id < detail.messages[1].id);

    let closed = cust.close(&chat_id).await.unwrap();
    assert_eq!(closed.status, ChatStatus::Closed);

    // Closing again is a no-op.
    let again = cust.close(&chat_id).await.unwrap();
    assert_eq!(again.revision, closed.revision);

    let err = cust.send_message(&chat_id, "one more thing").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Conflict));
    let err = winner.assign(&chat_id).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Conflict));
}

#[tokio::test]
async fn first_staff_reply_claims_the_chat() {
    let server = TestServer::spawn().await;
    let cust = server.client(CUSTOMER_TOKEN);
    let a = server.client(ADMIN_A_TOKEN);

    let chat_id = cust
        .create_session("Login issue", "Cannot sign in")
        .await
        .unwrap()
        .session
        .id;

    a.send_message(&chat_id, "On it").await.unwrap();
    let detail = a.get_session(&chat_id).await.unwrap();
    assert_eq!(detail.session.status, ChatStatus::Assigned);
    assert_eq!(detail.session.admin_id.as_deref(), Some("admin-a"));

    let mine = a.list_sessions(true).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert!(server
        .client(ADMIN_B_TOKEN)
        .list_sessions(true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn missing_credentials_get_unauthorized_envelope() {
    let server = TestServer::spawn().await;
    let http = reqwest::Client::new();

    let resp = http
        .get(format!("{}/api/chats", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let envelope: ErrorEnvelope = resp.json().await.unwrap();
    assert_eq!(envelope.error.kind, ErrorKind::Unauthorized);

    let err = server
        .client("not-a-token")
        .list_sessions(false)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let health = http
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn visibility_follows_role_and_ownership() {
    let server = TestServer::spawn().await;
    let chat_id = server
        .client(CUSTOMER_TOKEN)
        .create_session("Billing", "Invoice is wrong")
        .await
        .unwrap()
        .session
        .id;

    let other = server.client(OTHER_CUSTOMER_TOKEN);
    let err = other.get_session(&chat_id).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Forbidden));
    assert!(other.list_sessions(false).await.unwrap().is_empty());

    // Staff can read it but cannot open chats of their own.
    let a = server.client(ADMIN_A_TOKEN);
    assert!(a.get_session(&chat_id).await.is_ok());
    let err = a.create_session("x", "y").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Forbidden));

    let err = a.get_session("chat_missing").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn attachments_are_checked_server_side() {
    let server = TestServer::spawn().await;
    let cust = server.client(CUSTOMER_TOKEN);
    let chat_id = cust
        .create_session("Damaged item", "See photo")
        .await
        .unwrap()
        .session
        .id;

    let image = cust.send_attachment(&chat_id, None, png(16)).await.unwrap();
    assert_eq!(image.kind, MessageKind::Image);
    assert_eq!(image.body, IMAGE_PLACEHOLDER);
    let stored = image.attachment.as_ref().unwrap();
    assert_eq!(stored.size, 16);
    assert_eq!(stored.mime, "image/png");

    let doc = Upload {
        role: AttachmentRole::File,
        file_name: "invoice.pdf".into(),
        mime: "application/pdf".into(),
        bytes: b"%PDF-1.4".to_vec(),
    };
    let file = cust
        .send_attachment(&chat_id, Some("the invoice"), doc)
        .await
        .unwrap();
    assert_eq!(file.kind, MessageKind::File);
    assert_eq!(file.body, "the invoice");

    let err = cust
        .send_attachment(&chat_id, None, png(MAX_BYTES as usize + 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::PayloadTooLarge));

    let svg = Upload {
        mime: "image/svg+xml".into(),
        ..png(16)
    };
    let err = cust.send_attachment(&chat_id, None, svg).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::UnsupportedMediaType));

    let caption = "x".repeat(8 * 1024);
    let err = cust
        .send_attachment(&chat_id, Some(&caption), png(16))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::PayloadTooLarge));

    // Rejected uploads left no message behind.
    let detail = cust.get_session(&chat_id).await.unwrap();
    assert_eq!(detail.messages.len(), 3);
}

#[tokio::test]
async fn controller_polls_replies_and_stops_on_close() {
    let server = TestServer::spawn().await;
    let mut ctl = server.controller(CUSTOMER_TOKEN, customer());
    ctl.start().await.unwrap();
    assert!(ctl.is_polling_list());

    let session = ctl
        .create_session("Refund question", "I was charged twice")
        .await
        .unwrap();
    assert!(ctl.is_polling_messages());
    assert_eq!(ctl.view().sessions.sessions().len(), 1);

    let a = server.client(ADMIN_A_TOKEN);
    a.send_message(&session.id, "Looking into it").await.unwrap();

    assert!(
        eventually(&ctl, |v| {
            v.active.as_ref().is_some_and(|c| {
                c.messages.len() == 2 && c.session.status == ChatStatus::Assigned
            })
        })
        .await
    );

    a.close(&session.id).await.unwrap();
    assert!(
        eventually(&ctl, |v| {
            v.active.as_ref().is_some_and(|c| c.session.is_closed())
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ctl.is_polling_messages());
    assert!(ctl.is_polling_list());

    ctl.sign_out();
    ctl.sign_out();
    assert!(!ctl.is_polling_list());
    assert_eq!(ctl.view(), ViewState::default());
}

#[tokio::test]
async fn sent_message_is_not_duplicated_by_polls() {
    let server = TestServer::spawn().await;
    let mut ctl = server.controller(CUSTOMER_TOKEN, customer());
    ctl.create_session("Order status", "Where is my order?")
        .await
        .unwrap();

    ctl.set_draft("Order #1234");
    let sent = ctl.send_draft().await.unwrap();
    let view = ctl.view();
    assert!(view.draft.is_empty());
    let ids: Vec<_> = view
        .active
        .as_ref()
        .unwrap()
        .messages
        .messages()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids.last(), Some(&sent.id));

    // Several ticks later the snapshot is identical.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let later = ctl.view();
    let later_ids: Vec<_> = later
        .active
        .as_ref()
        .unwrap()
        .messages
        .messages()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(later_ids, ids);
}

#[tokio::test]
async fn failed_send_keeps_the_draft() {
    let server = TestServer::spawn().await;
    let mut ctl = server.controller(CUSTOMER_TOKEN, customer());
    let session = ctl.create_session("Shipping", "Late parcel").await.unwrap();
    ctl.close(&session.id).await.unwrap();
    assert!(!ctl.is_polling_messages());

    ctl.set_draft("still there?");
    let err = ctl.send_draft().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Conflict));

    let view = ctl.view();
    assert_eq!(view.draft, "still there?");
    assert_eq!(view.notice.unwrap().kind, Some(ErrorKind::Conflict));
    assert_eq!(view.active.unwrap().messages.len(), 1);

    ctl.leave_session();
    let err = ctl.send_draft().await.unwrap_err();
    assert!(matches!(err, ClientError::NoActiveChat));
}

#[tokio::test]
async fn lost_claim_shows_the_winner() {
    let server = TestServer::spawn().await;
    let chat_id = server
        .client(CUSTOMER_TOKEN)
        .create_session("Refund question", "I was charged twice")
        .await
        .unwrap()
        .session
        .id;

    let mut ctl_b = server.controller(ADMIN_B_TOKEN, admin_b());
    ctl_b.start().await.unwrap();
    ctl_b.open_session(&chat_id).await.unwrap();

    server.client(ADMIN_A_TOKEN).assign(&chat_id).await.unwrap();

    let err = ctl_b.claim(&chat_id).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Conflict));

    let view = ctl_b.view();
    let active = view.active.as_ref().unwrap();
    assert_eq!(active.assigned_elsewhere("admin-b"), Some("admin-a"));
    assert_eq!(
        view.sessions.get(&chat_id).unwrap().admin_id.as_deref(),
        Some("admin-a")
    );
    let notice = view.notice.as_ref().unwrap();
    assert_eq!(notice.kind, Some(ErrorKind::Conflict));
    assert!(notice.text.contains("admin-a"));
    assert_eq!(ctl_b.active_assigned_elsewhere().as_deref(), Some("admin-a"));
}

#[tokio::test]
async fn deleted_chat_leaves_the_view() {
    let server = TestServer::spawn().await;
    let chat_id = server
        .client(CUSTOMER_TOKEN)
        .create_session("Spam", "buy now")
        .await
        .unwrap()
        .session
        .id;

    // The customer is looking at it when staff delete it.
    let mut cust = server.controller(CUSTOMER_TOKEN, customer());
    cust.start().await.unwrap();
    cust.open_session(&chat_id).await.unwrap();

    let mut admin = server.controller(ADMIN_A_TOKEN, admin_a());
    admin.start().await.unwrap();
    admin.open_session(&chat_id).await.unwrap();
    admin.delete(&chat_id).await.unwrap();
    assert!(admin.view().active.is_none());
    assert!(admin.view().sessions.get(&chat_id).is_none());

    assert!(eventually(&cust, |v| v.active.is_none()).await);
    assert_eq!(
        cust.view().notice.unwrap().kind,
        Some(ErrorKind::NotFound)
    );
    assert!(eventually(&cust, |v| v.sessions.get(&chat_id).is_none()).await);
}

#[tokio::test]
async fn rejected_credential_asks_for_sign_in() {
    let server = TestServer::spawn().await;
    let mut ctl = server.controller("expired-token", customer());

    let err = ctl.start().await.unwrap_err();
    assert!(err.is_unauthorized());

    let view = ctl.view();
    assert!(view.needs_sign_in);
    assert!(view.notice.is_none());
    assert!(!ctl.is_polling_list());
}

#[tokio::test]
async fn mark_read_flags_the_other_sides_messages() {
    let server = TestServer::spawn().await;
    let cust = server.client(CUSTOMER_TOKEN);
    let chat_id = cust
        .create_session("Refund question", "I was charged twice")
        .await
        .unwrap()
        .session
        .id;
    let a = server.client(ADMIN_A_TOKEN);
    a.send_message(&chat_id, "Refund issued").await.unwrap();

    let mut ctl = server.controller(CUSTOMER_TOKEN, customer());
    ctl.open_session(&chat_id).await.unwrap();
    assert_eq!(ctl.mark_read().await.unwrap(), 1);
    assert_eq!(ctl.mark_read().await.unwrap(), 0);
}

#[tokio::test]
async fn malformed_assign_body_is_rejected() {
    let server = TestServer::spawn().await;
    let chat_id = server
        .client(CUSTOMER_TOKEN)
        .create_session("Refund question", "I was charged twice")
        .await
        .unwrap()
        .session
        .id;

    let http = reqwest::Client::new();
    let url = format!("{}/api/chats/{}/assign", server.base_url, chat_id);
    for body in [r#"{"admin_id": 42}"#, "not json"] {
        let resp = http
            .post(&url)
            .bearer_auth(ADMIN_A_TOKEN)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let envelope: ErrorEnvelope = resp.json().await.unwrap();
        assert_eq!(envelope.error.kind, ErrorKind::Validation);
    }

    let a = server.client(ADMIN_A_TOKEN);
    assert_eq!(
        a.get_session(&chat_id).await.unwrap().session.status,
        ChatStatus::Open
    );

    // No body at all claims for the caller.
    let resp = http
        .post(&url)
        .bearer_auth(ADMIN_A_TOKEN)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(
        a.get_session(&chat_id).await.unwrap().session.admin_id.as_deref(),
        Some("admin-a")
    );
}
