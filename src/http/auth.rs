//! Bearer-token authentication.
//!
//! Every `/api` request must carry `Authorization: Bearer <token>`. The token
//! resolves to an [`Actor`], which is stored in the request extensions for the
//! handlers. Unknown or missing tokens get the `unauthorized` envelope so
//! clients can send the user back to sign-in.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::entity::Actor;
use crate::error::ChatError;

pub type TokenTable = Arc<HashMap<String, Actor>>;

pub async fn require_actor(
    State(tokens): State<TokenTable>,
    mut req: Request,
    next: Next,
) -> Result<Response, ChatError> {
    let actor = bearer_token(req.headers())
        .and_then(|token| tokens.get(token))
        .cloned()
        .ok_or_else(|| {
            debug!(path = %req.uri().path(), "Rejected request without valid token");
            ChatError::Unauthorized
        })?;

    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
