/// Bearer-token middleware resolving the current agent
use crate::api::auth::AuthService;
use crate::api::handlers::error_response;
use crate::error::FieldError;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// The authenticated agent, inserted as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
}

/// Reject the request with 401 unless it carries a valid bearer token.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let agent_id = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .and_then(|token| auth.validate_token(token));

    match agent_id {
        Some(agent_id) => {
            request.extensions_mut().insert(AgentIdentity { agent_id });
            next.run(request).await
        }
        None => error_response(&FieldError::Unauthorized(
            "missing or invalid bearer token".to_string(),
        )),
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
