use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::models::session::SessionActivity;
use crate::models::token::TokenVerification;
use crate::state::SecurityCore;

/// The uniform denial response. Expired, revoked, locked, and mismatched
/// all look identical from outside; the distinction lives in server logs.
fn deny() -> Response {
    let body = sonic_rs::to_string(&sonic_rs::json!({
        "error": "Access denied"
    }))
    .unwrap_or_else(|_| r#"{"error":"Access denied"}"#.to_string());
    (StatusCode::UNAUTHORIZED, body).into_response()
}

/// Extracts the bearer token from the Authorization header.
fn extract_bearer(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Extracts the session id from the `x-session-id` header or the
/// `session_id` cookie.
fn extract_session_id(req: &Request<Body>, cookies: &Cookies) -> Option<Uuid> {
    if let Some(value) = req.headers().get("x-session-id").and_then(|v| v.to_str().ok()) {
        if let Ok(id) = Uuid::parse_str(value) {
            return Some(id);
        }
    }
    cookies
        .get("session_id")
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
}

/// Extracts the peer IP address from the request extensions.
fn extract_real_ip(req: &Request<Body>) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

/// A middleware that verifies the access token — and the session it is
/// bound to — before the request reaches business routes.
///
/// On success the verified claims (and the touched session, when one is in
/// play) are attached to the request extensions.
pub async fn require_auth(
    State(core): State<SecurityCore>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    tracing::debug!("🔐 Checking authentication...");

    let Some(token) = extract_bearer(&request) else {
        tracing::debug!("No bearer token presented");
        return Err(deny());
    };

    let claims = match core.tokens.verify_access_token(&token).await {
        TokenVerification::Valid { claims } => claims,
        TokenVerification::Expired => {
            tracing::debug!("Access token expired");
            return Err(deny());
        }
        TokenVerification::Invalid { reason } => {
            tracing::debug!("Access token rejected: {}", reason);
            return Err(deny());
        }
    };

    let session_id = extract_session_id(&request, &cookies).or(claims.session_id);
    if let Some(session_id) = session_id {
        let session = match core.sessions.get_session(session_id).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("Session lookup failed: {}", e);
                return Err(deny());
            }
        };

        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let ip_address = extract_real_ip(&request).or_else(|| claims.ip_address.clone());

        let candidate = core.sessions.generate_fingerprint(
            &session,
            user_agent.as_deref(),
            ip_address.as_deref(),
        );
        match core.sessions.validate_fingerprint(session_id, &candidate).await {
            Ok(true) => {}
            Ok(false) => {
                // A gross device change locks the session before denying.
                if let Err(e) = core
                    .sessions
                    .lock_session(session_id, "Fingerprint mismatch", None)
                    .await
                {
                    tracing::error!("Failed to lock session {}: {}", session_id, e);
                }
                tracing::warn!("❌ Fingerprint mismatch for session {}", session_id);
                return Err(deny());
            }
            Err(e) => {
                tracing::error!("Fingerprint validation failed: {}", e);
                return Err(deny());
            }
        }

        let activity = SessionActivity {
            ip_address,
            user_agent,
            data: Default::default(),
        };
        let session = match core.sessions.update_session_activity(session_id, activity).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("Session activity update rejected: {}", e);
                return Err(deny());
            }
        };

        request.extensions_mut().insert(session);
    }

    tracing::debug!("✅ User authenticated: {}", claims.sub);
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
