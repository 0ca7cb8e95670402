//! Bearer-token extraction.
//!
//! Every request gets a [`RequestContext`] in its extensions carrying the
//! caller's bearer token (if any) and the configured handler deadline.  The
//! middleware never rejects a request: a missing or malformed header just
//! leaves the context without a token, and the repository layer falls back
//! to the service token.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;

use crate::context::RequestContext;

/// Bearer token from an `Authorization` header.  The scheme is matched
/// case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Attach a [`RequestContext`] to the request.  Install with
/// `axum::middleware::from_fn_with_state(handler_timeout, token_middleware)`.
pub async fn token_middleware(
    State(handler_timeout): State<Duration>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::new().with_timeout(handler_timeout);
    if let Some(token) = bearer_token(request.headers()) {
        ctx = ctx.with_token(token);
    }
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use axum::Extension;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, authorization.parse().unwrap());
        headers
    }

    #[test]
    fn extracts_bearer_tokens() {
        assert_eq!(bearer_token(&headers("Bearer abc123")), Some("abc123"));
        assert_eq!(bearer_token(&headers("bearer abc123")), Some("abc123"));
        assert_eq!(bearer_token(&headers("BEARER  abc123 ")), Some("abc123"));
    }

    #[test]
    fn ignores_other_schemes_and_garbage() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
        assert_eq!(bearer_token(&headers("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&headers("Bearer")), None);
        assert_eq!(bearer_token(&headers("Bearer   ")), None);
        assert_eq!(bearer_token(&headers("abc123")), None);
    }

    /// Echo the token the handler sees, falling back to "default-token".
    fn app() -> axum::Router {
        axum::Router::new()
            .route(
                "/",
                get(|Extension(ctx): Extension<RequestContext>| async move {
                    ctx.token_or(Some("default-token"))
                        .unwrap_or_default()
                        .to_string()
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                Duration::from_secs(10),
                token_middleware,
            ))
    }

    async fn seen_token(request: axum::http::Request<Body>) -> String {
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn middleware_passes_request_token() {
        let request = axum::http::Request::get("/")
            .header(header::AUTHORIZATION, "Bearer test-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(seen_token(request).await, "test-token");
    }

    #[tokio::test]
    async fn middleware_without_token_uses_default() {
        let request = axum::http::Request::get("/").body(Body::empty()).unwrap();
        assert_eq!(seen_token(request).await, "default-token");
    }

    #[tokio::test]
    async fn middleware_never_rejects() {
        let request = axum::http::Request::get("/")
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(seen_token(request).await, "default-token");
    }
}
