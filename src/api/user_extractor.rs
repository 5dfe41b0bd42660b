use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use crate::model::UserContext;

/// Axum extractor for the acting user.
///
/// - X-User-Id: user identifier, owner of created projects
/// - X-User-Email: optional
/// - X-User-Name: optional
///
/// Without `X-User-Id` the development user is assumed.
#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;

        match extract_header_value(headers, "x-user-id") {
            Some(user_id) => Ok(UserContext::with_details(
                user_id,
                extract_header_value(headers, "x-user-email"),
                extract_header_value(headers, "x-user-name"),
            )),
            None => Ok(UserContext::default_user()),
        }
    }
}

/// Non-empty header value, trimmed
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> UserContext {
        let (mut parts, _) = request.into_parts();
        UserContext::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_user_context_from_headers() {
        let request = Request::builder()
            .header("x-user-id", "test-user-123")
            .header("x-user-email", "test@example.com")
            .body(())
            .unwrap();

        let ctx = extract(request).await;
        assert_eq!(ctx.user_id, "test-user-123");
        assert_eq!(ctx.user_email.as_deref(), Some("test@example.com"));
        assert_eq!(ctx.user_name, None);
    }

    #[tokio::test]
    async fn test_blank_user_id_falls_back_to_default() {
        let request = Request::builder()
            .header("x-user-id", "  ")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await, UserContext::default_user());
    }
}
