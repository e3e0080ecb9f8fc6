use std::path::Path;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use poem::http::StatusCode;
use poem::Endpoint;
use poem::Middleware;
use poem::Request;
use poem::Result as PoemResult;
use tracing::debug;
use tracing::warn;

use super::errors::ApiError;

/// Paths served without credentials.
const UNAUTHENTICATED_PATHS: &[&str] = &["/healthz"];

/// Reads the bearer token expected on admin requests.
pub fn load_token_file(path: &Path) -> Result<String, Report<ApiError>> {
    let contents = std::fs::read_to_string(path).change_context(ApiError::AuthMaterial {
        reason: format!("failed to read token file {}", path.display()),
    })?;
    let token = contents.trim();
    if token.is_empty() {
        return Err(Report::new(ApiError::AuthMaterial {
            reason: format!("token file {} is empty", path.display()),
        }));
    }
    debug!(path = %path.display(), "Loaded admin bearer token");
    Ok(token.to_string())
}

/// Static bearer token authentication middleware
pub struct BearerAuthMiddleware {
    token: Arc<str>,
}

impl BearerAuthMiddleware {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl<E> Middleware<E> for BearerAuthMiddleware
where E: Endpoint
{
    type Output = BearerAuthEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        BearerAuthEndpoint {
            inner: ep,
            token: Arc::clone(&self.token),
        }
    }
}

pub struct BearerAuthEndpoint<E> {
    inner: E,
    token: Arc<str>,
}

impl<E> Endpoint for BearerAuthEndpoint<E>
where E: Endpoint
{
    type Output = E::Output;

    async fn call(&self, req: Request) -> PoemResult<Self::Output> {
        if UNAUTHENTICATED_PATHS.contains(&req.uri().path()) {
            return self.inner.call(req).await;
        }

        let presented = req
            .headers()
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| {
                poem::Error::from_string("Missing bearer token", StatusCode::UNAUTHORIZED)
            })?;

        if presented != &*self.token {
            warn!(path = req.uri().path(), "Rejected admin request with invalid token");
            return Err(poem::Error::from_string(
                "Authentication failed",
                StatusCode::UNAUTHORIZED,
            ));
        }

        self.inner.call(req).await
    }
}
