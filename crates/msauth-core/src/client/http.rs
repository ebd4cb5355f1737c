use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

use super::AuthClient;
use crate::errors::{MsAuthError, Result};

const BODY_SNIPPET_LEN: usize = 200;

impl AuthClient {
    /// Send a request, retrying connection failures, timeouts and
    /// 429/5xx gateway statuses according to the configured policy
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            // Streaming bodies can't be replayed; send those exactly once
            let Some(this_try) = request.try_clone() else {
                return Ok(request.send().await?);
            };

            match this_try.send().await {
                Ok(response) if is_transient_status(response.status()) && attempt < policy.max_retries => {
                    warn!(
                        status = %response.status(),
                        attempt = attempt + 1,
                        "Transient HTTP status, retrying"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if is_transient_error(&e) && attempt < policy.max_retries => {
                    warn!(attempt = attempt + 1, "Request failed ({}), retrying", e);
                }
                Err(e) => return Err(e.into()),
            }

            tokio::time::sleep(policy.delay_for(attempt)).await;
            attempt += 1;
        }
    }
}

/// Turn a non-success response into [`MsAuthError::Http`]
pub(crate) async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(http_error(status, &body))
}

pub(crate) fn http_error(status: StatusCode, body: &str) -> MsAuthError {
    MsAuthError::Http {
        status,
        body_snippet: body.chars().take(BODY_SNIPPET_LEN).collect(),
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}
