//! Shared HTTP plumbing for the network adapters.
//!
//! Maps transport failures and response statuses onto [`RemoteError`] so
//! every adapter feeds the same retry policy:
//!
//! | Outcome | Error |
//! |---------|-------|
//! | timeout, connect/reset, body read failure | `Transient` |
//! | 5xx | `Transient` |
//! | 429 | `RateLimited` (with `Retry-After` when given) |
//! | 401, 403 | `Authentication` |
//! | other 4xx | `Rejected` |

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use vector_sync_core::error::RemoteError;

/// Build a client with the adapter's request timeout.
pub fn client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Map a transport-level failure.
pub fn map_reqwest_error(service: &str, err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        return RemoteError::Rejected(format!("{} returned an unreadable body: {}", service, err));
    }
    RemoteError::Transient(format!("{} request failed: {}", service, err))
}

/// Map a non-success status to an error.
pub fn status_error(
    service: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> RemoteError {
    let message = format!("{} API error {}: {}", service, status, truncate(body, 500));
    match status.as_u16() {
        401 | 403 => RemoteError::Authentication(message),
        429 => RemoteError::RateLimited {
            retry_after: parse_retry_after(headers, Utc::now()),
            message,
        },
        s if s >= 500 => RemoteError::Transient(message),
        _ => RemoteError::Rejected(message),
    }
}

/// Turn a response into its JSON body, or the mapped error.
pub async fn read_json<T: DeserializeOwned>(
    service: &str,
    response: Response,
) -> Result<T, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        return Err(error_from_response(service, response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| map_reqwest_error(service, e))
}

/// Drain a successful response with no interesting body.
pub async fn expect_success(service: &str, response: Response) -> Result<(), RemoteError> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(error_from_response(service, response).await)
}

/// The mapped error for a non-success response.
pub async fn error_from_response(service: &str, response: Response) -> RemoteError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    status_error(service, status, &headers, &body)
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
