//! Classification of upstream HTTP responses into the event vocabulary the
//! balancer's pure mutators consume.
//!
//! The upstream service reports rate/quota exhaustion as a 429 response
//! whose JSON body carries an error `code` (not just the HTTP status) —
//! `rate_limit_exceeded`, `usage_limit_reached`, or `quota_exceeded` —
//! alongside an optional `message`, `resets_at` (absolute epoch seconds) and
//! `resets_in_seconds` (relative). Status codes alone are not enough to
//! distinguish these, so callers must inspect the body text.

use serde::Deserialize;

/// The upstream error payload, shaped per spec §6: `{message?, resets_at?,
/// resets_in_seconds?}`. Fed directly into the balancer's event mutators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamError {
    pub message: Option<String>,
    pub resets_at: Option<i64>,
    pub resets_in_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    code: Option<String>,
    #[serde(default)]
    resets_at: Option<i64>,
    #[serde(default)]
    resets_in_seconds: Option<f64>,
}

/// Outcome of classifying one upstream response.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamSignal {
    RateLimitExceeded(UpstreamError),
    UsageLimitReached(UpstreamError),
    QuotaExceeded(UpstreamError),
    /// Any other error status; retryable on the same account, no pool
    /// state transition.
    Transient,
    Success,
}

/// Classify an upstream response by status code and (for 429s) body text.
pub fn classify_status(status: u16, body: &str) -> UpstreamSignal {
    if (200..300).contains(&status) {
        return UpstreamSignal::Success;
    }
    if status != 429 {
        return UpstreamSignal::Transient;
    }

    let envelope: Option<ErrorEnvelope> = serde_json::from_str(body).ok();
    let error = envelope.and_then(|e| e.error);

    let Some(error) = error else {
        return UpstreamSignal::RateLimitExceeded(UpstreamError::default());
    };

    let upstream_error = UpstreamError {
        message: error.message.clone(),
        resets_at: error.resets_at,
        resets_in_seconds: error.resets_in_seconds,
    };

    match error.code.as_deref() {
        Some("usage_limit_reached") => UpstreamSignal::UsageLimitReached(upstream_error),
        Some("quota_exceeded") => UpstreamSignal::QuotaExceeded(upstream_error),
        _ => UpstreamSignal::RateLimitExceeded(upstream_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_classifies_as_success() {
        assert_eq!(classify_status(200, ""), UpstreamSignal::Success);
    }

    #[test]
    fn non_429_error_is_transient() {
        assert_eq!(classify_status(500, "boom"), UpstreamSignal::Transient);
    }

    #[test]
    fn usage_limit_reached_extracts_resets_at() {
        let body = r#"{"error":{"message":"The usage limit has been reached","code":"usage_limit_reached","resets_at":123}}"#;
        match classify_status(429, body) {
            UpstreamSignal::UsageLimitReached(err) => {
                assert_eq!(err.resets_at, Some(123));
                assert_eq!(err.message.as_deref(), Some("The usage limit has been reached"));
            }
            other => panic!("expected UsageLimitReached, got {other:?}"),
        }
    }

    #[test]
    fn quota_exceeded_extracted_from_code() {
        let body = r#"{"error":{"code":"quota_exceeded","resets_in_seconds":3600}}"#;
        match classify_status(429, body) {
            UpstreamSignal::QuotaExceeded(err) => assert_eq!(err.resets_in_seconds, Some(3600.0)),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_429_defaults_to_rate_limit_exceeded() {
        let body = r#"{"error":{"message":"Try again in 1.5s"}}"#;
        match classify_status(429, body) {
            UpstreamSignal::RateLimitExceeded(err) => {
                assert_eq!(err.message.as_deref(), Some("Try again in 1.5s"));
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_body_still_classifies_as_rate_limit_exceeded() {
        match classify_status(429, "not json") {
            UpstreamSignal::RateLimitExceeded(err) => assert_eq!(err, UpstreamError::default()),
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }
}
