//! The proxying path (spec §4.5, §6, §7): pick an account, make sure its
//! token is fresh, forward the request, classify the response, and apply
//! the streaming failover policy.
//!
//! Account selection and the pure failure bookkeeping live in `pool`; this
//! module is the proxy layer spec §7's table assigns the stream-failover
//! decision to, since only it knows whether any byte of the response has
//! already reached the client.

use std::pin::Pin;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use provider::UpstreamSignal;
use provider::stream::{strip_hop_by_hop_headers, terminal_failed_event};
use tracing::{info, warn};

use crate::metrics;
use crate::state::{GatewayState, find_account, now_secs};

const STICKY_KEY_HEADER: &str = "x-lb-sticky-key";
const MAX_SELECTION_ATTEMPTS: usize = 4;

pub async fn proxy_request(state: &GatewayState, method: Method, mut headers: HeaderMap, body: Bytes) -> Response {
    let start = std::time::Instant::now();
    strip_hop_by_hop_headers(&mut headers);
    headers.remove(header::HOST);

    let sticky_key = headers
        .get(STICKY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Ok(name) = HeaderName::from_bytes(STICKY_KEY_HEADER.as_bytes()) {
        headers.remove(name);
    }

    let mut reallocate_sticky = false;
    for attempt in 1..=MAX_SELECTION_ATTEMPTS {
        let now = now_secs();

        let outcome = match state.facade.select_account(sticky_key.as_deref(), reallocate_sticky, now).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "account selection failed");
                return finish(&method, StatusCode::INTERNAL_SERVER_ERROR, "account selection failed", start);
            }
        };

        let Some(account_state) = outcome.account else {
            metrics::record_selection("refused");
            if let Some(reason) = outcome.reason {
                metrics::record_refusal(reason.as_str());
            }
            let message = outcome.message.unwrap_or_else(|| "no upstream account available".to_string());
            return finish(&method, StatusCode::SERVICE_UNAVAILABLE, &message, start);
        };
        metrics::record_selection("selected");

        let account = match find_account(state.store.as_ref(), &account_state.id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                warn!(account_id = %account_state.id, "selected account vanished from the store");
                reallocate_sticky = true;
                continue;
            }
            Err(err) => {
                warn!(error = %err, "store lookup failed");
                return finish(&method, StatusCode::INTERNAL_SERVER_ERROR, "store lookup failed", start);
            }
        };

        let account = match auth::ensure_fresh(
            state.store.as_ref(),
            &state.cryptor,
            &state.http_client,
            &state.endpoints,
            &account,
            now,
            state.proactive_refresh_minutes,
            false,
        )
        .await
        {
            Ok(account) => account,
            Err(auth::Error::Refresh(refresh_err)) if refresh_err.is_permanent => {
                warn!(account_id = %account.id, "account deactivated during proactive refresh");
                state.facade.invalidate_snapshot().await;
                reallocate_sticky = true;
                continue;
            }
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "token refresh failed, trying another account");
                if state.facade.record_error(&account.id, now).await.is_err() {
                    warn!(account_id = %account.id, "failed to record refresh error");
                }
                reallocate_sticky = true;
                continue;
            }
        };

        let access_token = match state.cryptor.decrypt(&account.access_token_encrypted) {
            Ok(token) => token,
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "failed to decrypt access token");
                return finish(&method, StatusCode::INTERNAL_SERVER_ERROR, "credential decryption failed", start);
            }
        };

        let mut upstream_headers = headers.clone();
        if let Err(err) = provider::inject_account_headers(
            &mut upstream_headers,
            &access_token,
            account.chatgpt_account_id.as_deref(),
        ) {
            warn!(error = %err, "failed to inject account headers");
            return finish(&method, StatusCode::INTERNAL_SERVER_ERROR, "header injection failed", start);
        }
        provider::inject_static_headers(&mut upstream_headers, &state.static_headers);

        let request = state
            .http_client
            .request(method.clone(), state.responses_url.as_str())
            .headers(upstream_headers)
            .body(body.clone());

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "upstream request failed before any response");
                if state.facade.record_error(&account.id, now).await.is_err() {
                    warn!(account_id = %account.id, "failed to record transport error");
                }
                metrics::record_stream_failover("retried");
                reallocate_sticky = true;
                if attempt == MAX_SELECTION_ATTEMPTS {
                    return finish(&method, StatusCode::BAD_GATEWAY, "upstream unreachable", start);
                }
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            let mut builder = Response::builder().status(status);
            if let Some(headers_mut) = builder.headers_mut() {
                let mut response_headers = response.headers().clone();
                strip_hop_by_hop_headers(&mut response_headers);
                *headers_mut = response_headers;
            }
            let body = streaming_body(response.bytes_stream());
            let response = builder.body(body).unwrap_or_else(|_| Response::new(Body::empty()));
            metrics::record_request(status.as_u16(), method.as_str(), start.elapsed().as_secs_f64());
            return response;
        }

        let body_text = response.text().await.unwrap_or_default();
        let signal = provider::classify_status(status.as_u16(), &body_text);
        match signal {
            UpstreamSignal::Success => unreachable!("non-2xx status already handled above"),
            UpstreamSignal::RateLimitExceeded(err) => {
                info!(account_id = %account.id, "upstream reported rate_limit_exceeded");
                let _ = state.facade.mark_rate_limit(&account.id, &to_pool_error(err), now).await;
            }
            UpstreamSignal::UsageLimitReached(err) => {
                info!(account_id = %account.id, "upstream reported usage_limit_reached");
                let _ = state.facade.mark_usage_limit_reached(&account.id, &to_pool_error(err), now).await;
            }
            UpstreamSignal::QuotaExceeded(err) => {
                info!(account_id = %account.id, "upstream reported quota_exceeded");
                let _ = state.facade.mark_quota_exceeded(&account.id, &to_pool_error(err), now).await;
            }
            UpstreamSignal::Transient => {
                let _ = state.facade.record_error(&account.id, now).await;
            }
        }
        metrics::record_stream_failover("retried");
        reallocate_sticky = true;

        if attempt == MAX_SELECTION_ATTEMPTS {
            return finish(
                &method,
                StatusCode::SERVICE_UNAVAILABLE,
                "all candidate accounts were exhausted",
                start,
            );
        }
    }

    finish(&method, StatusCode::SERVICE_UNAVAILABLE, "no upstream account available", start)
}

fn to_pool_error(err: provider::classify::UpstreamError) -> pool::UpstreamError {
    pool::UpstreamError {
        message: err.message,
        resets_at: err.resets_at.map(|v| v as f64),
        resets_in_seconds: err.resets_in_seconds,
    }
}

/// Wrap the upstream byte stream so a transport error that arrives after
/// response headers (and possibly some body) have already been sent to the
/// client is converted into one inline terminal event rather than an
/// abrupt connection close (spec §7: "Stream error after bytes sent → emit
/// terminal failed event; no retry").
fn streaming_body(upstream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> Body {
    let boxed: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> = Box::pin(upstream);
    let mapped = futures_util::stream::unfold((boxed, false), |(mut inner, done)| async move {
        if done {
            return None;
        }
        match inner.next().await {
            Some(Ok(chunk)) => Some((Ok::<Bytes, std::convert::Infallible>(chunk), (inner, false))),
            Some(Err(err)) => {
                warn!(error = %err, "upstream stream failed after response was already committed");
                metrics::record_stream_failover("terminal");
                let event = Bytes::from(terminal_failed_event(&err.to_string()));
                Some((Ok(event), (inner, true)))
            }
            None => None,
        }
    });
    Body::from_stream(mapped)
}

fn finish(method: &Method, status: StatusCode, message: &str, start: std::time::Instant) -> Response {
    metrics::record_request(status.as_u16(), method.as_str(), start.elapsed().as_secs_f64());
    let body = serde_json::json!({ "error": { "message": message } });
    (status, axum::Json(body)).into_response()
}
