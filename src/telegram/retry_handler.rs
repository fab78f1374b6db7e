//! Retry wrapper for outbound Telegram API calls (spec §4.6 "Retry policy").
//!
//! Honors `retry_after` hints from rate-limit errors, swallows "message is
//! not modified" as a no-op, and falls back to exponential backoff with
//! jitter when no hint is present. Bounded at a fixed attempt count so a
//! persistently failing chat doesn't retry forever.

use std::time::Duration;

use rand::Rng;
use regex::Regex;
use teloxide::ApiError as TeloxideApiError;
use teloxide::RequestError;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
    pub backoff_factor: f64,
    pub jitter_range: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_secs: 30,
            backoff_factor: 2.0,
            jitter_range: 0.1,
        }
    }
}

/// What a failed attempt tells us to do next.
enum RetryDecision {
    /// Swallow silently — e.g. "message is not modified".
    Ignore,
    /// Wait this long, then retry.
    Retry(Duration),
    /// Not retryable; surface to the caller.
    Fail,
}

pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn with_config(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `operation` until it succeeds, is deemed non-retryable, or the
    /// attempt budget is exhausted. Returns `Ok(None)` for an ignored
    /// terminal error (e.g. not-modified).
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<Option<T>, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RequestError>>,
    {
        for attempt in 0..self.config.max_attempts {
            match operation().await {
                Ok(value) => return Ok(Some(value)),
                Err(error) => match classify(&error) {
                    RetryDecision::Ignore => {
                        debug!("telegram call result ignored (not modified)");
                        return Ok(None);
                    }
                    RetryDecision::Fail => return Err(error),
                    RetryDecision::Retry(_) if attempt + 1 == self.config.max_attempts => {
                        warn!(attempts = self.config.max_attempts, "telegram retry budget exhausted");
                        return Err(error);
                    }
                    RetryDecision::Retry(hint) => {
                        let delay = if hint.is_zero() {
                            self.backoff_delay(attempt)
                        } else {
                            self.add_jitter(hint)
                        };
                        warn!(attempt = attempt + 1, delay_ms = delay.as_millis(), err = %error, "retrying telegram call");
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
        unreachable!("loop always returns before exhausting max_attempts")
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let base = self.config.initial_delay_ms as f64;
        let exp = base * self.config.backoff_factor.powi(attempt as i32);
        let capped = Duration::from_millis(exp as u64).min(Duration::from_secs(self.config.max_delay_secs));
        self.add_jitter(capped)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let factor = rng.gen_range(-self.config.jitter_range..self.config.jitter_range);
        let ms = delay.as_millis() as f64 * (1.0 + factor);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(error: &RequestError) -> RetryDecision {
    if let Some(text) = error_text(error) {
        if text.to_lowercase().contains("message is not modified") {
            return RetryDecision::Ignore;
        }
    }

    if let Some(seconds) = retry_after_seconds(error) {
        return RetryDecision::Retry(Duration::from_secs_f64(seconds));
    }

    match error {
        RequestError::Network(_) | RequestError::Io(_) => RetryDecision::Retry(Duration::ZERO),
        _ => RetryDecision::Fail,
    }
}

fn error_text(error: &RequestError) -> Option<String> {
    match error {
        RequestError::Api(api_err) => Some(format!("{api_err:?}")),
        other => Some(other.to_string()),
    }
}

/// Pulls a `retry_after` hint from the typed API error field first, falling
/// back to the message text — the transport SDK sometimes only reports it
/// as free text.
fn retry_after_seconds(error: &RequestError) -> Option<f64> {
    if let RequestError::Api(TeloxideApiError::Unknown(message)) = error {
        if let Some(seconds) = parse_retry_after_text(message) {
            return Some(seconds);
        }
    }
    if let RequestError::RetryAfter(duration) = error {
        return Some(duration.as_secs_f64());
    }
    error_text(error).and_then(|text| parse_retry_after_text(&text))
}

fn parse_retry_after_text(text: &str) -> Option<f64> {
    let re = Regex::new(r"(?i)retry after\s+(\d+(\.\d+)?)").ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_after_from_text() {
        assert_eq!(parse_retry_after_text("Too Many Requests: retry after 3"), Some(3.0));
        assert_eq!(parse_retry_after_text("retry after 0.5 seconds"), Some(0.5));
        assert_eq!(parse_retry_after_text("no hint here"), None);
    }

    #[tokio::test]
    async fn ignores_not_modified_error() {
        let handler = RetryHandler::new();
        let mut calls = 0;
        let result = handler
            .execute(|| {
                calls += 1;
                async move {
                    Err::<(), RequestError>(RequestError::Api(TeloxideApiError::Unknown(
                        "Bad Request: message is not modified".to_string(),
                    )))
                }
            })
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let handler = RetryHandler::new();
        let result = handler.execute(|| async { Ok::<_, RequestError>(42) }).await.unwrap();
        assert_eq!(result, Some(42));
    }
}
