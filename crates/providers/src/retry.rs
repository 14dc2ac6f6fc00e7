//! Bounded retry with capped exponential backoff for transport errors.

use std::future::Future;
use std::time::Duration;

use sz_domain::{Error, Result};

const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 8_000;

/// Run `op` up to `attempts` times, backing off between transient
/// failures. Non-transient errors (validation, policy) return
/// immediately.
pub async fn with_retry<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_err: Option<Error> = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = (BASE_DELAY_MS << (attempt - 1)).min(MAX_DELAY_MS);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                tracing::warn!(attempt = attempt + 1, error = %e, "transient backend error");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Other("retry exhausted with no error".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Http("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Http("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_bail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Unauthorized) }
        })
        .await;
        assert!(matches!(result, Err(Error::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
