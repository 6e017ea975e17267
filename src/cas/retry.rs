use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;

/// Outcome a retryable operation reports back, distinguishing terminal
/// failures (4xx, config errors) from failures worth retrying.
pub enum Attempt<T> {
    Done(T),
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Exponential backoff with jitter, per §4.1: initial delay ~1s, cap ~15s,
/// at most `max_attempts` tries. Mirrors the backoff shape of
/// `original_source`'s `retrieve_results` poller but applied to CAS
/// transport calls rather than result polling.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut delay = config.initial_delay();
    let mut last_err = None;

    for attempt in 0..config.max_attempts {
        match op().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retry(err) => {
                last_err = Some(err);
                if attempt + 1 == config.max_attempts {
                    break;
                }
                let jitter = Duration::from_millis(rand::random::<u64>() % 250);
                tokio::time::sleep(delay + jitter).await;
                delay = (delay * 2).min(config.max_delay());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry budget exhausted with no recorded error")))
}
