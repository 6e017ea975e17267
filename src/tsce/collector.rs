use crate::config::CollectionConfig;
use crate::error::SwarmError;
use crate::tsce::dispatcher::{Dispatcher, ShardResult};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Shared cancellation flag, polled at every attempt boundary and between
/// backoff sleeps, per §5's "do not rely on interrupting blocking I/O
/// mid-read" note. A final cleanup always sets it so no poller outlives the
/// engine.
#[derive(Clone)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

enum ShardOutcome {
    Done(ShardResult),
    Timeout,
    Error(String),
}

/// Outcome of running the collector over every task key for one task:
/// per-shard results indexed by `config_instance_index`, and the order in
/// which shards actually finished (per §5's completion-order guarantee).
pub struct CollectionResult {
    pub shards: Vec<Option<ShardResult>>,
    pub completion_order: Vec<u32>,
}

/// The concurrent polling engine from §4.2.3: one poller per task key,
/// bounded to `max_parallel_polls` concurrent pollers via a semaphore,
/// spawned through a `JoinSet` the way the teacher's `baker::bake` spawns
/// its fixed-size runner pool.
pub struct Collector {
    dispatcher: Arc<Dispatcher>,
    config: CollectionConfig,
}

impl Collector {
    pub fn new(dispatcher: Arc<Dispatcher>, config: CollectionConfig) -> Self {
        Self { dispatcher, config }
    }

    /// `min(15, 1 + elapsed_since_start / 30)` seconds, per §4.2.3.
    fn poll_delay(&self, elapsed: Duration) -> Duration {
        let secs = 1 + elapsed.as_secs() / self.config.poll_interval_growth_secs;
        Duration::from_secs(secs.min(self.config.poll_interval_cap_secs))
    }

    async fn poll_shard(
        &self,
        index: u32,
        task_key: String,
        deadline: Instant,
        stop: StopSignal,
    ) -> ShardOutcome {
        let start = Instant::now();
        loop {
            if stop.is_set() {
                return ShardOutcome::Error("cancelled".to_string());
            }
            let now = Instant::now();
            if now >= deadline {
                return ShardOutcome::Timeout;
            }

            match self.dispatcher.get_result(&task_key).await {
                Ok(result) if !result.output.is_empty() => return ShardOutcome::Done(result),
                Ok(_) => debug!("shard {index}: not finished yet"),
                Err(SwarmError::ServerReject { status, .. }) => {
                    return ShardOutcome::Error(format!("shard {index} rejected with status {status}"));
                }
                Err(e) => debug!("shard {index}: retryable poll failure: {e}"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ShardOutcome::Timeout;
            }
            let delay = self.poll_delay(start.elapsed()).min(remaining);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_stop(&stop) => {
                    return ShardOutcome::Error("cancelled".to_string());
                }
            }
        }
    }

    /// Runs the engine over `task_keys` (position is the provisional shard
    /// index, overridden by each result's own `config_instance_index`).
    /// Logs and drops a second result for an already-seen index rather than
    /// failing the task (§8 property 5).
    pub async fn collect(
        &self,
        task_keys: Vec<String>,
        per_task_timeout: Duration,
        status_update_interval: Duration,
        stop: StopSignal,
    ) -> CollectionResult {
        let n = task_keys.len();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_parallel_polls.max(1)));
        let results: Arc<Mutex<Vec<Option<ShardResult>>>> = Arc::new(Mutex::new(vec![None; n]));
        let seen: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
        let completion_order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let outstanding: Arc<Mutex<HashSet<u32>>> =
            Arc::new(Mutex::new((0..n as u32).collect()));
        let deadline = Instant::now() + per_task_timeout;

        let mut join_set = JoinSet::new();
        for (index, task_key) in task_keys.into_iter().enumerate() {
            let index = index as u32;
            let semaphore = Arc::clone(&semaphore);
            let dispatcher = Arc::clone(&self.dispatcher);
            let config = self.config.clone();
            let results = Arc::clone(&results);
            let seen = Arc::clone(&seen);
            let completion_order = Arc::clone(&completion_order);
            let outstanding = Arc::clone(&outstanding);
            let stop = stop.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                let poller = Collector { dispatcher, config };
                let outcome = poller.poll_shard(index, task_key, deadline, stop).await;
                outstanding.lock().unwrap().remove(&index);

                match outcome {
                    ShardOutcome::Done(result) => {
                        let shard_index = result.config_instance_index;
                        let mut seen_guard = seen.lock().unwrap();
                        if seen_guard.contains(&shard_index) {
                            debug!("duplicate result for shard {shard_index}, ignoring");
                            return;
                        }
                        seen_guard.insert(shard_index);
                        drop(seen_guard);

                        let mut results_guard = results.lock().unwrap();
                        if (shard_index as usize) < results_guard.len() {
                            results_guard[shard_index as usize] = Some(result);
                        }
                        drop(results_guard);
                        completion_order.lock().unwrap().push(shard_index);
                    }
                    ShardOutcome::Timeout => warn!("shard {index} timed out"),
                    ShardOutcome::Error(e) => warn!("shard {index} failed: {e}"),
                }
            });
        }

        let status_task = {
            let outstanding = Arc::clone(&outstanding);
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(status_update_interval) => {}
                        _ = wait_for_stop(&stop) => break,
                    }
                    let remaining = outstanding.lock().unwrap();
                    if remaining.is_empty() {
                        break;
                    }
                    let mut indices: Vec<u32> = remaining.iter().copied().collect();
                    indices.sort_unstable();
                    info!("still waiting on shards: {indices:?}");
                }
            })
        };

        while join_set.join_next().await.is_some() {}
        stop.set();
        status_task.abort();

        let shards = Arc::try_unwrap(results)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| arc.lock().unwrap().clone());
        let completion_order = Arc::try_unwrap(completion_order)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| arc.lock().unwrap().clone());

        CollectionResult {
            shards,
            completion_order,
        }
    }
}

async fn wait_for_stop(stop: &StopSignal) {
    while !stop.is_set() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> CollectionConfig {
        CollectionConfig {
            max_parallel_polls: 4,
            poll_interval_cap_secs: 1,
            poll_interval_growth_secs: 30,
        }
    }

    async fn mock_result(server: &MockServer, key: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path("/get_result"))
            .and(query_param("r", key))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn single_shard_completes_immediately() {
        let server = MockServer::start().await;
        mock_result(
            &server,
            "key0",
            r#"{"config_instance_index":0,"machine_id":"m","machine_tag":"t","exit_codes":"0","output":"hello\n"}"#,
        )
        .await;

        let dispatcher = Arc::new(Dispatcher::new(reqwest::Client::new(), server.uri()));
        let collector = Collector::new(dispatcher, test_config());
        let result = collector
            .collect(
                vec!["key0".to_string()],
                Duration::from_secs(5),
                Duration::from_secs(300),
                StopSignal::new(),
            )
            .await;

        assert_eq!(result.shards.len(), 1);
        assert!(result.shards[0].is_some());
        assert_eq!(result.completion_order, vec![0]);
    }

    #[tokio::test]
    async fn missing_shard_is_none_after_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_result"))
            .and(query_param("r", "key1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"config_instance_index":1,"machine_id":"m","machine_tag":"t","exit_codes":"0","output":""}"#,
            ))
            .mount(&server)
            .await;
        mock_result(
            &server,
            "key0",
            r#"{"config_instance_index":0,"machine_id":"m","machine_tag":"t","exit_codes":"0","output":"hi\n"}"#,
        )
        .await;

        let dispatcher = Arc::new(Dispatcher::new(reqwest::Client::new(), server.uri()));
        let collector = Collector::new(dispatcher, test_config());
        let result = collector
            .collect(
                vec!["key0".to_string(), "key1".to_string()],
                Duration::from_millis(300),
                Duration::from_secs(300),
                StopSignal::new(),
            )
            .await;

        assert!(result.shards[0].is_some());
        assert!(result.shards[1].is_none());
    }

    #[tokio::test]
    async fn cancelling_stop_flag_ends_collection_promptly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_result"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"config_instance_index":0,"machine_id":"m","machine_tag":"t","exit_codes":"0","output":""}"#,
            ))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(reqwest::Client::new(), server.uri()));
        let collector = Collector::new(dispatcher, test_config());
        let stop = StopSignal::new();
        let stop_clone = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_clone.set();
        });

        let started = Instant::now();
        let result = collector
            .collect(
                vec!["key0".to_string()],
                Duration::from_secs(30),
                Duration::from_secs(300),
                stop,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.shards[0].is_none());
    }
}
