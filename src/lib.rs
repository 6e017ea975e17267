pub mod cas;
pub mod config;
pub mod error;
pub mod once;
pub mod tsce;

use anyhow::{bail, Context};
use bytes::Bytes;
use cas::{BlobStore, Digest, HttpBlobStore, LocalBlobStore};
use clap::{Parser, Subcommand};
use config::Config;
use error::SwarmError;
use log::info;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tsce::{
    aggregate_exit_code, decorate_shard_output, epoch_millis, extract_output_location,
    fetch_isolated_tree, Collector, Dispatcher, Isolated, ManifestBuilder, StopSignal, Summary,
    TestSpec,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_LEVEL: &str = "warn";

/// Client for a distributed test-execution service: content-addressed
/// uploads, sharded task submission/collection, and build memoization.
#[derive(Parser, Debug)]
#[command(name = "swarm", version, about, long_about)]
pub struct Args {
    /// Path to an optional YAML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Archives an isolated file (or accepts a raw digest), uploads a
    /// bootstrap bundle, and submits a sharded task to the dispatcher.
    Trigger(TriggerArgs),

    /// Polls for a previously triggered task's shard results and writes
    /// `summary.json` plus fetched output artifacts.
    Collect(CollectArgs),

    /// Triggers a task and collects its results in one invocation.
    Run(RunArgs),

    /// Lists bots known to the dispatcher, optionally filtered by dimension.
    Query(QueryArgs),

    /// Runs a memoized build step, reusing a prior output tree when inputs,
    /// commands, and environment are unchanged.
    Once(OnceArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Path to a local isolated file, or a raw digest already present in CAS.
    pub isolated: String,

    #[arg(long)]
    pub task_name: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub shards: u32,

    /// Worker-selection dimension as `key=value`. May be repeated.
    #[arg(long = "dimension", value_parser = parse_key_val)]
    pub dimensions: Vec<(String, String)>,

    /// Environment variable as `key=value`. May be repeated.
    #[arg(long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    #[arg(long, default_value = ".")]
    pub working_dir: String,

    #[arg(long, default_value_t = 100)]
    pub priority: u32,

    #[arg(long, default_value_t = 6 * 60 * 60)]
    pub deadline: u64,

    /// Extra argv tokens appended to every test's command after `--`.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CollectArgs {
    pub task_name: String,

    #[arg(short = 't', long, default_value_t = 300)]
    pub timeout_secs: u64,

    #[arg(long)]
    pub decorate: bool,

    #[arg(long)]
    pub task_output_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub trigger: TriggerArgs,

    #[arg(short = 't', long, default_value_t = 300)]
    pub timeout_secs: u64,

    #[arg(long)]
    pub decorate: bool,

    #[arg(long)]
    pub task_output_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct QueryArgs {
    #[arg(long = "dimension", value_parser = parse_key_val)]
    pub dimensions: Vec<(String, String)>,

    #[arg(long)]
    pub dead_only: bool,

    #[arg(short = 'k', long)]
    pub keep_dead: bool,

    #[arg(short = 'b', long)]
    pub bare: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct OnceArgs {
    pub package: String,

    /// Named input as `name=path`. May be repeated.
    #[arg(long = "input", value_parser = parse_key_val)]
    pub inputs: Vec<(String, String)>,

    #[arg(long)]
    pub output_dir: PathBuf,

    /// Command to run, may be repeated to run several in order.
    #[arg(long = "command")]
    pub commands: Vec<String>,

    #[arg(long)]
    pub no_cache: bool,
}

pub fn parse_key_val(s: &str) -> anyhow::Result<(String, String)> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        bail!("Invalid key=value pair: {}", s);
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

fn dispatcher_from(config: &Config) -> Dispatcher {
    let client = reqwest::Client::new();
    Dispatcher::new(client, config.dispatcher.base_url.clone())
}

fn local_store(config: &Config) -> LocalBlobStore {
    let root = config
        .cas
        .local_root
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("swarm-cas"));
    LocalBlobStore::new(root)
}

/// Archives `isolated` (a local file path) or parses it as an existing
/// digest, returning the digest to reference in the manifest. Grounded on
/// `process_trigger_options`'s "hash (sha1) of a .isolated file already
/// uploaded, or the path to archive" distinction. Case (a) archives the
/// file's transitive closure per §4.2.1, not just the root JSON.
async fn resolve_isolated_digest(isolated: &str, store: &dyn BlobStore) -> anyhow::Result<Digest> {
    let path = PathBuf::from(isolated);
    if path.is_file() {
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read isolated file {isolated}"))?;
        archive_isolated_closure(&path, content, store).await
    } else {
        Digest::from_key_string(isolated)
            .map_err(|e| anyhow::anyhow!("{isolated} is neither a file nor a valid digest: {e}"))
    }
}

/// Archives `root_bytes` and, if it parses as an isolated document, every
/// blob its `files`/`includes` reference. Referenced blobs are expected to
/// sit alongside the root file, named by their own digest key string (the
/// on-disk convention of an isolate cache); a referenced digest with no such
/// sibling is assumed already present in CAS and is left alone.
async fn archive_isolated_closure(
    path: &std::path::Path,
    root_bytes: Vec<u8>,
    store: &dyn BlobStore,
) -> anyhow::Result<Digest> {
    let root_digest = store
        .put(Bytes::from(root_bytes.clone()))
        .await
        .with_context(|| format!("failed to archive {}", path.display()))?;

    let Ok(root) = serde_json::from_slice::<Isolated>(&root_bytes) else {
        return Ok(root_digest);
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut pending: Vec<String> = root
        .files
        .values()
        .map(|f| f.digest.clone())
        .chain(root.includes.iter().cloned())
        .collect();
    let mut seen = std::collections::HashSet::new();
    seen.insert(root_digest.to_key_string());

    while let Some(digest_str) = pending.pop() {
        if !seen.insert(digest_str.clone()) {
            continue;
        }

        let sibling = dir.join(&digest_str);
        if !sibling.is_file() {
            continue;
        }
        let bytes = tokio::fs::read(&sibling)
            .await
            .with_context(|| format!("failed to read referenced blob {digest_str}"))?;
        let archived = store
            .put(Bytes::from(bytes.clone()))
            .await
            .with_context(|| format!("failed to archive referenced blob {digest_str}"))?;
        if archived.to_key_string() != digest_str {
            bail!("referenced blob {digest_str} does not hash to its declared digest");
        }

        if let Ok(nested) = serde_json::from_slice::<Isolated>(&bytes) {
            pending.extend(nested.files.values().map(|f| f.digest.clone()));
            pending.extend(nested.includes);
        }
    }

    Ok(root_digest)
}

/// Builds and submits the manifest, returning the task name the dispatcher
/// echoed back (the caller-supplied one, or the derived one).
async fn trigger(args: &TriggerArgs, config: &Config) -> anyhow::Result<String> {
    let store = local_store(config);
    store.init().await?;
    let digest = resolve_isolated_digest(&args.isolated, &store).await?;

    let isolated_key = PathBuf::from(&args.isolated)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| whoami());

    let mut builder = ManifestBuilder::new(isolated_key, digest.to_key_string())
        .shards(args.shards)
        .working_dir(&args.working_dir)
        .priority(args.priority)
        .deadline(args.deadline)
        .extra_args(args.extra_args.clone())
        .test(TestSpec {
            name: "main".to_string(),
            action: vec![],
            hard_time_out: args.deadline,
            decorate_output: true,
        });
    if let Some(name) = &args.task_name {
        builder = builder.task_name(name.clone());
    }
    for (k, v) in &args.dimensions {
        builder = builder.dimension(k, v);
    }
    for (k, v) in &args.env {
        builder = builder.env(k, v);
    }

    let mut manifest = builder.build(epoch_millis())?;

    let bundle = tsce::Bundle::new();
    let bundle_bytes = bundle.to_zip_bytes()?;
    let bundle_digest = store.put(bundle_bytes).await?;
    manifest.add_data(bundle_digest.to_key_string(), "bootstrap.zip".to_string())?;
    manifest.freeze();

    let dispatcher = dispatcher_from(config);
    let manifest_json = manifest.to_json()?;
    dispatcher.submit_task(&manifest_json).await?;

    info!("triggered task {}", manifest.task_name);
    Ok(manifest.task_name)
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "swarm".to_string())
}

/// Resolves a task's shard task keys, retrying while the dispatcher
/// responds "No matching" (task not registered yet), per §4.2.3.
async fn resolve_task_keys(
    dispatcher: &Dispatcher,
    task_name: &str,
    deadline: std::time::Instant,
) -> anyhow::Result<Vec<String>> {
    loop {
        match dispatcher.get_matching_test_cases(task_name).await {
            Ok(Some(keys)) => return Ok(keys),
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    bail!("task {task_name} was never registered by the dispatcher");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) if e.is_retryable() => {
                if std::time::Instant::now() >= deadline {
                    return Err(e.into());
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn collect(args: &CollectArgs, config: &Config) -> anyhow::Result<i32> {
    let dispatcher = Arc::new(dispatcher_from(config));
    let timeout = Duration::from_secs(args.timeout_secs);
    let deadline = std::time::Instant::now() + timeout;

    let task_keys = resolve_task_keys(&dispatcher, &args.task_name, deadline).await?;
    let collector = Collector::new(Arc::clone(&dispatcher), config.collection.clone());
    let status_interval = Duration::from_secs(config.dispatcher.status_update_interval_secs);

    let result = collector
        .collect(task_keys, timeout, status_interval, StopSignal::new())
        .await;

    let task_output_dir = args
        .task_output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&args.task_name));

    // Shards must all reference the same (storage, namespace); the CAS
    // client for that pair is opened once and reused, per §4.2.4.
    let mut agreed_storage: Option<(String, String)> = None;
    let mut shared_store: Option<HttpBlobStore> = None;

    for (index, shard) in result.shards.iter().enumerate() {
        let Some(shard_result) = shard else { continue };
        if args.decorate {
            print!("{}", decorate_shard_output(index as u32, shard_result));
        }
        let Some(location) = extract_output_location(&shard_result.output) else {
            continue;
        };

        if let Some((storage, namespace)) = &agreed_storage {
            if *storage != location.storage || *namespace != location.namespace {
                log::error!(
                    "shard {index} uses isolate server/namespace ({}, {}), task already agreed on ({storage}, {namespace}); skipping output fetch",
                    location.storage, location.namespace,
                );
                continue;
            }
        } else {
            agreed_storage = Some((location.storage.clone(), location.namespace.clone()));
            shared_store = Some(HttpBlobStore::with_namespace(
                reqwest::Client::new(),
                location.storage.clone(),
                Some(location.namespace.clone()),
                config.cas.transfer_concurrency,
            ));
        }

        let store = shared_store.as_ref().unwrap();
        let shard_dir = task_output_dir.join(index.to_string());
        if let Err(e) = fetch_output_tree(store, &location.hash, &shard_dir).await {
            log::error!("failed to fetch output for shard {index}: {e}");
        }
    }

    let shard_refs: Vec<Option<&tsce::ShardResult>> = result.shards.iter().map(|s| s.as_ref()).collect();
    Summary::new(&args.task_name, shard_refs.clone())
        .write_to(&task_output_dir)
        .await?;

    Ok(aggregate_exit_code(&shard_refs))
}

/// Materializes the isolated tree at `hash` (and its transitive `includes`
/// closure) under `shard_dir`, per §4.2.4 and scenario E4.
async fn fetch_output_tree(store: &HttpBlobStore, hash: &str, shard_dir: &std::path::Path) -> anyhow::Result<()> {
    let digest = Digest::from_key_string(hash)
        .map_err(|e| anyhow::anyhow!("invalid output digest {hash}: {e}"))?;
    fetch_isolated_tree(store, &digest, shard_dir).await
}

async fn run_query(args: &QueryArgs, config: &Config) -> anyhow::Result<()> {
    let dispatcher = dispatcher_from(config);
    let response = dispatcher.query_bots().await?;
    let timeout = Duration::from_secs(response.machine_death_timeout);
    let now = std::time::SystemTime::now();

    let mut machines = response.machines;
    machines.sort_by(|a, b| a.tag.cmp(&b.tag));

    for machine in machines {
        let last_seen = parse_last_seen(&machine.last_seen);
        let is_dead = last_seen
            .map(|seen| now.duration_since(seen).unwrap_or_default() > timeout)
            .unwrap_or(true);

        if args.dead_only && !is_dead {
            continue;
        }
        if !args.keep_dead && !args.dead_only && is_dead {
            continue;
        }

        if !dimensions_match(&machine.dimensions, &args.dimensions) {
            continue;
        }

        println!("{}", machine.tag);
        if !args.bare {
            println!("  {:?}", machine.dimensions);
        }
    }
    Ok(())
}

fn parse_last_seen(s: &str) -> Option<std::time::SystemTime> {
    // "YYYY-MM-DD HH:MM:SS" UTC. A malformed timestamp is treated as "dead"
    // by the caller, so this only needs to fail cleanly, not report why.
    let (date, time) = s.split_once(' ')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: u32 = date_parts.next()?.parse().ok()?;
    let day: u32 = date_parts.next()?.parse().ok()?;
    if date_parts.next().is_some() {
        return None;
    }

    let mut time_parts = time.split(':');
    let hour: u64 = time_parts.next()?.parse().ok()?;
    let minute: u64 = time_parts.next()?.parse().ok()?;
    let second: u64 = time_parts.next()?.parse().ok()?;
    if time_parts.next().is_some() {
        return None;
    }
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 59 {
        return None;
    }

    let days = days_since_epoch(year, month, day)?;
    let seconds = (days as u64).checked_mul(86_400)?.checked_add(hour * 3600 + minute * 60 + second)?;
    Some(std::time::UNIX_EPOCH + Duration::from_secs(seconds))
}

/// Days since 1970-01-01 for a UTC calendar date, via Howard Hinnant's
/// `days_from_civil` algorithm. Returns `None` before the epoch.
fn days_since_epoch(year: i64, month: u32, day: u32) -> Option<i64> {
    if year < 1970 {
        return None;
    }
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    Some(era * 146_097 + doe - 719_468)
}

fn dimensions_match(
    dimensions: &BTreeMap<String, serde_json::Value>,
    filters: &[(String, String)],
) -> bool {
    for (key, value) in filters {
        match dimensions.get(key) {
            Some(serde_json::Value::String(s)) if s == value => {}
            Some(serde_json::Value::Array(values)) => {
                if !values.iter().any(|v| v.as_str() == Some(value.as_str())) {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

async fn run_once(args: &OnceArgs) -> anyhow::Result<()> {
    let cache_root = std::env::temp_dir().join("swarm-once-cache");
    let engine = once::Once::new(cache_root);

    let mut named_inputs = BTreeMap::new();
    for (name, path) in &args.inputs {
        named_inputs.insert(name.clone(), PathBuf::from(path));
    }

    engine
        .run(
            &args.package,
            &named_inputs,
            &args.output_dir,
            &args.commands,
            !args.no_cache,
        )
        .await
        .map_err(anyhow::Error::from)
}

pub async fn dispatch(args: Args) -> anyhow::Result<i32> {
    let config = Config::from_file_or_default(args.config.as_deref())?;

    match args.command {
        Command::Trigger(trigger_args) => {
            let task_name = trigger(&trigger_args, &config).await?;
            println!("Triggered task: {task_name}");
            Ok(0)
        }
        Command::Collect(collect_args) => collect(&collect_args, &config).await,
        Command::Run(run_args) => {
            let task_name = trigger(&run_args.trigger, &config).await?;
            println!("Triggered task: {task_name}");
            let collect_args = CollectArgs {
                task_name,
                timeout_secs: run_args.timeout_secs,
                decorate: run_args.decorate,
                task_output_dir: run_args.task_output_dir,
            };
            collect(&collect_args, &config).await
        }
        Command::Query(query_args) => {
            run_query(&query_args, &config).await?;
            Ok(0)
        }
        Command::Once(once_args) => {
            run_once(&once_args).await?;
            Ok(0)
        }
    }
}

/// Main entry point for the library - initializes logging and runs the application.
pub async fn run() -> anyhow::Result<i32> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_LOG_LEVEL))
        .init();
    info!("swarm-client {VERSION}");

    let args = Args::parse();
    dispatch(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_val_accepts_simple_pair() {
        assert_eq!(
            parse_key_val("os=linux").unwrap(),
            ("os".to_string(), "linux".to_string())
        );
    }

    #[test]
    fn parse_key_val_rejects_missing_equals() {
        assert!(parse_key_val("os").is_err());
    }

    #[test]
    fn dimensions_match_accepts_list_valued_dimension() {
        let mut dims = BTreeMap::new();
        dims.insert(
            "os".to_string(),
            serde_json::json!(["Windows", "Windows-6.1"]),
        );
        assert!(dimensions_match(&dims, &[("os".to_string(), "Windows".to_string())]));
        assert!(!dimensions_match(&dims, &[("os".to_string(), "Linux".to_string())]));
    }

    #[test]
    fn dimensions_match_is_vacuously_true_with_no_filters() {
        let dims = BTreeMap::new();
        assert!(dimensions_match(&dims, &[]));
    }

    #[test]
    fn parse_last_seen_reads_utc_timestamp() {
        let seen = parse_last_seen("1970-01-02 00:00:01").unwrap();
        assert_eq!(
            seen.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(),
            86_400 + 1
        );
    }

    #[test]
    fn parse_last_seen_rejects_malformed_input() {
        assert!(parse_last_seen("not a timestamp").is_none());
        assert!(parse_last_seen("2024-13-01 00:00:00").is_none());
        assert!(parse_last_seen("2024-01-01 24:00:00").is_none());
    }

    #[test]
    fn parse_last_seen_is_monotonic_across_days() {
        let earlier = parse_last_seen("2024-03-01 12:00:00").unwrap();
        let later = parse_last_seen("2024-03-02 12:00:00").unwrap();
        assert!(later > earlier);
    }

    use crate::cas::blob_store::test_double::MemoryBlobStore;

    #[tokio::test]
    async fn archiving_an_isolated_file_also_archives_its_closure() {
        let dir = tempfile::TempDir::new().unwrap();

        let leaf_content = Bytes::from("leaf bytes");
        let leaf_digest = Digest::from_content(&leaf_content);
        tokio::fs::write(dir.path().join(leaf_digest.to_key_string()), &leaf_content)
            .await
            .unwrap();

        let root = serde_json::json!({
            "files": { "leaf.bin": { "digest": leaf_digest.to_key_string(), "size": leaf_content.len() } },
            "includes": [],
            "command": [],
            "relative_cwd": "",
            "version": "1.0",
            "algo": "blake3",
        });
        let root_path = dir.path().join("root.isolated");
        tokio::fs::write(&root_path, serde_json::to_vec(&root).unwrap()).await.unwrap();

        let store = MemoryBlobStore::new();
        let root_digest = resolve_isolated_digest(root_path.to_str().unwrap(), &store).await.unwrap();

        assert!(store.get(&root_digest).await.is_ok());
        assert!(store.get(&leaf_digest).await.is_ok());
    }

    #[tokio::test]
    async fn a_referenced_blob_missing_on_disk_is_assumed_already_archived() {
        let dir = tempfile::TempDir::new().unwrap();

        let missing_digest = Digest::from_content(b"never written to disk");
        let root = serde_json::json!({
            "files": { "ghost.bin": { "digest": missing_digest.to_key_string(), "size": 0 } },
            "includes": [],
            "command": [],
            "relative_cwd": "",
            "version": "1.0",
            "algo": "blake3",
        });
        let root_path = dir.path().join("root.isolated");
        tokio::fs::write(&root_path, serde_json::to_vec(&root).unwrap()).await.unwrap();

        let store = MemoryBlobStore::new();
        let result = resolve_isolated_digest(root_path.to_str().unwrap(), &store).await;
        assert!(result.is_ok());
        assert!(store.get(&missing_digest).await.is_err());
    }
}
