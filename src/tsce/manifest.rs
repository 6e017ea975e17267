use crate::error::SwarmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// One test invocation within a manifest, per §3's `tests` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    pub action: Vec<String>,
    pub hard_time_out: u64,
    pub decorate_output: bool,
}

/// The JSON document submitted to the dispatcher, per §3. Built through
/// `ManifestBuilder`, then frozen once its bundle is materialized — any
/// further mutation attempt is a programming error, reported as
/// `SwarmError::Config` rather than a panic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskManifest {
    pub task_name: String,
    pub shards: u32,
    pub dimensions: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub priority: u32,
    pub deadline: u64,
    pub data: Vec<(String, String)>,
    pub tests: Vec<TestSpec>,

    #[serde(skip)]
    frozen: bool,
}

impl TaskManifest {
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freezes the manifest once its bundle has been materialized and
    /// uploaded. Called exactly once per manifest, right before submission.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Appends a `[url, local_filename]` pair to `data`, e.g. the bootstrap
    /// bundle's CAS URL. Fails if the manifest is already frozen.
    pub fn add_data(&mut self, url: String, local_filename: String) -> Result<(), SwarmError> {
        if self.frozen {
            return Err(SwarmError::Config(
                "cannot mutate a frozen TaskManifest".to_string(),
            ));
        }
        self.data.push((url, local_filename));
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, SwarmError> {
        serde_json::to_string(self).map_err(SwarmError::from)
    }
}

/// Builder consuming `self` through chained setters, mirroring the
/// teacher's `CacheBuilder`/`ConfigBuilder` style.
pub struct ManifestBuilder {
    task_name: Option<String>,
    shards: u32,
    dimensions: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    working_dir: String,
    priority: u32,
    deadline: u64,
    tests: Vec<TestSpec>,
    extra_args: Vec<String>,
    profile: bool,
    isolated_key: String,
    isolated_digest: String,
}

impl ManifestBuilder {
    pub fn new(isolated_key: impl Into<String>, isolated_digest: impl Into<String>) -> Self {
        Self {
            task_name: None,
            shards: 1,
            dimensions: BTreeMap::new(),
            env: BTreeMap::new(),
            working_dir: ".".to_string(),
            priority: 100,
            deadline: 6 * 60 * 60,
            tests: Vec::new(),
            extra_args: Vec::new(),
            profile: false,
            isolated_key: isolated_key.into(),
            isolated_digest: isolated_digest.into(),
        }
    }

    pub fn task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn shards(mut self, shards: u32) -> Self {
        self.shards = shards;
        self
    }

    pub fn dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn deadline(mut self, seconds: u64) -> Self {
        self.deadline = seconds;
        self
    }

    pub fn test(mut self, spec: TestSpec) -> Self {
        self.tests.push(spec);
        self
    }

    /// Extra argv tokens passed through to the isolated command after `--`.
    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn profile(mut self, enabled: bool) -> Self {
        self.profile = enabled;
        self
    }

    /// Derives `"<key>/<dims>/<digest>/<epoch_ms>"` when no explicit name was
    /// set, per §4.2.1.
    fn derive_task_name(&self, epoch_ms: u64) -> String {
        let dims = self
            .dimensions
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("_");
        format!(
            "{}/{}/{}/{}",
            self.isolated_key, dims, self.isolated_digest, epoch_ms
        )
    }

    pub fn build(mut self, epoch_ms: u64) -> Result<TaskManifest, SwarmError> {
        if self.shards < 1 {
            return Err(SwarmError::Config("shards must be >= 1".to_string()));
        }
        if self.priority > 1000 {
            return Err(SwarmError::Config(
                "priority must be in [0, 1000]".to_string(),
            ));
        }
        if self.deadline == 0 {
            return Err(SwarmError::Config("deadline must be > 0".to_string()));
        }

        if self.shards > 1 {
            self.env
                .insert("GTEST_SHARD_INDEX".to_string(), "%(instance_index)s".to_string());
            self.env
                .insert("GTEST_TOTAL_SHARDS".to_string(), "%(num_instances)s".to_string());
        }
        if self.profile {
            self.env.insert("SWARM_PROFILE".to_string(), "1".to_string());
        }

        let task_name = self
            .task_name
            .clone()
            .unwrap_or_else(|| self.derive_task_name(epoch_ms));

        let mut tests = self.tests;
        if !self.extra_args.is_empty() {
            for test in &mut tests {
                test.action.push("--".to_string());
                test.action.extend(self.extra_args.iter().cloned());
            }
        }

        Ok(TaskManifest {
            task_name,
            shards: self.shards,
            dimensions: self.dimensions,
            env: self.env,
            working_dir: self.working_dir,
            priority: self.priority,
            deadline: self.deadline,
            data: Vec::new(),
            tests,
            frozen: false,
        })
    }
}

/// Current epoch time in milliseconds, used for task-name derivation.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_manifest_with_defaults() {
        let manifest = ManifestBuilder::new("mytest", "abc123")
            .build(1_700_000_000_000)
            .unwrap();
        assert_eq!(manifest.shards, 1);
        assert_eq!(manifest.priority, 100);
        assert!(!manifest.is_frozen());
        assert!(manifest.task_name.starts_with("mytest//abc123/"));
    }

    #[test]
    fn multi_shard_rewrites_env() {
        let manifest = ManifestBuilder::new("mytest", "abc123")
            .shards(4)
            .build(1_700_000_000_000)
            .unwrap();
        assert_eq!(manifest.env.get("GTEST_SHARD_INDEX").unwrap(), "%(instance_index)s");
        assert_eq!(manifest.env.get("GTEST_TOTAL_SHARDS").unwrap(), "%(num_instances)s");
    }

    #[test]
    fn explicit_task_name_wins_over_derivation() {
        let manifest = ManifestBuilder::new("mytest", "abc123")
            .task_name("custom")
            .build(1_700_000_000_000)
            .unwrap();
        assert_eq!(manifest.task_name, "custom");
    }

    #[test]
    fn dimensions_join_sorted_into_task_name() {
        let manifest = ManifestBuilder::new("mytest", "abc123")
            .dimension("os", "linux")
            .dimension("cpu", "x86")
            .build(1_700_000_000_000)
            .unwrap();
        assert!(manifest.task_name.contains("cpu=x86_os=linux"));
    }

    #[test]
    fn rejects_zero_shards() {
        let result = ManifestBuilder::new("mytest", "abc123")
            .shards(0)
            .build(1_700_000_000_000);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_priority_out_of_range() {
        let result = ManifestBuilder::new("mytest", "abc123")
            .priority(1001)
            .build(1_700_000_000_000);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_deadline() {
        let result = ManifestBuilder::new("mytest", "abc123")
            .deadline(0)
            .build(1_700_000_000_000);
        assert!(result.is_err());
    }

    #[test]
    fn frozen_manifest_rejects_mutation() {
        let mut manifest = ManifestBuilder::new("mytest", "abc123")
            .build(1_700_000_000_000)
            .unwrap();
        manifest.freeze();
        let result = manifest.add_data("https://x".to_string(), "bundle.zip".to_string());
        assert!(result.is_err());
    }

    #[test]
    fn extra_args_appended_after_double_dash() {
        let manifest = ManifestBuilder::new("mytest", "abc123")
            .test(TestSpec {
                name: "t1".to_string(),
                action: vec!["run_test".to_string()],
                hard_time_out: 60,
                decorate_output: false,
            })
            .extra_args(vec!["--gtest_filter=Foo.*".to_string()])
            .build(1_700_000_000_000)
            .unwrap();
        assert_eq!(
            manifest.tests[0].action,
            vec!["run_test", "--", "--gtest_filter=Foo.*"]
        );
    }
}
