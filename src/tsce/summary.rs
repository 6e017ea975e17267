use super::dispatcher::ShardResult;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// `<task_output_dir>/summary.json`, written exactly once after every shard
/// reaches a terminal state, per §4.2.4.
#[derive(Serialize)]
pub struct Summary<'a> {
    pub task_name: &'a str,
    pub shards: Vec<Option<&'a ShardResult>>,
}

impl<'a> Summary<'a> {
    pub fn new(task_name: &'a str, shards: Vec<Option<&'a ShardResult>>) -> Self {
        Self { task_name, shards }
    }

    pub async fn write_to(&self, task_output_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(task_output_dir)
            .await
            .context("failed to create task output directory")?;
        let path = task_output_dir.join("summary.json");
        let json = serde_json::to_vec_pretty(self).context("failed to serialize summary")?;
        tokio::fs::write(&path, json)
            .await
            .context(format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Final exit code of a collection run, per §4.2.5: `max` of every present
/// shard's own `max_exit_code`, with a floor of 1 if any shard is missing,
/// and 0 only when every shard completed with a zero code.
pub fn aggregate_exit_code(shards: &[Option<&ShardResult>]) -> i32 {
    let any_missing = shards.iter().any(|s| s.is_none());
    let max_code = shards
        .iter()
        .filter_map(|s| s.as_ref())
        .map(|r| r.max_exit_code())
        .max()
        .unwrap_or(0);

    if any_missing {
        max_code.max(1)
    } else {
        max_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(exit_codes: &str) -> ShardResult {
        ShardResult {
            config_instance_index: 0,
            machine_id: "m".to_string(),
            machine_tag: "t".to_string(),
            exit_codes: exit_codes.to_string(),
            output: "out".to_string(),
        }
    }

    #[test]
    fn all_zero_and_complete_yields_zero() {
        let r0 = result("0");
        let r1 = result("0");
        assert_eq!(aggregate_exit_code(&[Some(&r0), Some(&r1)]), 0);
    }

    #[test]
    fn missing_shard_forces_at_least_one() {
        let r0 = result("0");
        assert_eq!(aggregate_exit_code(&[Some(&r0), None]), 1);
    }

    #[test]
    fn nonzero_shard_propagates_as_max() {
        let r0 = result("0");
        let r1 = result("3,1");
        assert_eq!(aggregate_exit_code(&[Some(&r0), Some(&r1)]), 3);
    }

    #[tokio::test]
    async fn writes_summary_json_with_null_for_missing_shards() {
        let dir = TempDir::new().unwrap();
        let r0 = result("0");
        let summary = Summary::new("task1", vec![Some(&r0), None]);
        summary.write_to(dir.path()).await.unwrap();

        let text = tokio::fs::read_to_string(dir.path().join("summary.json")).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["task_name"], "task1");
        assert_eq!(value["shards"][1], serde_json::Value::Null);
    }
}
