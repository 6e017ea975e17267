use super::dispatcher::ShardResult;

/// Human-readable block rendering of a shard's result, used by the
/// `collect`/`run` subcommands when `--decorate` is passed. Grounded on
/// `swarming.py::decorate_shard_output`'s banner format.
pub fn decorate_shard_output(index: u32, result: &ShardResult) -> String {
    format!(
        "================ Begin output from shard {index} ================\n{}\
         ================ End output from shard {index} ================\n\
         Exit code: {} (machine: {})\n",
        result.output,
        result.max_exit_code(),
        result.machine_tag,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(output: &str) -> ShardResult {
        ShardResult {
            config_instance_index: 0,
            machine_id: "m1".to_string(),
            machine_tag: "bot1".to_string(),
            exit_codes: "0".to_string(),
            output: output.to_string(),
        }
    }

    #[test]
    fn wraps_output_in_begin_end_banners() {
        let rendered = decorate_shard_output(2, &sample_result("hello\n"));
        assert!(rendered.contains("Begin output from shard 2"));
        assert!(rendered.contains("End output from shard 2"));
        assert!(rendered.contains("hello\n"));
        assert!(rendered.contains("bot1"));
    }
}
