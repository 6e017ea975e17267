use std::collections::BTreeMap;
use std::path::Path;

/// Rewrites `%(name)s`-style placeholders in a command just before it's
/// invoked, per §4.3. `output` and `build_signature` are always available;
/// named inputs are resolved to their absolute path. Grounded on
/// `once.py`'s command formatting step in `Once.Run`.
pub fn substitute(
    command: &str,
    named_inputs: &BTreeMap<String, std::path::PathBuf>,
    output_dir: &Path,
    build_signature: &str,
) -> String {
    let mut result = command.replace("%(output)s", &output_dir.display().to_string());
    result = result.replace("%(build_signature)s", build_signature);

    for (name, path) in named_inputs {
        let absolute = path.canonicalize().unwrap_or_else(|_| path.clone());
        result = result.replace(&format!("%({name})s"), &absolute.display().to_string());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_output_and_signature() {
        let inputs = BTreeMap::new();
        let rendered = substitute(
            "build --out %(output)s --sig %(build_signature)s",
            &inputs,
            Path::new("/tmp/out"),
            "abc123",
        );
        assert_eq!(rendered, "build --out /tmp/out --sig abc123");
    }

    #[test]
    fn substitutes_named_inputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert("src".to_string(), std::path::PathBuf::from("."));
        let rendered = substitute("compile %(src)s", &inputs, Path::new("/tmp/out"), "sig");
        assert!(!rendered.contains("%(src)s"));
    }

    #[test]
    fn leaves_unrelated_text_untouched() {
        let inputs = BTreeMap::new();
        let rendered = substitute("echo hello world", &inputs, Path::new("/tmp/out"), "sig");
        assert_eq!(rendered, "echo hello world");
    }
}
