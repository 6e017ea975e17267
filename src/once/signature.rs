use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

/// Platform + architecture + compiler-version fingerprint. Ties a cached
/// output to the host that produced it, per the Design Note on keeping the
/// source's `gcc -v` fingerprinting behavior: outputs built on hosts whose
/// compiler differs should not be treated as interchangeable. Computed once
/// per process since it shells out to an external compiler.
fn system_summary() -> &'static str {
    static SUMMARY: OnceLock<String> = OnceLock::new();
    SUMMARY.get_or_init(|| {
        let compiler_version = std::process::Command::new("cc")
            .arg("--version")
            .output()
            .ok()
            .map(|out| String::from_utf8_lossy(&out.stdout).lines().next().unwrap_or("").to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown-compiler".to_string());

        format!(
            "{}|{}|{}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            compiler_version
        )
    })
}

/// Memoizes `stable_hash_of(path)` by absolute path within a process run,
/// per §4.3 ("Path-hash inputs are also memoized by absolute path").
fn stable_hash_of_path(path: &Path) -> std::io::Result<String> {
    let content = std::fs::read(path)?;
    Ok(blake3::hash(&content).to_hex().to_string())
}

/// A hex digest over `(package, system_summary, commands, sorted named
/// inputs)`, per §3. The key under which a computation's output digest is
/// stored in CAS. Grounded on `once.py::BuildSignature` for the algorithm
/// and on the teacher's `RecipeHasher` for the idiomatic Rust shape (a
/// struct that owns a memoization cache across repeated calls).
pub struct BuildSignature<'a> {
    package: &'a str,
    commands: &'a [String],
    named_inputs: BTreeMap<String, String>,
    path_hash_cache: BTreeMap<std::path::PathBuf, String>,
}

impl<'a> BuildSignature<'a> {
    pub fn new(package: &'a str, commands: &'a [String]) -> Self {
        Self {
            package,
            commands,
            named_inputs: BTreeMap::new(),
            path_hash_cache: BTreeMap::new(),
        }
    }

    /// Adds a named input, hashing its file contents. Inputs are sorted by
    /// name before hashing regardless of insertion order (§8 property 4).
    pub fn add_input(&mut self, name: impl Into<String>, path: &Path) -> std::io::Result<()> {
        let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let hash = if let Some(cached) = self.path_hash_cache.get(&absolute) {
            cached.clone()
        } else {
            let hash = stable_hash_of_path(&absolute)?;
            self.path_hash_cache.insert(absolute, hash.clone());
            hash
        };
        self.named_inputs.insert(name.into(), hash);
        Ok(())
    }

    fn components(&self) -> String {
        let mut parts = vec![self.package.to_string(), system_summary().to_string()];
        parts.extend(self.commands.iter().cloned());
        for (name, hash) in &self.named_inputs {
            parts.push(format!("{name}={hash}"));
        }
        parts.join("\n")
    }

    /// The hex digest identifying this computation.
    pub fn digest(&self) -> String {
        blake3::hash(self.components().as_bytes()).to_hex().to_string()
    }

    /// A readable rendering of the same inputs the digest is computed over,
    /// for debugging why a cache entry changed. Supplemented from
    /// `once.py::HumanReadableSignature`.
    pub fn to_human_readable(&self) -> String {
        let mut out = format!("package: {}\nsystem: {}\n", self.package, system_summary());
        out.push_str("commands:\n");
        for (i, cmd) in self.commands.iter().enumerate() {
            out.push_str(&format!("  [{i}] {cmd}\n"));
        }
        out.push_str("inputs:\n");
        for (name, hash) in &self.named_inputs {
            out.push_str(&format!("  {name} = {hash}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    fn input_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn same_inputs_produce_same_digest() {
        let file = input_file("hello");
        let commands = vec!["echo hi".to_string()];

        let mut sig1 = BuildSignature::new("pkg", &commands);
        sig1.add_input("src", file.path()).unwrap();

        let mut sig2 = BuildSignature::new("pkg", &commands);
        sig2.add_input("src", file.path()).unwrap();

        assert_eq!(sig1.digest(), sig2.digest());
    }

    #[test]
    fn different_package_changes_digest() {
        let file = input_file("hello");
        let commands = vec!["echo hi".to_string()];

        let mut sig1 = BuildSignature::new("pkg1", &commands);
        sig1.add_input("src", file.path()).unwrap();

        let mut sig2 = BuildSignature::new("pkg2", &commands);
        sig2.add_input("src", file.path()).unwrap();

        assert_ne!(sig1.digest(), sig2.digest());
    }

    #[test]
    fn different_command_text_changes_digest() {
        let file = input_file("hello");
        let commands1 = vec!["echo hi".to_string()];
        let commands2 = vec!["echo bye".to_string()];

        let mut sig1 = BuildSignature::new("pkg", &commands1);
        sig1.add_input("src", file.path()).unwrap();

        let mut sig2 = BuildSignature::new("pkg", &commands2);
        sig2.add_input("src", file.path()).unwrap();

        assert_ne!(sig1.digest(), sig2.digest());
    }

    #[test]
    fn reordering_inputs_by_insertion_does_not_change_digest() {
        let a = input_file("A");
        let b = input_file("B");
        let commands = vec!["build".to_string()];

        let mut sig1 = BuildSignature::new("pkg", &commands);
        sig1.add_input("a", a.path()).unwrap();
        sig1.add_input("b", b.path()).unwrap();

        let mut sig2 = BuildSignature::new("pkg", &commands);
        sig2.add_input("b", b.path()).unwrap();
        sig2.add_input("a", a.path()).unwrap();

        assert_eq!(sig1.digest(), sig2.digest());
    }

    #[test]
    fn changing_input_bytes_changes_digest() {
        let commands = vec!["build".to_string()];
        let file1 = input_file("content-v1");
        let mut sig1 = BuildSignature::new("pkg", &commands);
        sig1.add_input("src", file1.path()).unwrap();

        let file2 = input_file("content-v2");
        let mut sig2 = BuildSignature::new("pkg", &commands);
        sig2.add_input("src", file2.path()).unwrap();

        assert_ne!(sig1.digest(), sig2.digest());
    }

    #[test]
    fn human_readable_rendering_lists_inputs_and_commands() {
        let file = input_file("hello");
        let commands = vec!["echo hi".to_string()];
        let mut sig = BuildSignature::new("pkg", &commands);
        sig.add_input("src", file.path()).unwrap();

        let rendered = sig.to_human_readable();
        assert!(rendered.contains("package: pkg"));
        assert!(rendered.contains("echo hi"));
        assert!(rendered.contains("src ="));
    }
}
