use crate::cas::{BlobStore, Digest};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// The isolated-blob wire format, §3: a content-addressed JSON manifest
/// describing a directory tree by its files and a DAG of included subtrees.
#[derive(Debug, Deserialize)]
pub struct Isolated {
    #[serde(default)]
    pub files: BTreeMap<String, IsolatedFile>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub relative_cwd: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub algo: String,
}

#[derive(Debug, Deserialize)]
pub struct IsolatedFile {
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// Fetches `root` and walks its transitive `includes` closure, materializing
/// every referenced file under `dest`. Grounded on
/// `isolateserver.fetch_isolated`'s recursive walk over the includes DAG;
/// implemented as an explicit worklist rather than recursive `async fn` to
/// sidestep the self-referential-future problem.
pub async fn fetch_isolated_tree(store: &dyn BlobStore, root: &Digest, dest: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dest)
        .await
        .context("failed to create output directory")?;

    let mut pending = vec![root.clone()];
    let mut seen = HashSet::new();

    while let Some(digest) = pending.pop() {
        if !seen.insert(digest.to_key_string()) {
            continue;
        }

        let bytes = store
            .get(&digest)
            .await
            .with_context(|| format!("failed to fetch isolated blob {digest}"))?;
        let isolated: Isolated = serde_json::from_slice(&bytes)
            .with_context(|| format!("malformed isolated blob {digest}"))?;

        for (name, file) in &isolated.files {
            let file_digest = Digest::from_key_string(&file.digest)
                .map_err(|e| anyhow::anyhow!("invalid digest for file {name} in isolated {digest}: {e}"))?;
            let content = store
                .get(&file_digest)
                .await
                .with_context(|| format!("failed to fetch file {name} ({file_digest})"))?;

            let path = dest.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;

            #[cfg(unix)]
            if let Some(mode) = file.mode {
                use std::os::unix::fs::PermissionsExt;
                let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await;
            }
        }

        for include in &isolated.includes {
            let include_digest = Digest::from_key_string(include)
                .map_err(|e| anyhow::anyhow!("invalid include digest in isolated {digest}: {e}"))?;
            pending.push(include_digest);
        }
    }

    Ok(())
}
