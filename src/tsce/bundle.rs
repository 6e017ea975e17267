use anyhow::{Context, Result};
use bytes::Bytes;
use std::io::Write;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// An in-memory zip containing the bootstrap runner and any auxiliary
/// scripts, uploaded to CAS as a single blob. Per §3's Bundle invariant the
/// zip must be byte-stable across invocations given the same inputs: entries
/// are written in sorted order with no embedded timestamps, so the digest
/// computed over its bytes never drifts run to run.
pub struct Bundle {
    entries: Vec<(String, Bytes)>,
}

impl Bundle {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add_file(&mut self, name: impl Into<String>, content: Bytes) {
        self.entries.push((name.into(), content));
    }

    /// Serializes to zip bytes. Entries are sorted by name first so ordering
    /// never depends on the order `add_file` was called in, and every entry
    /// gets a fixed mtime so the archive's bytes depend only on its
    /// filenames and contents.
    pub fn to_zip_bytes(&self) -> Result<Bytes> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buffer = Vec::new();
        {
            let mut writer = ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .last_modified_time(zip::DateTime::default());

            for (name, content) in &sorted {
                writer
                    .start_file(name, options)
                    .context(format!("failed to start zip entry {name}"))?;
                writer
                    .write_all(content)
                    .context(format!("failed to write zip entry {name}"))?;
            }
            writer.finish().context("failed to finalize bundle zip")?;
        }

        Ok(Bytes::from(buffer))
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}
