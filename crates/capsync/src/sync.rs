//! Local sync cache: resolve capabilities and store their templates on disk.

use capsync_core::config::DEFAULT_NAMESPACE;
use capsync_core::Capability;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FetchError, ItemError};
use crate::fetch::Pipeline;

const TEMPLATE_EXTENSION: &str = "cue";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Existing file already had the same content.
    Unchanged,
}

/// One `<name>.cue` template file per capability.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{TEMPLATE_EXTENSION}", file_stem(name)))
    }

    /// Write a capability's template, replacing the file atomically.
    pub fn write(&self, capability: &Capability) -> Result<WriteOutcome> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let path = self.path_for(&capability.name);
        let content = capability.template.as_bytes();

        match fs::read(&path) {
            Ok(existing) if Sha256::digest(&existing) == Sha256::digest(content) => {
                debug!(name = %capability.name, "cached template unchanged");
                return Ok(WriteOutcome::Unchanged);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path)(e)),
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self
            .dir
            .join(format!(".{file_name}.{}.tmp", std::process::id()));
        fs::write(&tmp, content).map_err(io_error(&tmp))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&path)(e));
        }
        Ok(WriteOutcome::Written)
    }

    /// Cached template text, if present.
    pub fn read_template(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Names of cached templates, sorted.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error(&self.dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            if let Some(name) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(name_from_stem)
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// File stem for a capability name. Lowercase letters, digits, `-` and any
/// `.` after the first byte are kept. Every other byte becomes `_xx` in hex,
/// so distinct names never share a file.
pub fn file_stem(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }
    let mut stem = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_lowercase()
            || byte.is_ascii_digit()
            || byte == b'-'
            || (byte == b'.' && i > 0);
        if keep {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

/// Capability name for a stem produced by [`file_stem`], `None` otherwise.
pub fn name_from_stem(stem: &str) -> Option<String> {
    if stem == "_" {
        return Some(String::new());
    }
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem;
    while let Some(c) = rest.chars().next() {
        if c == '_' {
            let hex = rest.get(1..3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &rest[3..];
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            rest = &rest[c.len_utf8()..];
        }
    }
    let name = String::from_utf8(bytes).ok()?;
    (file_stem(&name) == stem).then_some(name)
}

/// Outcome of a sync.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub capabilities: Vec<Capability>,
    /// One line per failed item or cache write.
    pub warnings: Vec<String>,
    /// Templates whose cached file changed.
    pub written: usize,
}

impl SyncReport {
    fn store(&mut self, cache: &LocalCache, capability: Capability) {
        match cache.write(&capability) {
            Ok(WriteOutcome::Written) => self.written += 1,
            Ok(WriteOutcome::Unchanged) => {}
            Err(e) => {
                warn!(name = %capability.name, error = %e, "failed to cache template");
                self.warnings.push(format!(
                    "WARN: failed to cache template of '{}': {e}",
                    capability.name
                ));
            }
        }
        self.capabilities.push(capability);
    }
}

fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Resolve both classes and cache every successful template. Per-item
/// failures become warnings; list failures abort.
pub async fn sync_all(
    pipeline: &Pipeline,
    cache: &LocalCache,
    namespace: &str,
    cancel: &CancellationToken,
) -> std::result::Result<SyncReport, FetchError> {
    let namespace = namespace_or_default(namespace);
    let batch = pipeline.fetch_all(namespace, None, cancel).await?;

    let mut report = SyncReport {
        warnings: batch.errors.iter().map(ItemError::warning).collect(),
        ..SyncReport::default()
    };
    for capability in batch.capabilities {
        report.store(cache, capability);
    }

    info!(
        namespace,
        dir = %cache.dir().display(),
        capabilities = report.capabilities.len(),
        written = report.written,
        warnings = report.warnings.len(),
        "sync complete"
    );
    Ok(report)
}

/// Resolve one name, component first, and cache its template.
pub async fn sync_one(
    pipeline: &Pipeline,
    cache: &LocalCache,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
) -> std::result::Result<SyncReport, FetchError> {
    let namespace = namespace_or_default(namespace);
    let capability = pipeline.resolve_one(namespace, name, cancel).await?;
    let mut report = SyncReport::default();
    report.store(cache, capability);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsync_core::CapabilityClass;
    use tempfile::TempDir;

    fn capability(name: &str, template: &str) -> Capability {
        Capability {
            name: name.to_string(),
            namespace: "vela-system".to_string(),
            class: CapabilityClass::WorkloadDefining,
            backing_reference: String::new(),
            api_identity: None,
            description: String::new(),
            template: template.to_string(),
            template_uri: None,
            parameters: Vec::new(),
            install_source: None,
        }
    }

    #[test]
    fn write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path().join("caps"));

        let outcome = cache.write(&capability("webservice", "parameter: {}")).unwrap();

        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(
            cache.read_template("webservice").unwrap().as_deref(),
            Some("parameter: {}")
        );
        assert!(dir.path().join("caps/webservice.cue").exists());
    }

    #[test]
    fn identical_content_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());

        cache.write(&capability("worker", "a: 1")).unwrap();
        assert_eq!(
            cache.write(&capability("worker", "a: 1")).unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            cache.write(&capability("worker", "a: 2")).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(cache.read_template("worker").unwrap().as_deref(), Some("a: 2"));
    }

    #[test]
    fn missing_template_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());
        assert_eq!(cache.read_template("nothing").unwrap(), None);
        assert!(cache.list_names().unwrap().is_empty());
    }

    #[test]
    fn lists_cached_names_sorted_without_temp_files() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());
        cache.write(&capability("worker", "a: 1")).unwrap();
        cache.write(&capability("ingress", "b: 1")).unwrap();
        fs::write(dir.path().join(".worker.cue.1.tmp"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(cache.list_names().unwrap(), ["ingress", "worker"]);
    }

    #[test]
    fn file_stems_escape_unsafe_bytes() {
        assert_eq!(file_stem("my-trait.v2"), "my-trait.v2");
        assert_eq!(file_stem("../etc/passwd"), "_2e._2fetc_2fpasswd");
        assert_eq!(file_stem(".."), "_2e.");
        assert_eq!(file_stem("Web"), "_57eb");
        assert_eq!(file_stem(""), "_");
    }

    #[test]
    fn distinct_names_get_distinct_files() {
        let names = ["a/b", "a_b", "a_2fb", "A", "_41", "", "_", ".x", "_2ex", "caf\u{e9}"];
        let stems: std::collections::HashSet<_> = names.iter().map(|n| file_stem(n)).collect();
        assert_eq!(stems.len(), names.len());
        for name in names {
            assert_eq!(name_from_stem(&file_stem(name)).as_deref(), Some(name));
        }
    }

    #[test]
    fn foreign_stems_are_not_names() {
        assert_eq!(name_from_stem("a_zz"), None);
        assert_eq!(name_from_stem("a_2"), None);
        assert_eq!(name_from_stem(".worker"), None);
        assert_eq!(name_from_stem("Worker"), None);
    }

    #[test]
    fn listed_names_decode_escaped_stems() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());
        cache.write(&capability("a/b", "a: 1")).unwrap();
        cache.write(&capability("a_b", "a: 2")).unwrap();

        assert_eq!(cache.list_names().unwrap(), ["a/b", "a_b"]);
        assert_eq!(cache.read_template("a/b").unwrap().as_deref(), Some("a: 1"));
        assert_eq!(cache.read_template("a_b").unwrap().as_deref(), Some("a: 2"));
    }

    #[test]
    fn failed_cache_write_becomes_warning() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a directory").unwrap();
        let cache = LocalCache::new(&blocker);

        let mut report = SyncReport::default();
        report.store(&cache, capability("worker", "a: 1"));

        assert_eq!(report.capabilities.len(), 1);
        assert_eq!(report.written, 0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("WARN: failed to cache template of 'worker'"));
    }
}
