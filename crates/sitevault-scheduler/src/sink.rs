use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::types::{SinkKind, SinkRef};

#[derive(Debug, Error)]
pub enum SinkError {
    /// No adapter for this provider, or the sink's credentials are unusable.
    #[error("{kind} sink unavailable: {reason}")]
    Unavailable { kind: SinkKind, reason: String },

    #[error("invalid artifact location {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability to remove stored backup artifacts.
///
/// Upload happens inside the producer; the orchestration core only ever
/// deletes, when retention prunes a job.
#[async_trait]
pub trait StorageSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Remove the artifact at `location`. Removing something already gone
    /// succeeds.
    async fn delete(&self, location: &str) -> Result<(), SinkError>;
}

/// Turns a stored sink row into a live adapter.
pub trait SinkResolver: Send + Sync {
    fn resolve(&self, sink: &SinkRef) -> Arc<dyn StorageSink>;
}

/// Artifacts on the local filesystem under `root`.
///
/// Sink credentials: `{"root": "/var/backups/sitevault"}`.
#[derive(Debug, Clone)]
pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_credentials(credentials: &serde_json::Value) -> Result<Self, SinkError> {
        let root = credentials
            .get("root")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SinkError::Unavailable {
                kind: SinkKind::Local,
                reason: "credentials must contain a non-empty \"root\" path".to_string(),
            })?;
        Ok(Self::new(root))
    }

    /// Map `location` to an entry strictly below `root`.
    ///
    /// The root itself is never a valid target, nor is anything that leaves it.
    fn resolve_path(&self, location: &str) -> Result<PathBuf, SinkError> {
        let invalid = |reason: &str| SinkError::InvalidLocation {
            location: location.to_string(),
            reason: reason.to_string(),
        };
        if location.is_empty() {
            return Err(invalid("empty location"));
        }
        let path = Path::new(location);
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| invalid("outside the sink root"))?
        } else {
            path
        };

        let mut named = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(_) => named += 1,
                Component::ParentDir => return Err(invalid("must not contain '..'")),
                Component::CurDir => return Err(invalid("must not contain '.'")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("outside the sink root"))
                }
            }
        }
        if named == 0 {
            return Err(invalid("must name an entry below the sink root"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageSink for LocalSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Local
    }

    async fn delete(&self, location: &str) -> Result<(), SinkError> {
        let path = self.resolve_path(location)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "artifact already absent");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        debug!(path = %path.display(), "artifact removed");
        Ok(())
    }
}

/// Stand-in for providers without an adapter in this process (or with bad
/// credentials). Every delete fails, so retention marks the job orphaned.
#[derive(Debug, Clone)]
pub struct UnavailableSink {
    kind: SinkKind,
    reason: String,
}

impl UnavailableSink {
    pub fn new(kind: SinkKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl StorageSink for UnavailableSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn delete(&self, _location: &str) -> Result<(), SinkError> {
        Err(SinkError::Unavailable {
            kind: self.kind,
            reason: self.reason.clone(),
        })
    }
}

/// Resolves `local` sinks to [`LocalSink`]; everything else is unavailable.
#[derive(Debug, Default, Clone)]
pub struct DefaultSinkResolver;

impl SinkResolver for DefaultSinkResolver {
    fn resolve(&self, sink: &SinkRef) -> Arc<dyn StorageSink> {
        match sink.kind {
            SinkKind::Local => match LocalSink::from_credentials(&sink.credentials) {
                Ok(local) => Arc::new(local),
                Err(e) => Arc::new(UnavailableSink::new(SinkKind::Local, e.to_string())),
            },
            other => Arc::new(UnavailableSink::new(
                other,
                format!("no {other} adapter in this process"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn local_delete_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.zip"), b"data").expect("write");
        let sink = LocalSink::new(dir.path());

        sink.delete("a.zip").await.expect("delete");
        assert!(!dir.path().join("a.zip").exists());
        sink.delete("a.zip").await.expect("second delete");
    }

    #[tokio::test]
    async fn local_delete_removes_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("run-1/uploads")).expect("mkdir");
        fs::write(dir.path().join("run-1/uploads/x"), b"x").expect("write");
        let sink = LocalSink::new(dir.path());
        let abs = dir.path().join("run-1");

        sink.delete(abs.to_str().unwrap()).await.expect("delete");
        assert!(!abs.exists());
    }

    #[tokio::test]
    async fn local_refuses_escaping_locations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = LocalSink::new(dir.path().join("root"));
        assert!(matches!(
            sink.delete("../etc/passwd").await,
            Err(SinkError::InvalidLocation { .. })
        ));
        assert!(matches!(
            sink.delete("/etc/passwd").await,
            Err(SinkError::InvalidLocation { .. })
        ));
    }

    #[tokio::test]
    async fn local_never_deletes_the_root_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("root");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("other-job.zip"), b"keep").expect("write");
        let sink = LocalSink::new(&root);

        let root_str = root.to_str().unwrap().to_string();
        let with_slash = format!("{root_str}/");
        let dotted = format!("{root_str}/.");
        let refused = [
            ".",
            "./",
            "./other-job.zip",
            root_str.as_str(),
            with_slash.as_str(),
            dotted.as_str(),
        ];
        for location in refused {
            assert!(
                matches!(
                    sink.delete(location).await,
                    Err(SinkError::InvalidLocation { .. })
                ),
                "{location:?} should be refused"
            );
        }
        assert!(root.join("other-job.zip").exists());
        assert!(root.exists());

        sink.delete("other-job.zip").await.expect("delete");
        assert!(!root.join("other-job.zip").exists());
    }

    #[tokio::test]
    async fn resolver_maps_kinds() {
        let now = chrono::Utc::now();
        let mut sink = SinkRef {
            id: "k1".into(),
            kind: SinkKind::Dropbox,
            credentials: serde_json::json!({}),
            quota_bytes: None,
            created_at: now,
        };
        let resolved = DefaultSinkResolver.resolve(&sink);
        assert_eq!(resolved.kind(), SinkKind::Dropbox);
        assert!(resolved.delete("x").await.is_err());

        sink.kind = SinkKind::Local;
        sink.credentials = serde_json::json!({"root": "/tmp/sitevault-test"});
        assert_eq!(DefaultSinkResolver.resolve(&sink).kind(), SinkKind::Local);
    }
}
