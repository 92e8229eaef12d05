//! Failure handling for merges that cannot complete.
//!
//! The offline document is captured so the user can keep a copy of their
//! work, optionally written to an export directory as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use quire_core::Document;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_TITLE_CHARS: usize = 255;

/// A copy of the local document taken before it is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineExport {
    pub id: Uuid,
    pub title: String,
    pub content: serde_json::Value,
    pub version: u64,
    pub updated: DateTime<Utc>,
}

impl OfflineExport {
    /// Capture a document. The title is the first block's text, cut to
    /// 255 characters.
    pub fn capture(id: Uuid, doc: &Document, version: u64) -> Self {
        let title: String = doc.first_block_text().chars().take(MAX_TITLE_CHARS).collect();
        Self {
            id,
            title,
            content: doc.to_json(),
            version,
            updated: Utc::now(),
        }
    }

    /// Unique per call, so repeated exports of one version are all kept.
    fn file_name(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}-v{}-{}-{}.json",
            self.id,
            self.version,
            self.updated.format("%Y%m%dT%H%M%S%.6f"),
            &suffix[..8]
        )
    }
}

/// Captures and stores offline documents.
#[derive(Debug, Clone, Default)]
pub struct FailureHandler {
    export_dir: Option<PathBuf>,
}

impl FailureHandler {
    pub fn new(export_dir: Option<PathBuf>) -> Self {
        Self { export_dir }
    }

    pub fn export_dir(&self) -> Option<&Path> {
        self.export_dir.as_deref()
    }

    /// A merge failed: capture the offline document and log the failure.
    pub fn merge_failed(&self, id: Uuid, doc: &Document, version: u64, reason: &str) -> OfflineExport {
        let export = OfflineExport::capture(id, doc, version);
        error!(
            "Merge of offline changes to document {} failed at version {}: {}",
            id, version, reason
        );
        self.write(&export);
        export
    }

    /// Local and remote edits overlap and the server side was kept.
    pub fn conflict(&self, id: Uuid, doc: &Document, version: u64, conflicts: usize) -> OfflineExport {
        let export = OfflineExport::capture(id, doc, version);
        warn!(
            "{} conflicting edits on document {}; keeping the server version, offline copy exported",
            conflicts, id
        );
        self.write(&export);
        export
    }

    fn write(&self, export: &OfflineExport) -> Option<PathBuf> {
        let dir = self.export_dir.as_ref()?;
        let path = dir.join(export.file_name());
        let result = fs::create_dir_all(dir).and_then(|_| {
            let json = serde_json::to_vec_pretty(export)?;
            fs::write(&path, json)
        });
        match result {
            Ok(()) => {
                info!("Offline document written to {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("Failed to write offline document to {}: {}", path.display(), e);
                None
            }
        }
    }
}
