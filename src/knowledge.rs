use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

use crate::types::KnowledgeDocument;

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("knowledge store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize knowledge store: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("refusing to overwrite unreadable knowledge store {path}; it could not be backed up")]
    Unrecoverable { path: PathBuf },
}

/// Aggregate figures over the stored documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeSummary {
    pub document_count: usize,
    pub total_characters: usize,
    pub avg_doc_length: usize,
    pub last_updated: String,
}

/// JSON-array backed document store, rewritten in full on every change.
#[derive(Debug)]
pub struct KnowledgeStore {
    path: PathBuf,
    documents: Vec<KnowledgeDocument>,
    /// Set when an unreadable file is still in place at `path`.
    unrecoverable: bool,
}

impl KnowledgeStore {
    /// Load `path`. A missing file is an empty store. An unreadable or invalid one is moved
    /// aside to `<name>.bak` and the store starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loaded = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<Vec<KnowledgeDocument>>(text.trim_start_matches('\u{feff}')) {
                Ok(docs) => {
                    info!("Loaded {} knowledge documents from {}", docs.len(), path.display());
                    Some(docs)
                }
                Err(e) => {
                    error!("Knowledge store {} is not a valid document list: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No knowledge store at {}, starting empty", path.display());
                Some(Vec::new())
            }
            Err(e) => {
                error!("Failed to read knowledge store {}: {}", path.display(), e);
                None
            }
        };
        match loaded {
            Some(documents) => Self { path, documents, unrecoverable: false },
            None => {
                let unrecoverable = !back_up(&path).await;
                Self { path, documents: Vec::new(), unrecoverable }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn documents(&self) -> &[KnowledgeDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Insert or replace the document with the same `filename`, stamp `added_at`, then persist.
    pub async fn upsert(&mut self, mut doc: KnowledgeDocument) -> Result<(), KnowledgeError> {
        doc.added_at = Local::now().to_rfc3339();
        match self.documents.iter_mut().find(|d| d.filename == doc.filename) {
            Some(existing) => {
                info!("Updated knowledge document {}", doc.filename);
                *existing = doc;
            }
            None => {
                info!("Added knowledge document {}", doc.filename);
                self.documents.push(doc);
            }
        }
        self.save().await
    }

    async fn save(&self) -> Result<(), KnowledgeError> {
        if self.unrecoverable {
            return Err(KnowledgeError::Unrecoverable { path: self.path.clone() });
        }
        write_documents(&self.path, &self.documents).await
    }

    /// Write a copy of the store to `target`.
    pub async fn export_to(&self, target: &Path) -> Result<PathBuf, KnowledgeError> {
        write_documents(target, &self.documents).await?;
        info!("Exported knowledge store to {}", target.display());
        Ok(target.to_path_buf())
    }

    /// Raw text of every document, concatenated, for use as prompt context.
    pub fn combined_text(&self) -> String {
        self.documents
            .iter()
            .map(|d| format!("## {}\n{}", d.filename, d.knowledge.extracted_knowledge))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn summary(&self) -> KnowledgeSummary {
        let document_count = self.documents.len();
        let total_characters: usize =
            self.documents.iter().map(|d| d.knowledge.extracted_knowledge.chars().count()).sum();
        KnowledgeSummary {
            document_count,
            total_characters,
            avg_doc_length: total_characters.checked_div(document_count).unwrap_or(0),
            last_updated: Local::now().to_rfc3339(),
        }
    }
}

/// Path the unreadable store at `path` is moved to.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

/// Move `path` aside so the next save cannot destroy it. Returns whether it was moved.
async fn back_up(path: &Path) -> bool {
    let target = backup_path(path);
    match fs::rename(path, &target).await {
        Ok(()) => {
            warn!("Moved unreadable knowledge store {} to {}", path.display(), target.display());
            true
        }
        Err(e) => {
            error!("Failed to back up knowledge store {}: {}", path.display(), e);
            false
        }
    }
}

async fn write_documents(path: &Path, documents: &[KnowledgeDocument]) -> Result<(), KnowledgeError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| KnowledgeError::Io { path: parent.to_path_buf(), source })?;
    }
    let pretty = serde_json::to_string_pretty(documents)?;
    fs::write(path, pretty).await.map_err(|source| {
        warn!("Failed to write knowledge store {}: {}", path.display(), source);
        KnowledgeError::Io { path: path.to_path_buf(), source }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtractedKnowledge;

    fn doc(filename: &str, text: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            filename: filename.to_string(),
            knowledge: ExtractedKnowledge {
                extracted_knowledge: text.to_string(),
                filename: filename.to_string(),
                timestamp: "2024-01-01T00:00:00".to_string(),
            },
            processed_at: String::new(),
            added_at: String::new(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path().join("kb.json")).await;
        assert!(store.is_empty());
        assert_eq!(store.summary().avg_doc_length, 0);
    }

    #[tokio::test]
    async fn upsert_same_filename_keeps_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        let mut store = KnowledgeStore::open(&path).await;
        store.upsert(doc("a.csv", "first")).await.unwrap();
        store.upsert(doc("a.csv", "second")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.documents()[0].knowledge.extracted_knowledge, "second");
        assert!(!store.documents()[0].added_at.is_empty());

        let reloaded = KnowledgeStore::open(&path).await;
        assert_eq!(reloaded.documents(), store.documents());
    }

    #[tokio::test]
    async fn invalid_file_loads_empty_and_bom_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(KnowledgeStore::open(&bad).await.is_empty());
        assert!(!bad.exists());

        let bom = dir.path().join("bom.json");
        let body = serde_json::to_string(&vec![doc("x.csv", "abc")]).unwrap();
        std::fs::write(&bom, format!("\u{feff}{}", body)).unwrap();
        assert_eq!(KnowledgeStore::open(&bom).await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_store_is_backed_up_before_the_first_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge_base.json");
        std::fs::write(&path, "[{\"filename\": truncated").unwrap();

        let mut store = KnowledgeStore::open(&path).await;
        assert!(store.is_empty());
        store.upsert(doc("a.csv", "new")).await.unwrap();

        let backup = backup_path(&path);
        assert_eq!(backup, dir.path().join("knowledge_base.json.bak"));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "[{\"filename\": truncated");
        assert_eq!(KnowledgeStore::open(&path).await.len(), 1);
    }

    #[tokio::test]
    async fn store_that_cannot_be_backed_up_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(&path, "garbage").unwrap();
        // A directory in the way makes the rename fail.
        let blocker = backup_path(&path);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();

        let mut store = KnowledgeStore::open(&path).await;
        let err = store.upsert(doc("a.csv", "new")).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Unrecoverable { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "garbage");
    }

    #[tokio::test]
    async fn summary_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KnowledgeStore::open(dir.path().join("kb.json")).await;
        store.upsert(doc("a.csv", "abcd")).await.unwrap();
        store.upsert(doc("b.csv", "应收账款")).await.unwrap();
        let summary = store.summary();
        assert_eq!(summary.document_count, 2);
        assert_eq!(summary.total_characters, 8);
        assert_eq!(summary.avg_doc_length, 4);

        let target = dir.path().join("export").join("copy.json");
        store.export_to(&target).await.unwrap();
        assert_eq!(KnowledgeStore::open(&target).await.len(), 2);
        assert!(store.combined_text().contains("## b.csv\n应收账款"));
    }
}
