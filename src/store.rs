use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::model::{InvoiceRecord, InvoiceStatus};

/// Persistence collaborator consumed by the pipeline and the CLI.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn fetch_invoice(&self, id: &str) -> Result<InvoiceRecord, StoreError>;

    /// Idempotent.
    async fn mark_pdf_generated(&self, id: &str) -> Result<(), StoreError>;

    async fn update_invoice_status(&self, id: &str, status: InvoiceStatus) -> Result<(), StoreError>;

    async fn list_invoices(&self) -> Result<Vec<InvoiceRecord>, StoreError>;
}

/// One `<id>.toml` file per invoice under `<data_root>/data/invoices`.
#[derive(Debug, Clone)]
pub struct TomlStore {
    dir: PathBuf,
}

impl TomlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        TomlStore { dir: dir.into() }
    }

    pub fn under_root(root: &Path) -> Self {
        Self::new(root.join("data").join("invoices"))
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.toml", id)))
    }

    async fn read(&self, path: &Path) -> Result<InvoiceRecord, StoreError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn save_invoice(&self, record: &InvoiceRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let toml_str = toml::to_string_pretty(record)?;
        tokio::fs::write(&path, toml_str)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn update<F>(&self, id: &str, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut InvoiceRecord) + Send,
    {
        let mut record = self.fetch_invoice(id).await?;
        change(&mut record);
        self.save_invoice(&record).await
    }
}

#[async_trait]
impl InvoiceStore for TomlStore {
    async fn fetch_invoice(&self, id: &str) -> Result<InvoiceRecord, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.read(&path).await
    }

    async fn mark_pdf_generated(&self, id: &str) -> Result<(), StoreError> {
        debug!("marking {} as generated", id);
        self.update(id, |r| r.pdf_generated = true).await
    }

    async fn update_invoice_status(&self, id: &str, status: InvoiceStatus) -> Result<(), StoreError> {
        self.update(id, |r| r.status = status).await
    }

    async fn list_invoices(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "toml") {
                records.push(self.read(&path).await?);
            }
        }
        records.sort_by(|a, b| b.issue_date.cmp(&a.issue_date).then_with(|| a.invoice_number.cmp(&b.invoice_number)));
        Ok(records)
    }
}
