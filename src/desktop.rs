//! Delivery host for the command line: files on disk, opened with the system viewer.

use async_trait::async_trait;
use chrono::{Datelike, Local};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tera::{Context, Tera};

use crate::delivery::{DeliveryHost, DeliveryTarget};
use crate::error::TargetError;
use crate::lifecycle::EMBEDDED_VIEW_HINT;
use crate::raster::Artifact;

const VIEWER_TEMPLATE: &str = include_str!("../templates/viewer.html.tera");

pub struct DesktopHost {
    output_root: PathBuf,
    open_files: bool,
    tera: Arc<Tera>,
}

impl DesktopHost {
    pub fn new(output_root: impl Into<PathBuf>, open_files: bool) -> Result<Self, TargetError> {
        let mut tera = Tera::default();
        tera.add_raw_template("viewer.html", VIEWER_TEMPLATE)?;
        Ok(DesktopHost {
            output_root: output_root.into(),
            open_files,
            tera: Arc::new(tera),
        })
    }

    /// `<data_root>/output`
    pub fn under_root(root: &Path, open_files: bool) -> Result<Self, TargetError> {
        Self::new(root.join("output"), open_files)
    }

    pub fn download_path(&self, filename: &str) -> PathBuf {
        self.output_root
            .join(Local::now().year().to_string())
            .join(filename)
    }

    pub fn viewer_dir(&self) -> PathBuf {
        self.output_root.join(".viewer")
    }
}

#[async_trait]
impl DeliveryHost for DesktopHost {
    async fn save_download(&self, filename: &str, bytes: &[u8]) -> Result<(), TargetError> {
        let path = self.download_path(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        info!("saved {}", path.display());
        if self.open_files {
            open_and_reveal(&path);
        }
        Ok(())
    }

    fn acquire_target(&self, invoice_number: &str) -> Result<Box<dyn DeliveryTarget>, TargetError> {
        let dir = self.viewer_dir();
        fs::create_dir_all(&dir).map_err(|e| TargetError::Blocked(e.to_string()))?;
        let path = dir.join(format!("{}.html", invoice_number));

        let mut context = Context::new();
        context.insert("invoice_number", invoice_number);
        context.insert("data_uri", &None::<String>);
        let placeholder = self.tera.render("viewer.html", &context)?;
        fs::write(&path, placeholder).map_err(|e| TargetError::Blocked(e.to_string()))?;
        debug!("reserved viewer {}", path.display());

        if self.open_files {
            open_file(&path);
        }
        Ok(Box::new(ViewerTarget {
            path,
            invoice_number: invoice_number.to_string(),
            tera: Arc::clone(&self.tera),
            delivered: false,
        }))
    }

    async fn navigate(&self, artifact: &Artifact) -> Result<(), TargetError> {
        let dir = self.viewer_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&artifact.filename);
        let bytes = artifact
            .to_bytes()
            .map_err(|e| TargetError::Blocked(e.to_string()))?;
        tokio::fs::write(&path, bytes).await?;
        info!("opening {} directly", path.display());
        if self.open_files {
            open_file(&path);
        }
        Ok(())
    }
}

/// A viewer page on disk. Deleting the file counts as the user closing it.
/// A page dropped before anything was injected is removed with it.
pub struct ViewerTarget {
    path: PathBuf,
    invoice_number: String,
    tera: Arc<Tera>,
    delivered: bool,
}

impl ViewerTarget {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeliveryTarget for ViewerTarget {
    fn is_closed(&self) -> bool {
        !self.path.exists()
    }

    async fn inject(&mut self, artifact: &Artifact) -> Result<(), TargetError> {
        if self.is_closed() {
            return Err(TargetError::Closed);
        }
        let mut context = Context::new();
        context.insert("invoice_number", &self.invoice_number);
        context.insert("filename", &artifact.filename);
        context.insert("data_uri", &Some(artifact.data_uri()));
        context.insert("hint", EMBEDDED_VIEW_HINT);
        let page = self.tera.render("viewer.html", &context)?;
        tokio::fs::write(&self.path, page).await?;
        self.delivered = true;
        debug!("injected {} into {}", artifact.filename, self.path.display());
        Ok(())
    }

    fn close(&mut self) {
        if fs::remove_file(&self.path).is_ok() {
            debug!("closed viewer {}", self.path.display());
        }
    }
}

impl Drop for ViewerTarget {
    fn drop(&mut self) {
        if !self.delivered {
            self.close();
        }
    }
}

fn open_file(path: &Path) {
    #[cfg(target_os = "macos")]
    Command::new("open").arg(path).spawn().ok();

    #[cfg(target_os = "windows")]
    Command::new("explorer").arg(path).spawn().ok();

    #[cfg(target_os = "linux")]
    Command::new("xdg-open").arg(path).spawn().ok();
}

// Reveal in Finder/Explorer, then open.
fn open_and_reveal(path: &Path) {
    #[cfg(target_os = "macos")]
    Command::new("open").arg("-R").arg(path).spawn().ok();

    #[cfg(target_os = "windows")]
    Command::new("explorer")
        .arg(format!("/select,{}", path.to_string_lossy()))
        .spawn()
        .ok();

    #[cfg(target_os = "linux")]
    {
        if let Some(parent) = path.parent() {
            Command::new("xdg-open").arg(parent).spawn().ok();
        }
    }

    open_file(path);
}
