//! Resource synchronization barrier.
//!
//! Every image gets its own race between loading and a ceiling timer; fonts
//! get one shared ceiling. The barrier never fails: a missing asset leaves an
//! empty slot in the document and a warning in the log.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;

use crate::error::ResourceError;
use crate::surface::RenderSurface;

#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load_image(&self, src: &str) -> Result<Vec<u8>, ResourceError>;

    /// Resolves once every font is usable.
    async fn fonts_ready(&self, fonts: &[String]) -> Result<(), ResourceError>;
}

/// Loads local paths, `http(s)` URLs and `data:` URIs.
pub struct StandardLoader {
    base_dir: PathBuf,
    client: reqwest::Client,
}

impl StandardLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        StandardLoader {
            base_dir: base_dir.into(),
            client: reqwest::Client::new(),
        }
    }

    fn resolve(&self, src: &str) -> PathBuf {
        let path = Path::new(src);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    async fn read(&self, src: &str) -> Result<Vec<u8>, ResourceError> {
        let path = self.resolve(src);
        tokio::fs::read(&path)
            .await
            .map_err(|e| ResourceError::Io(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl ResourceLoader for StandardLoader {
    async fn load_image(&self, src: &str) -> Result<Vec<u8>, ResourceError> {
        if src.starts_with("data:") {
            return decode_data_uri(src);
        }
        if src.starts_with("http://") || src.starts_with("https://") {
            let response = self
                .client
                .get(src)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| ResourceError::Http(e.to_string()))?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ResourceError::Http(e.to_string()))?;
            return Ok(bytes.to_vec());
        }
        self.read(src).await
    }

    async fn fonts_ready(&self, fonts: &[String]) -> Result<(), ResourceError> {
        for font in fonts {
            let bytes = self.read(font).await?;
            if !looks_like_font(&bytes) {
                return Err(ResourceError::NotAFont);
            }
        }
        Ok(())
    }
}

pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, ResourceError> {
    let rest = uri.strip_prefix("data:").ok_or(ResourceError::BadDataUri)?;
    let (meta, payload) = rest.split_once(',').ok_or(ResourceError::BadDataUri)?;
    if meta.ends_with(";base64") {
        STANDARD
            .decode(payload.trim())
            .map_err(|_| ResourceError::BadDataUri)
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

fn looks_like_font(bytes: &[u8]) -> bool {
    matches!(
        bytes.get(..4),
        Some([0x00, 0x01, 0x00, 0x00]) | Some(b"OTTO") | Some(b"true") | Some(b"ttcf") | Some(b"wOFF") | Some(b"wOF2")
    )
}

#[derive(Debug, Clone)]
pub enum ResourceOutcome {
    Loaded,
    Failed(ResourceError),
    TimedOut,
}

impl ResourceOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ResourceOutcome::Loaded)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BarrierReport {
    pub images: Vec<(String, ResourceOutcome)>,
    /// `None` when the document uses no custom fonts.
    pub fonts: Option<ResourceOutcome>,
}

impl BarrierReport {
    pub fn soft_failures(&self) -> usize {
        let images = self.images.iter().filter(|(_, o)| !o.is_loaded()).count();
        let fonts = self.fonts.as_ref().map_or(0, |o| usize::from(!o.is_loaded()));
        images + fonts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceBarrier {
    pub image_timeout: Duration,
    pub font_timeout: Duration,
}

impl ResourceBarrier {
    pub fn new(image_timeout: Duration, font_timeout: Duration) -> Self {
        ResourceBarrier {
            image_timeout,
            font_timeout,
        }
    }

    /// Resolves every asset the surface references and attaches what loaded.
    pub async fn settle(&self, surface: &mut RenderSurface, loader: &dyn ResourceLoader) -> BarrierReport {
        let image_refs = surface.image_refs();
        let font_refs = surface.font_refs();

        let images = join_all(image_refs.iter().map(|src| async move {
            let result = timeout(self.image_timeout, loader.load_image(src)).await;
            (src.clone(), result)
        }));
        let fonts = async {
            if font_refs.is_empty() {
                return None;
            }
            Some(timeout(self.font_timeout, loader.fonts_ready(&font_refs)).await)
        };
        let (images, fonts) = futures::join!(images, fonts);

        let mut report = BarrierReport::default();
        for (src, result) in images {
            let outcome = match result {
                Ok(Ok(bytes)) => {
                    debug!("image ready: {} ({} bytes)", src, bytes.len());
                    surface.attach_image(&src, bytes);
                    ResourceOutcome::Loaded
                }
                Ok(Err(e)) => {
                    warn!("image {} failed to load, continuing without it: {}", src, e);
                    ResourceOutcome::Failed(e)
                }
                Err(_) => {
                    warn!(
                        "image {} not ready after {:?}, continuing without it",
                        src, self.image_timeout
                    );
                    ResourceOutcome::TimedOut
                }
            };
            report.images.push((src, outcome));
        }

        report.fonts = fonts.map(|result| match result {
            Ok(Ok(())) => ResourceOutcome::Loaded,
            Ok(Err(e)) => {
                warn!("fonts failed to load, falling back to built-in faces: {}", e);
                ResourceOutcome::Failed(e)
            }
            Err(_) => {
                warn!("fonts not ready after {:?}, proceeding", self.font_timeout);
                ResourceOutcome::TimedOut
            }
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentModel, PageGeometry};
    use crate::model::{ClientInfo, InvoiceRecord, InvoiceStatus, LineItem, SenderConfig};
    use crate::surface::SurfaceRegistry;
    use chrono::NaiveDate;
    use tokio::time::Instant;

    struct ScriptedLoader {
        image_delay: Option<Duration>,
        fonts_delay: Option<Duration>,
    }

    #[async_trait]
    impl ResourceLoader for ScriptedLoader {
        async fn load_image(&self, src: &str) -> Result<Vec<u8>, ResourceError> {
            match self.image_delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(src.as_bytes().to_vec())
                }
                None => futures::future::pending().await,
            }
        }

        async fn fonts_ready(&self, _fonts: &[String]) -> Result<(), ResourceError> {
            match self.fonts_delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                None => Err(ResourceError::NotAFont),
            }
        }
    }

    fn painted_surface(registry: &SurfaceRegistry, logo: Option<&str>, fonts: Vec<String>) -> RenderSurface {
        let record = InvoiceRecord {
            id: "inv-2".into(),
            invoice_number: "VDL-2024-002".into(),
            issue_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            client: ClientInfo {
                name: Some("Jo".into()),
                ..Default::default()
            },
            custom_fields: Default::default(),
            line_items: vec![LineItem {
                number: None,
                description: "Rush fee".into(),
                quantity: 1.0,
                rate: 25.0,
            }],
            pdf_generated: false,
            status: InvoiceStatus::Sent,
        };
        let sender = SenderConfig {
            name: "Acme".into(),
            logo: logo.map(String::from),
            fonts,
            ..Default::default()
        };
        let model = DocumentModel::build(&record, &sender, PageGeometry::letter(36.0)).unwrap();
        let mut surface = registry.mount("inv-2");
        surface.paint(&model);
        surface
    }

    fn barrier() -> ResourceBarrier {
        ResourceBarrier::new(Duration::from_secs(5), Duration::from_secs(3))
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_image_releases_at_its_ceiling() {
        let registry = SurfaceRegistry::new();
        let mut surface = painted_surface(&registry, Some("logo.png"), vec![]);
        let loader = ScriptedLoader {
            image_delay: None,
            fonts_delay: None,
        };
        let start = Instant::now();
        let report = barrier().settle(&mut surface, &loader).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5_050));
        assert!(matches!(report.images[0].1, ResourceOutcome::TimedOut));
        assert!(report.fonts.is_none());
        assert_eq!(report.soft_failures(), 1);
        assert!(surface.snapshot().unwrap().images.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loaded_image_is_attached_without_waiting_for_ceiling() {
        let registry = SurfaceRegistry::new();
        let mut surface = painted_surface(&registry, Some("logo.png"), vec![]);
        let loader = ScriptedLoader {
            image_delay: Some(Duration::from_millis(200)),
            fonts_delay: None,
        };
        let start = Instant::now();
        let report = barrier().settle(&mut surface, &loader).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(report.soft_failures(), 0);
        assert_eq!(surface.snapshot().unwrap().images["logo.png"], b"logo.png".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fonts_are_bounded_separately() {
        let registry = SurfaceRegistry::new();
        let mut surface = painted_surface(&registry, None, vec!["brand.ttf".into()]);
        let loader = ScriptedLoader {
            image_delay: Some(Duration::ZERO),
            fonts_delay: Some(Duration::from_secs(60)),
        };
        let start = Instant::now();
        let report = barrier().settle(&mut surface, &loader).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3_050));
        assert!(matches!(report.fonts, Some(ResourceOutcome::TimedOut)));
    }

    #[tokio::test]
    async fn font_errors_are_soft() {
        let registry = SurfaceRegistry::new();
        let mut surface = painted_surface(&registry, None, vec!["brand.ttf".into()]);
        let loader = ScriptedLoader {
            image_delay: Some(Duration::ZERO),
            fonts_delay: None,
        };
        let report = barrier().settle(&mut surface, &loader).await;
        assert!(matches!(report.fonts, Some(ResourceOutcome::Failed(ResourceError::NotAFont))));
    }

    #[tokio::test]
    async fn standard_loader_reads_files_and_data_uris() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("logo.png"), [1u8, 2, 3]).unwrap();
        std::fs::write(dir.path().join("brand.ttf"), [0u8, 1, 0, 0, 9, 9]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        let loader = StandardLoader::new(dir.path());

        assert_eq!(loader.load_image("logo.png").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(loader.load_image("data:image/png;base64,AQID").await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(loader.load_image("missing.png").await, Err(ResourceError::Io(_))));
        assert!(loader.fonts_ready(&["brand.ttf".into()]).await.is_ok());
        assert!(matches!(
            loader.fonts_ready(&["notes.txt".into()]).await,
            Err(ResourceError::NotAFont)
        ));
    }

    #[test]
    fn malformed_data_uri_is_rejected() {
        assert!(matches!(decode_data_uri("data:image/png;base64"), Err(ResourceError::BadDataUri)));
        assert!(matches!(decode_data_uri("data:;base64,@@@"), Err(ResourceError::BadDataUri)));
        assert_eq!(decode_data_uri("data:text/plain,hi").unwrap(), b"hi".to_vec());
    }
}
