//! PDF conversion of a settled render surface.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::ImageError;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use log::{debug, info, warn};
use lopdf::{Dictionary, Document, Object, Stream, dictionary};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tera::{Context, Tera};

use crate::config::PipelineConfig;
use crate::document::{
    COL_AMOUNT, COL_NUMBER, COL_QUANTITY, COL_RATE, PageGeometry, format_currency, format_quantity,
};
use crate::error::{ConversionError, GenerationError};
use crate::model::InvoiceStatus;
use crate::platform::PlatformClass;
use crate::surface::{DrawOp, SurfaceSnapshot};

const TYPST_TEMPLATE: &str = include_str!("../templates/invoice.typ.tera");

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterOptions {
    pub geometry: PageGeometry,
    /// JPEG quality for embedded images, 0.0 to 1.0.
    pub image_quality: f32,
    /// Pixels per point for embedded images.
    pub scale: f32,
}

impl RasterOptions {
    pub fn for_platform(class: PlatformClass, config: &PipelineConfig) -> Self {
        RasterOptions {
            geometry: PageGeometry::letter(config.margin_pt),
            image_quality: config.image_quality,
            scale: class.scale_factor(config),
        }
    }

    fn jpeg_quality(&self) -> u8 {
        (self.image_quality * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactBody {
    /// Raw PDF bytes, for direct download.
    Binary(Vec<u8>),
    /// `data:application/pdf;base64,...`, for embedding in a viewer.
    Embeddable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub body: ArtifactBody,
}

impl Artifact {
    pub fn new(filename: String, pdf: Vec<u8>, class: PlatformClass) -> Self {
        let body = match class {
            PlatformClass::Unrestricted => ArtifactBody::Binary(pdf),
            PlatformClass::Restricted => ArtifactBody::Embeddable(pdf_data_uri(&pdf)),
        };
        Artifact { filename, body }
    }

    pub fn data_uri(&self) -> String {
        match &self.body {
            ArtifactBody::Binary(bytes) => pdf_data_uri(bytes),
            ArtifactBody::Embeddable(uri) => uri.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConversionError> {
        match &self.body {
            ArtifactBody::Binary(bytes) => Ok(bytes.clone()),
            ArtifactBody::Embeddable(uri) => uri
                .split_once(',')
                .and_then(|(_, payload)| STANDARD.decode(payload).ok())
                .ok_or_else(|| ConversionError::Pdf("artifact is not a base64 data URI".into())),
        }
    }
}

pub fn pdf_data_uri(bytes: &[u8]) -> String {
    format!("data:application/pdf;base64,{}", STANDARD.encode(bytes))
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, surface: &SurfaceSnapshot, options: &RasterOptions) -> Result<Vec<u8>, ConversionError>;
}

/// Runs the converter on a detached task. With a hard timeout, an expired
/// conversion fails the session but keeps running until it finishes on its own.
pub async fn rasterize(
    converter: Arc<dyn Converter>,
    snapshot: SurfaceSnapshot,
    options: RasterOptions,
    class: PlatformClass,
    hard_timeout: Option<Duration>,
) -> Result<Artifact, GenerationError> {
    let filename = format!("{}.pdf", snapshot.model.invoice_number);
    let task = tokio::spawn(async move { converter.convert(&snapshot, &options).await });

    let joined = match hard_timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("conversion of {} exceeded {:?}, abandoning it", filename, limit);
                return Err(GenerationError::GenerationTimeout(limit));
            }
        },
        None => task.await,
    };
    let pdf = joined.map_err(|e| ConversionError::Aborted(e.to_string()))??;
    info!("converted {} ({} bytes, scale {})", filename, pdf.len(), options.scale);
    Ok(Artifact::new(filename, pdf, class))
}

/// Writes the surface's draw operations straight into a PDF.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinConverter;

#[async_trait]
impl Converter for BuiltinConverter {
    async fn convert(&self, surface: &SurfaceSnapshot, options: &RasterOptions) -> Result<Vec<u8>, ConversionError> {
        let surface = surface.clone();
        let options = *options;
        tokio::task::spawn_blocking(move || write_pdf(&surface, &options))
            .await
            .map_err(|e| ConversionError::Aborted(e.to_string()))?
    }
}

pub fn write_pdf(surface: &SurfaceSnapshot, options: &RasterOptions) -> Result<Vec<u8>, ConversionError> {
    let g = options.geometry;
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let regular = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });

    // Embedded images keyed by source, with their pixel aspect ratio.
    let mut placed: BTreeMap<String, (String, f32)> = BTreeMap::new();
    let mut xobjects = Dictionary::new();
    let sources: BTreeMap<&String, &Vec<u8>> = surface.images.iter().collect();
    for (index, (src, bytes)) in sources.into_iter().enumerate() {
        let Some((box_w, box_h)) = image_box(surface, src) else {
            continue;
        };
        let px_w = (box_w * options.scale).ceil().max(1.0) as u32;
        let px_h = (box_h * options.scale).ceil().max(1.0) as u32;
        match encode_jpeg(bytes, px_w, px_h, options.jpeg_quality()) {
            Ok((jpeg, w, h)) => {
                let stream = Stream::new(
                    dictionary! {
                        "Type" => "XObject",
                        "Subtype" => "Image",
                        "Width" => w as i64,
                        "Height" => h as i64,
                        "ColorSpace" => "DeviceRGB",
                        "BitsPerComponent" => 8,
                        "Filter" => "DCTDecode",
                    },
                    jpeg,
                )
                .with_compression(false);
                let name = format!("Im{}", index + 1);
                let id = doc.add_object(stream);
                xobjects.set(name.clone(), id);
                placed.insert(src.clone(), (name, w as f32 / h as f32));
            }
            Err(e) => warn!("skipping image {}: {}", src, e),
        }
    }

    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => regular, "F2" => bold },
        "XObject" => xobjects,
    });

    let mut kids: Vec<Object> = Vec::with_capacity(surface.pages.len());
    for page in &surface.pages {
        let content = page_content(&page.ops, &placed)?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), (g.width as i64).into(), (g.height as i64).into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => Object::string_literal(format!("Invoice {}", surface.model.invoice_number)),
        "Producer" => Object::string_literal("invoice-docgen"),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);
    doc.compress();

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| ConversionError::Pdf(e.to_string()))?;
    debug!("wrote {} page(s), {} bytes", count, out.len());
    Ok(out)
}

fn image_box(surface: &SurfaceSnapshot, src: &str) -> Option<(f32, f32)> {
    surface
        .pages
        .iter()
        .flat_map(|p| p.ops.iter())
        .find_map(|op| match op {
            DrawOp::Image { src: s, w, h, .. } if s == src => Some((*w, *h)),
            _ => None,
        })
}

/// Decodes any supported image, fits it into `max_w` x `max_h` pixels over a
/// white background and re-encodes it as JPEG.
fn encode_jpeg(bytes: &[u8], max_w: u32, max_h: u32, quality: u8) -> Result<(Vec<u8>, u32, u32), ImageError> {
    let img = image::load_from_memory(bytes)?;
    let img = if img.width() > max_w || img.height() > max_h {
        img.resize(max_w, max_h, FilterType::Lanczos3)
    } else {
        img
    };
    let rgba = img.to_rgba8();
    let rgb = image::RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 255 * (255 - a as u16)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    });
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&rgb)?;
    Ok((out, rgb.width(), rgb.height()))
}

fn page_content(ops: &[DrawOp], images: &BTreeMap<String, (String, f32)>) -> Result<Vec<u8>, ConversionError> {
    let mut out = Vec::new();
    for op in ops {
        match op {
            DrawOp::Text {
                x,
                y,
                size,
                bold,
                gray,
                text,
            } => {
                let font = if *bold { "F2" } else { "F1" };
                write!(out, "BT /{} {:.2} Tf {:.2} g {:.2} {:.2} Td (", font, size, gray, x, y)?;
                out.extend(encode_text(text));
                out.extend_from_slice(b") Tj ET\n");
            }
            DrawOp::Rule { x1, y1, x2, y2, width } => {
                writeln!(
                    out,
                    "{:.2} w 0.75 G {:.2} {:.2} m {:.2} {:.2} l S",
                    width, x1, y1, x2, y2
                )?;
            }
            DrawOp::Fill { x, y, w, h, gray } => {
                writeln!(out, "{:.2} g {:.2} {:.2} {:.2} {:.2} re f 0 g", gray, x, y, w, h)?;
            }
            DrawOp::Image { src, x, y, w, h } => {
                // Missing images leave the slot empty.
                if let Some((name, aspect)) = images.get(src) {
                    let (dw, dh) = if w / h > *aspect { (h * aspect, *h) } else { (*w, w / aspect) };
                    writeln!(
                        out,
                        "q {:.2} 0 0 {:.2} {:.2} {:.2} cm /{} Do Q",
                        dw,
                        dh,
                        x,
                        y + (h - dh),
                        name
                    )?;
                }
            }
        }
    }
    Ok(out)
}

/// Escapes a string into a WinAnsi PDF literal body.
fn encode_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(ch as u8);
            }
            ' '..='~' => out.push(ch as u8),
            '\u{a0}'..='\u{ff}' => out.push(ch as u32 as u8),
            '€' => out.push(0x80),
            '‘' => out.push(0x91),
            '’' => out.push(0x92),
            '“' => out.push(0x93),
            '”' => out.push(0x94),
            '•' => out.push(0x95),
            '–' => out.push(0x96),
            '—' => out.push(0x97),
            _ => out.push(b'?'),
        }
    }
    out
}

/// Shells out to the `typst` compiler with a template-rendered source file.
pub struct TypstConverter {
    program: String,
    tera: Tera,
}

impl TypstConverter {
    pub fn new() -> Result<Self, ConversionError> {
        Self::with_program("typst")
    }

    pub fn with_program(program: impl Into<String>) -> Result<Self, ConversionError> {
        let mut tera = Tera::default();
        tera.add_raw_template("invoice.typ", TYPST_TEMPLATE)?;
        Ok(TypstConverter {
            program: program.into(),
            tera,
        })
    }

    pub fn render_source(&self, surface: &SurfaceSnapshot, options: &RasterOptions, logo: Option<&str>) -> Result<String, ConversionError> {
        let metrics = surface.model.metrics();
        let stamp = match surface.model.status {
            InvoiceStatus::Paid => Some("PAID"),
            InvoiceStatus::Void => Some("VOID"),
            _ => None,
        };
        let mut context = Context::new();
        context.insert("margin", &options.geometry.margin);
        context.insert("font_size", &metrics.font_size());
        context.insert("leading", &(metrics.line_height() / metrics.font_size() - 1.0));
        context.insert("padding", &metrics.padding());
        context.insert("col_number", &COL_NUMBER);
        context.insert("col_quantity", &COL_QUANTITY);
        context.insert("col_rate", &COL_RATE);
        context.insert("col_amount", &COL_AMOUNT);
        context.insert("logo", &logo);
        context.insert("stamp", &stamp);
        Ok(self.tera.render("invoice.typ", &context)?)
    }

    fn data(surface: &SurfaceSnapshot) -> serde_json::Value {
        let model = &surface.model;
        let rows: Vec<_> = model
            .rows
            .iter()
            .map(|r| {
                json!({
                    "number": r.number.to_string(),
                    "lines": r.lines,
                    "quantity": format_quantity(r.quantity),
                    "rate": format_currency(r.rate),
                    "amount": format_currency(r.amount),
                })
            })
            .collect();
        json!({
            "invoice_number": model.invoice_number,
            "issue_date": model.issue_date,
            "due_date": model.due_date,
            "sender": { "name": model.sender.name },
            "sender_lines": model.sender_lines(),
            "bill_to": model.bill_to,
            "case_details": model.case_details,
            "rows": rows,
            "total": format_currency(model.total),
            "footer": model.footer_lines(),
        })
    }
}

#[async_trait]
impl Converter for TypstConverter {
    async fn convert(&self, surface: &SurfaceSnapshot, options: &RasterOptions) -> Result<Vec<u8>, ConversionError> {
        let workdir = tempfile::tempdir()?;

        let logo = match surface.model.sender.logo.as_ref().and_then(|src| surface.images.get(src)) {
            Some(bytes) => {
                let name = match image::guess_format(bytes) {
                    Ok(image::ImageFormat::Jpeg) => "logo.jpg",
                    _ => "logo.png",
                };
                tokio::fs::write(workdir.path().join(name), bytes).await?;
                Some(name)
            }
            None => None,
        };

        let source = self.render_source(surface, options, logo)?;
        let data = serde_json::to_vec_pretty(&Self::data(surface))
            .map_err(|e| ConversionError::Pdf(e.to_string()))?;
        let typ_path = workdir.path().join("invoice.typ");
        let pdf_path = workdir.path().join("invoice.pdf");
        tokio::fs::write(workdir.path().join("data.json"), data).await?;
        tokio::fs::write(&typ_path, source).await?;

        debug!("compiling {} with {}", typ_path.display(), self.program);
        let output = tokio::process::Command::new(&self.program)
            .arg("compile")
            .arg(&typ_path)
            .arg(&pdf_path)
            .output()
            .await
            .map_err(|source| ConversionError::RendererMissing {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ConversionError::RendererFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(tokio::fs::read(&pdf_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentModel;
    use crate::model::{ClientInfo, InvoiceRecord, LineItem, SenderConfig};
    use crate::surface::SurfaceRegistry;
    use chrono::NaiveDate;

    fn snapshot(items: usize, logo: Option<&str>) -> SurfaceSnapshot {
        let record = InvoiceRecord {
            id: "inv-9".into(),
            invoice_number: "VDL-2024-009".into(),
            issue_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            client: ClientInfo {
                name: Some("Café (Main) Street".into()),
                ..Default::default()
            },
            custom_fields: Default::default(),
            line_items: (0..items)
                .map(|i| LineItem {
                    number: None,
                    description: format!("Service attempt {}", i + 1),
                    quantity: 1.0,
                    rate: 65.0,
                })
                .collect(),
            pdf_generated: false,
            status: InvoiceStatus::Draft,
        };
        let sender = SenderConfig {
            name: "Acme Process".into(),
            logo: logo.map(String::from),
            ..Default::default()
        };
        let model = DocumentModel::build(&record, &sender, PageGeometry::letter(36.0)).unwrap();
        let registry = SurfaceRegistry::new();
        let mut surface = registry.mount(&model.invoice_id);
        surface.paint(&model);
        surface.snapshot().unwrap()
    }

    fn options() -> RasterOptions {
        RasterOptions::for_platform(PlatformClass::Unrestricted, &PipelineConfig::default())
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 30, 30, 128]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn builtin_writes_a_loadable_pdf() {
        let bytes = write_pdf(&snapshot(3, None), &options()).unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn page_count_follows_pagination() {
        let snap = snapshot(90, None);
        let expected = snap.pages.len();
        assert!(expected > 1);
        let doc = Document::load_mem(&write_pdf(&snap, &options()).unwrap()).unwrap();
        assert_eq!(doc.get_pages().len(), expected);
    }

    #[test]
    fn loaded_logo_is_embedded_at_scaled_resolution() {
        let mut snap = snapshot(1, Some("logo.png"));
        snap.images.insert("logo.png".into(), png(400, 200));
        let doc = Document::load_mem(&write_pdf(&snap, &options()).unwrap()).unwrap();
        let image = doc
            .objects
            .values()
            .filter_map(|o| o.as_stream().ok())
            .find(|s| s.dict.get(b"Subtype").and_then(|v| v.as_name()).ok() == Some(b"Image".as_slice()))
            .expect("image xobject");
        // 48pt box at scale 2.0
        assert_eq!(image.dict.get(b"Width").unwrap().as_i64().unwrap(), 96);
        assert_eq!(image.dict.get(b"Height").unwrap().as_i64().unwrap(), 48);
    }

    #[test]
    fn undecodable_logo_is_skipped() {
        let mut snap = snapshot(1, Some("logo.png"));
        snap.images.insert("logo.png".into(), b"not an image".to_vec());
        let bytes = write_pdf(&snap, &options()).unwrap();
        assert!(Document::load_mem(&bytes).is_ok());
    }

    #[test]
    fn text_is_escaped_for_pdf_literals() {
        assert_eq!(encode_text("a(b)\\"), b"a\\(b\\)\\\\".to_vec());
        assert_eq!(encode_text("Café"), vec![b'C', b'a', b'f', 0xe9]);
        assert_eq!(encode_text("日"), b"?".to_vec());
    }

    #[test]
    fn artifact_shape_follows_platform() {
        let download = Artifact::new("a.pdf".into(), b"%PDF-1.5".to_vec(), PlatformClass::Unrestricted);
        assert_eq!(download.body, ArtifactBody::Binary(b"%PDF-1.5".to_vec()));

        let embedded = Artifact::new("a.pdf".into(), b"%PDF-1.5".to_vec(), PlatformClass::Restricted);
        assert_eq!(embedded.body, ArtifactBody::Embeddable("data:application/pdf;base64,JVBERi0xLjU=".into()));
        assert_eq!(embedded.to_bytes().unwrap(), b"%PDF-1.5".to_vec());
        assert_eq!(download.data_uri(), embedded.data_uri());
    }

    #[tokio::test]
    async fn rasterize_names_the_artifact_after_the_invoice() {
        let artifact = rasterize(
            Arc::new(BuiltinConverter),
            snapshot(2, None),
            options(),
            PlatformClass::Unrestricted,
            None,
        )
        .await
        .unwrap();
        assert_eq!(artifact.filename, "VDL-2024-009.pdf");
        assert!(matches!(artifact.body, ArtifactBody::Binary(ref b) if b.starts_with(b"%PDF-")));
    }

    struct Stalled;

    #[async_trait]
    impl Converter for Stalled {
        async fn convert(&self, _: &SurfaceSnapshot, _: &RasterOptions) -> Result<Vec<u8>, ConversionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_fails_with_generation_timeout() {
        let result = rasterize(
            Arc::new(Stalled),
            snapshot(1, None),
            options(),
            PlatformClass::Restricted,
            Some(Duration::from_secs(25)),
        )
        .await;
        assert!(matches!(result, Err(GenerationError::GenerationTimeout(d)) if d == Duration::from_secs(25)));
    }

    #[test]
    fn typst_source_carries_layout_values() {
        let converter = TypstConverter::new().unwrap();
        let source = converter
            .render_source(&snapshot(13, None), &options(), Some("logo.png"))
            .unwrap();
        assert!(source.contains("margin: 36"));
        assert!(source.contains("#image(\"logo.png\""));
        assert!(source.contains("json(\"data.json\")"));
    }

    #[tokio::test]
    async fn missing_typst_binary_is_a_conversion_error() {
        let converter = TypstConverter::with_program("definitely-not-typst-binary").unwrap();
        let result = converter.convert(&snapshot(1, None), &options()).await;
        assert!(matches!(result, Err(ConversionError::RendererMissing { .. })));
    }
}
