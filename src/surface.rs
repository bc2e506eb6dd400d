//! Offscreen render surface.
//!
//! A surface hosts one laid-out document while it is being converted. It never
//! touches user-visible output; the registry counts live surfaces so a leak
//! across repeated generations shows up as a non-zero count.

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::document::{
    AVG_GLYPH_WIDTH, COL_AMOUNT, COL_NUMBER, COL_QUANTITY, COL_RATE, DocumentModel, HEADER_LINE,
    LOGO_SIZE, RowSlice, SENDER_NAME_LINE, TABLE_HEADER_HEIGHT, TITLE_LINE, format_currency,
    format_quantity,
};
use crate::model::InvoiceStatus;

const CELL_INSET: f32 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    /// Baseline-anchored text run in page coordinates (origin bottom-left).
    Text {
        x: f32,
        y: f32,
        size: f32,
        bold: bool,
        gray: f32,
        text: String,
    },
    Rule {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        width: f32,
    },
    Fill {
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        gray: f32,
    },
    Image {
        src: String,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaintedPage {
    pub ops: Vec<DrawOp>,
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    created: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct SurfaceRegistry {
    counters: Arc<Counters>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&self, invoice_id: &str) -> RenderSurface {
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        debug!("mounted render surface for {}", invoice_id);
        RenderSurface {
            invoice_id: invoice_id.to_string(),
            counters: Arc::clone(&self.counters),
            model: None,
            pages: Vec::new(),
            images: HashMap::new(),
        }
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }
}

/// Owned copy of a painted surface, handed to the converter.
#[derive(Debug, Clone)]
pub struct SurfaceSnapshot {
    pub model: DocumentModel,
    pub pages: Vec<PaintedPage>,
    pub images: HashMap<String, Vec<u8>>,
}

#[derive(Debug)]
pub struct RenderSurface {
    invoice_id: String,
    counters: Arc<Counters>,
    model: Option<DocumentModel>,
    pages: Vec<PaintedPage>,
    images: HashMap<String, Vec<u8>>,
}

impl RenderSurface {
    pub fn paint(&mut self, model: &DocumentModel) {
        self.pages = Painter::new(model).paint();
        self.model = Some(model.clone());
        debug!("painted {} page(s) for {}", self.pages.len(), self.invoice_id);
    }

    /// Waits out the settle window. Zero skips the wait.
    pub async fn settle(&self, window: Duration) {
        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }
    }

    pub fn pages(&self) -> &[PaintedPage] {
        &self.pages
    }

    pub fn image_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        for op in self.pages.iter().flat_map(|p| p.ops.iter()) {
            if let DrawOp::Image { src, .. } = op {
                if !refs.contains(src) {
                    refs.push(src.clone());
                }
            }
        }
        refs
    }

    pub fn font_refs(&self) -> Vec<String> {
        self.model
            .as_ref()
            .map(|m| m.sender.fonts.clone())
            .unwrap_or_default()
    }

    pub fn attach_image(&mut self, src: &str, bytes: Vec<u8>) {
        self.images.insert(src.to_string(), bytes);
    }

    pub fn snapshot(&self) -> Option<SurfaceSnapshot> {
        let model = self.model.clone()?;
        Some(SurfaceSnapshot {
            model,
            pages: self.pages.clone(),
            images: self.images.clone(),
        })
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RenderSurface {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        debug!("released render surface for {}", self.invoice_id);
    }
}

pub(crate) fn text_width(text: &str, size: f32) -> f32 {
    text.chars().count() as f32 * size * AVG_GLYPH_WIDTH
}

struct Painter<'a> {
    model: &'a DocumentModel,
    pages: Vec<PaintedPage>,
    left: f32,
    top: f32,
}

impl<'a> Painter<'a> {
    fn new(model: &'a DocumentModel) -> Self {
        let g = model.geometry;
        Painter {
            model,
            pages: Vec::new(),
            left: g.margin,
            top: g.height - g.margin,
        }
    }

    fn page(&mut self) -> &mut PaintedPage {
        if self.pages.is_empty() {
            self.pages.push(PaintedPage::default());
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn text(&mut self, x: f32, y_top: f32, size: f32, bold: bool, text: impl Into<String>) {
        let y = self.top - y_top;
        self.page().ops.push(DrawOp::Text {
            x,
            y,
            size,
            bold,
            gray: 0.0,
            text: text.into(),
        });
    }

    fn text_right(&mut self, right: f32, y_top: f32, size: f32, bold: bool, text: String) {
        let x = right - text_width(&text, size);
        self.text(x, y_top, size, bold, text);
    }

    fn rule(&mut self, x1: f32, x2: f32, y_top: f32, width: f32) {
        let y = self.top - y_top;
        self.page().ops.push(DrawOp::Rule {
            x1,
            y1: y,
            x2,
            y2: y,
            width,
        });
    }

    fn paint(mut self) -> Vec<PaintedPage> {
        let model = self.model;
        let pages = model.pages();
        let last = pages.len() - 1;
        for (index, slices) in pages.into_iter().enumerate() {
            self.pages.push(PaintedPage::default());
            let mut cursor = 0.0;
            if index == 0 {
                self.band();
                cursor += model.band_height();
                self.parties(cursor);
                cursor += model.parties_height();
            }
            if !slices.is_empty() {
                self.table_header(cursor);
                cursor += TABLE_HEADER_HEIGHT;
                for slice in &slices {
                    cursor = self.row(slice, cursor);
                }
            }
            if index == last {
                self.totals(cursor);
                self.footer();
            }
        }
        let count = self.pages.len();
        for index in 0..count {
            self.page_number(index, count);
        }
        self.pages
    }

    fn band(&mut self) {
        let model = self.model;
        let width = model.geometry.content_width();
        let mut text_x = self.left;
        if let Some(src) = model.sender.logo.clone() {
            let y = self.top - LOGO_SIZE;
            let x = self.left;
            self.page().ops.push(DrawOp::Image {
                src,
                x,
                y,
                w: LOGO_SIZE,
                h: LOGO_SIZE,
            });
            text_x += LOGO_SIZE + 8.0;
        }

        self.text(text_x, 14.0, 14.0, true, model.sender.name.clone());
        let mut y = SENDER_NAME_LINE;
        for line in model.sender_lines() {
            y += HEADER_LINE;
            self.text(text_x, y - 3.0, 9.0, false, line);
        }

        let right = self.left + width;
        self.text_right(right, 22.0, 22.0, true, "INVOICE".to_string());
        let meta = [
            format!("Invoice #: {}", model.invoice_number),
            format!("Issued: {}", model.issue_date),
            format!("Due: {}", model.due_date),
        ];
        let mut y = TITLE_LINE;
        for line in meta {
            y += HEADER_LINE;
            self.text_right(right, y - 3.0, 9.0, false, line);
        }

        let stamp = match model.status {
            InvoiceStatus::Paid => Some("PAID"),
            InvoiceStatus::Void => Some("VOID"),
            _ => None,
        };
        if let Some(stamp) = stamp {
            let size = 28.0;
            let x = self.left + width / 2.0 - text_width(stamp, size) / 2.0;
            let y = self.top - 36.0;
            self.page().ops.push(DrawOp::Text {
                x,
                y,
                size,
                bold: true,
                gray: 0.6,
                text: stamp.to_string(),
            });
        }
    }

    fn parties(&mut self, cursor: f32) {
        let model = self.model;
        self.text(self.left, cursor + 10.0, 9.0, true, "BILL TO");
        for (i, line) in model.bill_to.iter().enumerate() {
            let y = cursor + 10.0 + HEADER_LINE * (i as f32 + 1.0);
            self.text(self.left, y, 9.0, false, line.clone());
        }
        if !model.case_details.is_empty() {
            let x = self.left + model.geometry.content_width() / 2.0;
            self.text(x, cursor + 10.0, 9.0, true, "CASE DETAILS");
            for (i, (label, value)) in model.case_details.iter().enumerate() {
                let y = cursor + 10.0 + HEADER_LINE * (i as f32 + 1.0);
                self.text(x, y, 9.0, false, format!("{}: {}", label, value));
            }
        }
    }

    fn columns(&self) -> (f32, f32, f32, f32) {
        let desc_x = self.left + COL_NUMBER;
        let qty_right = desc_x + self.model.geometry.description_width() + COL_QUANTITY;
        let rate_right = qty_right + COL_RATE;
        let amount_right = rate_right + COL_AMOUNT;
        (desc_x, qty_right, rate_right, amount_right)
    }

    fn table_header(&mut self, cursor: f32) {
        let width = self.model.geometry.content_width();
        let y = self.top - cursor - TABLE_HEADER_HEIGHT;
        let x = self.left;
        self.page().ops.push(DrawOp::Fill {
            x,
            y,
            w: width,
            h: TABLE_HEADER_HEIGHT,
            gray: 0.92,
        });
        let baseline = cursor + 14.0;
        let (desc_x, qty_right, rate_right, amount_right) = self.columns();
        self.text(self.left + CELL_INSET, baseline, 9.0, true, "#");
        self.text(desc_x + CELL_INSET, baseline, 9.0, true, "Description");
        self.text_right(qty_right - CELL_INSET, baseline, 9.0, true, "Qty".to_string());
        self.text_right(rate_right - CELL_INSET, baseline, 9.0, true, "Rate".to_string());
        self.text_right(amount_right - CELL_INSET, baseline, 9.0, true, "Amount".to_string());
    }

    /// Paints the lines of one row that fall on this page. Numbers and
    /// amounts go with the first slice only.
    fn row(&mut self, slice: &RowSlice, cursor: f32) -> f32 {
        let model = self.model;
        let row = &model.rows[slice.row];
        let metrics = model.metrics();
        let size = metrics.font_size();
        let (desc_x, qty_right, rate_right, amount_right) = self.columns();
        let first = cursor + metrics.padding() + size;

        if slice.is_head() {
            self.text(self.left + CELL_INSET, first, size, false, row.number.to_string());
            self.text_right(qty_right - CELL_INSET, first, size, false, format_quantity(row.quantity));
            self.text_right(rate_right - CELL_INSET, first, size, false, format_currency(row.rate));
            self.text_right(amount_right - CELL_INSET, first, size, false, format_currency(row.amount));
        }
        for (i, line) in row.lines[slice.lines.clone()].iter().enumerate() {
            let y = first + metrics.line_height() * i as f32;
            self.text(desc_x + CELL_INSET, y, size, false, line.clone());
        }

        let bottom = cursor + slice.lines.len() as f32 * metrics.line_height() + 2.0 * metrics.padding();
        self.rule(self.left, amount_right, bottom, 0.5);
        bottom
    }

    fn totals(&mut self, cursor: f32) {
        let model = self.model;
        let (_, qty_right, rate_right, amount_right) = self.columns();
        let top = cursor + 12.0;
        self.rule(qty_right, amount_right, top, 1.0);
        let baseline = top + 18.0;
        self.text_right(rate_right - CELL_INSET, baseline, 11.0, true, "Total".to_string());
        self.text_right(amount_right - CELL_INSET, baseline, 11.0, true, format_currency(model.total));
    }

    fn footer(&mut self) {
        let model = self.model;
        let lines = model.footer_lines();
        let content = model.geometry.content_height();
        let start = content - HEADER_LINE * lines.len() as f32;
        for (i, line) in lines.into_iter().enumerate() {
            let y = start + HEADER_LINE * (i as f32 + 1.0) - 3.0;
            self.text(self.left, y, 8.0, false, line);
        }
    }

    fn page_number(&mut self, index: usize, count: usize) {
        let g = self.model.geometry;
        let label = format!("Page {} of {}", index + 1, count);
        let size = 8.0;
        let x = g.width - g.margin - text_width(&label, size);
        self.pages[index].ops.push(DrawOp::Text {
            x,
            y: g.margin / 2.0,
            size,
            bold: false,
            gray: 0.4,
            text: label,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PageGeometry;
    use crate::model::{ClientInfo, InvoiceRecord, LineItem, SenderConfig};
    use chrono::NaiveDate;

    fn model(items: usize, logo: Option<&str>) -> DocumentModel {
        model_with(items, logo, |_| {})
    }

    fn model_with(
        items: usize,
        logo: Option<&str>,
        edit: impl FnOnce(&mut InvoiceRecord),
    ) -> DocumentModel {
        let mut record = InvoiceRecord {
            id: "inv-7".into(),
            invoice_number: "VDL-2024-007".into(),
            issue_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
            client: ClientInfo {
                name: Some("Sam Ortiz".into()),
                ..Default::default()
            },
            custom_fields: Default::default(),
            line_items: (0..items)
                .map(|i| LineItem {
                    number: None,
                    description: format!("Attempted service #{}", i + 1),
                    quantity: 1.0,
                    rate: 45.0,
                })
                .collect(),
            pdf_generated: false,
            status: InvoiceStatus::Paid,
        };
        edit(&mut record);
        let sender = SenderConfig {
            name: "Lone Star Process".into(),
            bank_info: "Routing 111\nAccount 222".into(),
            logo: logo.map(String::from),
            ..Default::default()
        };
        DocumentModel::build(&record, &sender, PageGeometry::letter(36.0)).unwrap()
    }

    fn texts(page: &PaintedPage) -> Vec<&str> {
        page.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn registry_tracks_live_surfaces() {
        let registry = SurfaceRegistry::new();
        let a = registry.mount("a");
        let b = registry.mount("b");
        assert_eq!(registry.live(), 2);
        a.release();
        drop(b);
        assert_eq!(registry.live(), 0);
        assert_eq!(registry.created(), 2);
    }

    #[test]
    fn paint_places_header_rows_and_total() {
        let registry = SurfaceRegistry::new();
        let mut surface = registry.mount("inv-7");
        surface.paint(&model(2, None));
        assert_eq!(surface.pages().len(), 1);
        let texts = texts(&surface.pages()[0]);
        for expected in [
            "Lone Star Process",
            "INVOICE",
            "Invoice #: VDL-2024-007",
            "Sam Ortiz",
            "Attempted service #2",
            "$90.00",
            "PAID",
            "Routing 111",
            "Page 1 of 1",
        ] {
            assert!(texts.contains(&expected), "missing {expected}");
        }
        assert!(surface.image_refs().is_empty());
    }

    #[test]
    fn logo_becomes_an_image_reference() {
        let registry = SurfaceRegistry::new();
        let mut surface = registry.mount("inv-7");
        surface.paint(&model(1, Some("logo.png")));
        assert_eq!(surface.image_refs(), vec!["logo.png".to_string()]);
        surface.attach_image("logo.png", vec![1, 2, 3]);
        let snapshot = surface.snapshot().unwrap();
        assert_eq!(snapshot.images["logo.png"], vec![1, 2, 3]);
    }

    #[test]
    fn every_op_stays_on_the_page() {
        let registry = SurfaceRegistry::new();
        let mut surface = registry.mount("inv-7");
        let model = model(60, None);
        surface.paint(&model);
        assert_eq!(surface.pages().len(), model.pages().len());
        for page in surface.pages() {
            for op in &page.ops {
                if let DrawOp::Text { x, y, .. } = op {
                    assert!(*x >= 0.0 && *x <= model.geometry.width);
                    assert!(*y >= 0.0 && *y <= model.geometry.height);
                }
            }
        }
    }

    #[test]
    fn oversized_description_continues_on_later_pages() {
        let registry = SurfaceRegistry::new();
        let mut surface = registry.mount("inv-7");
        let model = model_with(1, None, |record| {
            record.line_items[0].description = "word ".repeat(1200);
        });
        surface.paint(&model);

        let lines = model.rows[0].lines.len();
        let pages = surface.pages();
        assert!(pages.len() > 1);
        let mut painted = 0;
        for page in pages {
            for op in &page.ops {
                if let DrawOp::Text { y, .. } = op {
                    assert!(*y >= 0.0, "text below the page at y={y}");
                }
            }
            let texts = texts(page);
            let words = texts.iter().filter(|t| t.starts_with("word")).count();
            if words > 0 {
                assert!(texts.contains(&"Description"));
            }
            painted += words;
        }
        assert_eq!(painted, lines);
        // Rate and amount next to the first line, plus the total.
        let prices: usize = pages
            .iter()
            .map(|p| texts(p).iter().filter(|t| **t == "$45.00").count())
            .sum();
        assert_eq!(prices, 3);
    }

    #[test]
    fn snapshot_requires_painting() {
        let registry = SurfaceRegistry::new();
        let surface = registry.mount("inv-7");
        assert!(surface.snapshot().is_none());
    }
}
