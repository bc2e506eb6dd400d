//! Document model construction.
//!
//! Turns an [`InvoiceRecord`] into a [`DocumentModel`]: formatted header blocks,
//! table rows with wrapped descriptions, the grand total and pagination hints.
//! Everything here is pure; no I/O happens until the model is painted.

use std::ops::Range;

use crate::error::ValidationIssue;
use crate::model::{InvoiceRecord, InvoiceStatus, SenderConfig};

pub const LETTER_WIDTH: f32 = 612.0;
pub const LETTER_HEIGHT: f32 = 792.0;

const BASE_FONT_SIZE: f32 = 10.0;
const BASE_LINE_HEIGHT: f32 = 1.45;
const BASE_PADDING: f32 = 6.0;

// Header metrics shared with the render surface.
pub(crate) const HEADER_LINE: f32 = 13.0;
pub(crate) const SENDER_NAME_LINE: f32 = 18.0;
pub(crate) const TITLE_LINE: f32 = 26.0;
pub(crate) const LOGO_SIZE: f32 = 48.0;
pub(crate) const SECTION_GAP: f32 = 20.0;
pub(crate) const TABLE_HEADER_HEIGHT: f32 = 20.0;
pub(crate) const TOTALS_HEIGHT: f32 = 44.0;

// Table columns, widths in points. The description column takes the rest.
pub(crate) const COL_NUMBER: f32 = 28.0;
pub(crate) const COL_QUANTITY: f32 = 50.0;
pub(crate) const COL_RATE: f32 = 70.0;
pub(crate) const COL_AMOUNT: f32 = 80.0;

/// Average Helvetica advance as a fraction of the font size.
pub(crate) const AVG_GLYPH_WIDTH: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    Standard,
    Dense,
    Compact,
}

impl LayoutMode {
    pub fn for_item_count(count: usize) -> Self {
        if count > 12 {
            LayoutMode::Compact
        } else if count <= 10 {
            LayoutMode::Dense
        } else {
            LayoutMode::Standard
        }
    }

    pub fn metrics(self) -> LayoutMetrics {
        let (font, line, padding) = match self {
            LayoutMode::Dense => (1.0, 1.0, 1.0),
            LayoutMode::Standard => (0.95, 0.93, 0.83),
            LayoutMode::Compact => (0.85, 0.86, 0.5),
        };
        LayoutMetrics {
            font_scale: font,
            line_height_scale: line,
            padding_scale: padding,
        }
    }
}

/// Scale factors applied to the table typography. Never touches amounts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutMetrics {
    pub font_scale: f32,
    pub line_height_scale: f32,
    pub padding_scale: f32,
}

impl LayoutMetrics {
    pub fn font_size(&self) -> f32 {
        BASE_FONT_SIZE * self.font_scale
    }

    pub fn line_height(&self) -> f32 {
        self.font_size() * BASE_LINE_HEIGHT * self.line_height_scale
    }

    pub fn padding(&self) -> f32 {
        BASE_PADDING * self.padding_scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width: f32,
    pub height: f32,
    pub margin: f32,
}

impl PageGeometry {
    pub fn letter(margin: f32) -> Self {
        PageGeometry {
            width: LETTER_WIDTH,
            height: LETTER_HEIGHT,
            margin,
        }
    }

    pub fn content_width(&self) -> f32 {
        self.width - 2.0 * self.margin
    }

    pub fn content_height(&self) -> f32 {
        self.height - 2.0 * self.margin
    }

    pub(crate) fn description_width(&self) -> f32 {
        self.content_width() - COL_NUMBER - COL_QUANTITY - COL_RATE - COL_AMOUNT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowModel {
    pub number: u32,
    pub lines: Vec<String>,
    pub quantity: f64,
    pub rate: f64,
    pub amount: f64,
    pub height: f32,
}

/// Where a page starts: a row and the first of its wrapped lines drawn there.
/// `line` is non-zero only when a row taller than a page continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBreak {
    pub row: usize,
    pub line: usize,
}

/// The part of one row that lands on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSlice {
    pub row: usize,
    pub lines: Range<usize>,
}

impl RowSlice {
    /// The slice that carries the number, quantity and amounts.
    pub fn is_head(&self) -> bool {
        self.lines.start == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentModel {
    pub invoice_id: String,
    pub invoice_number: String,
    pub issue_date: String,
    pub due_date: String,
    pub status: InvoiceStatus,
    pub sender: SenderConfig,
    pub bill_to: Vec<String>,
    pub case_details: Vec<(String, String)>,
    pub rows: Vec<RowModel>,
    pub total: f64,
    pub layout: LayoutMode,
    pub geometry: PageGeometry,
    pub page_breaks: Vec<PageBreak>,
    /// Totals do not fit under the last row and open their own page.
    pub totals_on_new_page: bool,
}

impl DocumentModel {
    pub fn build(
        record: &InvoiceRecord,
        sender: &SenderConfig,
        geometry: PageGeometry,
    ) -> Result<DocumentModel, ValidationIssue> {
        if record.line_items.is_empty() {
            return Err(ValidationIssue::NoLineItems);
        }
        let client_name = match record.client.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ValidationIssue::MissingClientName),
        };

        let layout = LayoutMode::for_item_count(record.line_items.len());
        let metrics = layout.metrics();
        let chars_per_line = chars_per_line(geometry.description_width(), metrics.font_size());

        let mut total = 0.0;
        let rows: Vec<RowModel> = record
            .line_items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let amount = item.amount();
                total += amount;
                let lines = wrap_description(&item.description, chars_per_line);
                let height = lines.len() as f32 * metrics.line_height() + 2.0 * metrics.padding();
                RowModel {
                    number: item.number.unwrap_or(idx as u32 + 1),
                    lines,
                    quantity: item.quantity,
                    rate: item.rate,
                    amount,
                    height,
                }
            })
            .collect();

        let client = &record.client;
        let mut bill_to = vec![client_name];
        bill_to.extend(client.company.iter().cloned());
        if let Some(address) = &client.address {
            bill_to.extend(address.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
        }
        bill_to.extend(client.email.iter().cloned());
        bill_to.extend(client.phone.iter().cloned());

        let case_details = record
            .custom_fields
            .entries()
            .into_iter()
            .map(|(label, value)| (label.to_string(), value))
            .collect();

        let mut model = DocumentModel {
            invoice_id: record.id.clone(),
            invoice_number: record.invoice_number.clone(),
            issue_date: record.issue_date.format("%m/%d/%Y").to_string(),
            due_date: record.due_date.format("%m/%d/%Y").to_string(),
            status: record.status,
            sender: sender.clone(),
            bill_to,
            case_details,
            rows,
            total,
            layout,
            geometry,
            page_breaks: Vec::new(),
            totals_on_new_page: false,
        };
        model.paginate();
        Ok(model)
    }

    pub fn metrics(&self) -> LayoutMetrics {
        self.layout.metrics()
    }

    pub fn sender_lines(&self) -> Vec<String> {
        let s = &self.sender;
        let contact = [s.phone.as_str(), s.email.as_str()]
            .iter()
            .filter(|v| !v.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" | ");
        [s.address1.clone(), s.address2.clone(), contact, s.license.clone()]
            .into_iter()
            .filter(|l| !l.is_empty())
            .collect()
    }

    pub fn footer_lines(&self) -> Vec<String> {
        self.sender
            .bank_info
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }

    pub(crate) fn band_height(&self) -> f32 {
        let sender = SENDER_NAME_LINE + HEADER_LINE * self.sender_lines().len() as f32;
        let meta = TITLE_LINE + HEADER_LINE * 3.0;
        let logo = if self.sender.logo.is_some() { LOGO_SIZE } else { 0.0 };
        sender.max(meta).max(logo) + SECTION_GAP
    }

    pub(crate) fn parties_height(&self) -> f32 {
        let lines = self.bill_to.len().max(self.case_details.len());
        HEADER_LINE * (lines as f32 + 1.0) + SECTION_GAP
    }

    /// Space taken above the table on the first page, table header included.
    pub fn header_height(&self) -> f32 {
        self.band_height() + self.parties_height() + TABLE_HEADER_HEIGHT
    }

    pub fn footer_height(&self) -> f32 {
        let lines = self.footer_lines().len();
        if lines == 0 {
            0.0
        } else {
            HEADER_LINE * lines as f32 + 8.0
        }
    }

    /// Row slices per page, following the pagination hints.
    pub fn pages(&self) -> Vec<Vec<RowSlice>> {
        let end = PageBreak {
            row: self.rows.len(),
            line: 0,
        };
        let mut start = PageBreak { row: 0, line: 0 };
        let mut pages = Vec::new();
        for &next in self.page_breaks.iter().chain(std::iter::once(&end)) {
            pages.push(self.slices_between(start, next));
            start = next;
        }
        if self.totals_on_new_page {
            pages.push(Vec::new());
        }
        pages
    }

    fn slices_between(&self, start: PageBreak, end: PageBreak) -> Vec<RowSlice> {
        let mut slices = Vec::new();
        let (mut row, mut line) = (start.row, start.line);
        while row < end.row || (row == end.row && line < end.line) {
            let last = if row == end.row {
                end.line
            } else {
                self.rows[row].lines.len()
            };
            slices.push(RowSlice { row, lines: line..last });
            row += 1;
            line = 0;
        }
        slices
    }

    fn paginate(&mut self) {
        let metrics = self.metrics();
        let line_height = metrics.line_height();
        let chrome = 2.0 * metrics.padding();
        let content = self.geometry.content_height() - self.footer_height();
        let fresh = content - TABLE_HEADER_HEIGHT;
        let mut available = content - self.header_height();
        let mut used = 0.0;
        self.page_breaks.clear();

        for (idx, row) in self.rows.iter().enumerate() {
            let total = row.lines.len();
            let mut line = 0;
            loop {
                let height = (total - line) as f32 * line_height + chrome;
                if used + height <= available {
                    used += height;
                    break;
                }
                // Rows that fit on a page of their own move whole; taller ones
                // fill what is left here and continue on the next page.
                let take = if height <= fresh {
                    0
                } else {
                    let fits = ((available - used - chrome) / line_height).floor().max(0.0) as usize;
                    if used == 0.0 { fits.max(1) } else { fits }
                };
                if line + take >= total {
                    used += height;
                    break;
                }
                line += take;
                self.page_breaks.push(PageBreak { row: idx, line });
                available = fresh;
                used = 0.0;
            }
        }
        self.totals_on_new_page = used + TOTALS_HEIGHT > available;
    }
}

pub(crate) fn chars_per_line(width: f32, font_size: f32) -> usize {
    ((width / (font_size * AVG_GLYPH_WIDTH)).floor() as usize).max(8)
}

/// Greedy word wrap. Both real newlines and a literal `\n` break lines.
pub fn wrap_description(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    for paragraph in text.replace("\\n", "\n").lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let mut word = word.to_string();
            while word.chars().count() > max_chars {
                if !line.is_empty() {
                    out.push(std::mem::take(&mut line));
                }
                let head: String = word.chars().take(max_chars).collect();
                word = word.chars().skip(max_chars).collect();
                out.push(head);
            }
            if line.is_empty() {
                line = word;
            } else if line.chars().count() + 1 + word.chars().count() <= max_chars {
                line.push(' ');
                line.push_str(&word);
            } else {
                out.push(std::mem::replace(&mut line, word));
            }
        }
        out.push(line);
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

/// `$1,234.56`. Rounds to cents here and nowhere else.
pub fn format_currency(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}${}.{:02}", sign, grouped, cents % 100)
}

pub fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.2}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
