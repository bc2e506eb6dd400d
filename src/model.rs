use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ClientInfo {
    pub name: Option<String>, // required for rendering
    pub company: Option<String>,
    pub address: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CustomFields {
    pub county: Option<String>,
    pub case_name: Option<String>,
    pub hearing_date: Option<NaiveDate>,
    pub cause_number: Option<String>,
    pub service_type: Option<String>,
}

impl CustomFields {
    /// Label/value pairs for the fields that are set, in display order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(v) = &self.case_name {
            out.push(("Case Name", v.clone()));
        }
        if let Some(v) = &self.cause_number {
            out.push(("Cause No.", v.clone()));
        }
        if let Some(v) = &self.county {
            out.push(("County", v.clone()));
        }
        if let Some(d) = &self.hearing_date {
            out.push(("Hearing Date", d.format("%m/%d/%Y").to_string()));
        }
        if let Some(v) = &self.service_type {
            out.push(("Service", v.clone()));
        }
        out
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LineItem {
    #[serde(default)]
    pub number: Option<u32>, // defaults to 1-based position
    pub description: String,
    pub quantity: f64,
    pub rate: f64,
}

impl LineItem {
    pub fn amount(&self) -> f64 {
        self.quantity * self.rate
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Sent,
    Paid,
    Void,
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        };
        f.write_str(s)
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(InvoiceStatus::Draft),
            "sent" => Ok(InvoiceStatus::Sent),
            "paid" => Ok(InvoiceStatus::Paid),
            "void" => Ok(InvoiceStatus::Void),
            other => Err(format!("unknown invoice status '{}'", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InvoiceRecord {
    pub id: String,
    pub invoice_number: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub pdf_generated: bool,
    #[serde(default)]
    pub status: InvoiceStatus,
    // Tables last so the record serializes to TOML.
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default)]
    pub custom_fields: CustomFields,
    pub line_items: Vec<LineItem>,
}

impl InvoiceRecord {
    pub fn total(&self) -> f64 {
        self.line_items.iter().map(LineItem::amount).sum()
    }
}

/// Business branding printed in the document header, loaded from `sender.toml`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SenderConfig {
    pub name: String,
    pub address1: String,
    pub address2: String,
    #[serde(default)]
    pub license: String,
    pub email: String,
    pub phone: String,
    pub bank_info: String,
    /// Path, `http(s)` URL or `data:` URI of a logo image.
    #[serde(default)]
    pub logo: Option<String>,
    /// Font files that must be ready before conversion.
    #[serde(default)]
    pub fonts: Vec<String>,
}
