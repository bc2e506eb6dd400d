use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::session::IllegalTransition;

/// Why an invoice cannot be turned into a legible document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("invoice has no line items")]
    NoLineItems,
    #[error("client name is missing")]
    MissingClientName,
}

/// Terminal failure of a generation session.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invoice {invoice_number} cannot be rendered: {issue}")]
    Validation {
        invoice_number: String,
        issue: ValidationIssue,
    },
    #[error("a document is already being generated for invoice {0}")]
    AlreadyInFlight(String),
    #[error("document conversion did not finish within {}s, please try again", .0.as_secs())]
    GenerationTimeout(Duration),
    #[error("document conversion failed: {0}")]
    Conversion(#[from] ConversionError),
    #[error("the document could not be delivered: {reason}. {guidance}")]
    DeliveryBlocked { reason: String, guidance: String },
    #[error("the document viewer was closed before delivery finished")]
    DeliveryTargetClosed,
    #[error("internal error: {0}")]
    Session(#[from] IllegalTransition),
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("PDF writer error: {0}")]
    Pdf(String),
    #[error("template error: {0}")]
    Template(#[from] tera::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("renderer '{program}' is not available: {source}")]
    RendererMissing {
        program: String,
        source: std::io::Error,
    },
    #[error("renderer exited with {status}: {stderr}")]
    RendererFailed { status: String, stderr: String },
    #[error("conversion task aborted: {0}")]
    Aborted(String),
}

/// Soft failure of a single raster asset. Reported, never propagated.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    #[error("{0}")]
    Io(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("malformed data URI")]
    BadDataUri,
    #[error("not a font file")]
    NotAFont,
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("output surface could not be opened: {0}")]
    Blocked(String),
    #[error("output surface was closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("template error: {0}")]
    Template(#[from] tera::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invoice {0} not found")]
    NotFound(String),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize invoice: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_user_facing() {
        let err = GenerationError::Validation {
            invoice_number: "VDL-2024-001".into(),
            issue: ValidationIssue::NoLineItems,
        };
        assert_eq!(
            err.to_string(),
            "invoice VDL-2024-001 cannot be rendered: invoice has no line items"
        );

        let err = GenerationError::GenerationTimeout(Duration::from_secs(25));
        assert!(err.to_string().contains("25s"));
    }
}
