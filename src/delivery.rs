//! Delivery of a finished artifact to the user.
//!
//! Unrestricted clients get a plain download. Restricted clients only allow
//! opening an output surface while handling a user gesture, so the target is
//! acquired before any asynchronous work and handed in here; later acquisition
//! and same-context navigation are fallbacks.

use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use std::fmt;

use crate::error::{GenerationError, TargetError};
use crate::platform::PlatformClass;
use crate::raster::Artifact;

const DOWNLOAD_GUIDANCE: &str = "Check that the output folder is writable and try again.";
const POPUP_GUIDANCE: &str =
    "Allow pop-ups for this site and try again, or open the invoice on a desktop browser to download it.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMethod {
    Download,
    EmbeddedView,
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMethod::Download => f.write_str("download"),
            DeliveryMethod::EmbeddedView => f.write_str("embedded-view"),
        }
    }
}

/// An output surface reserved for one session.
#[async_trait]
pub trait DeliveryTarget: Send {
    fn is_closed(&self) -> bool;

    /// Fails with [`TargetError::Closed`] if the user closes the surface meanwhile.
    async fn inject(&mut self, artifact: &Artifact) -> Result<(), TargetError>;

    fn close(&mut self);
}

#[async_trait]
pub trait DeliveryHost: Send + Sync {
    async fn save_download(&self, filename: &str, bytes: &[u8]) -> Result<(), TargetError>;

    /// Opens a new output surface. Synchronous so it can run inside the
    /// triggering call stack.
    fn acquire_target(&self, invoice_number: &str) -> Result<Box<dyn DeliveryTarget>, TargetError>;

    /// Shows the artifact in the current context.
    async fn navigate(&self, artifact: &Artifact) -> Result<(), TargetError>;
}

pub async fn deliver(
    host: &dyn DeliveryHost,
    class: PlatformClass,
    invoice_number: &str,
    artifact: &Artifact,
    target: &mut Option<Box<dyn DeliveryTarget>>,
) -> Result<DeliveryMethod, GenerationError> {
    match class {
        PlatformClass::Unrestricted => {
            let bytes = artifact.to_bytes()?;
            host.save_download(&artifact.filename, &bytes)
                .await
                .map_err(|e| GenerationError::DeliveryBlocked {
                    reason: e.to_string(),
                    guidance: DOWNLOAD_GUIDANCE.to_string(),
                })?;
            info!("saved {} as a download", artifact.filename);
            Ok(DeliveryMethod::Download)
        }
        PlatformClass::Restricted => deliver_embedded(host, invoice_number, artifact, target).await,
    }
}

async fn deliver_embedded(
    host: &dyn DeliveryHost,
    invoice_number: &str,
    artifact: &Artifact,
    target: &mut Option<Box<dyn DeliveryTarget>>,
) -> Result<DeliveryMethod, GenerationError> {
    if target.as_ref().is_none_or(|t| t.is_closed()) {
        if target.take().is_some() {
            info!("viewer for {} was closed before delivery, reopening", invoice_number);
        }
        match host.acquire_target(invoice_number) {
            Ok(fresh) => *target = Some(fresh),
            Err(e) => warn!("could not open a viewer for {}: {}", invoice_number, e),
        }
    }

    if let Some(t) = target.as_mut() {
        match t.inject(artifact).await {
            Ok(()) => {
                info!("delivered {} into the viewer", artifact.filename);
                return Ok(DeliveryMethod::EmbeddedView);
            }
            Err(TargetError::Closed) => return Err(GenerationError::DeliveryTargetClosed),
            Err(e) => {
                warn!("viewer for {} rejected the document: {}", invoice_number, e);
                t.close();
                *target = None;
            }
        }
    }

    host.navigate(artifact)
        .await
        .map_err(|e| GenerationError::DeliveryBlocked {
            reason: e.to_string(),
            guidance: POPUP_GUIDANCE.to_string(),
        })?;
    info!("opened {} in the current context", artifact.filename);
    Ok(DeliveryMethod::EmbeddedView)
}
