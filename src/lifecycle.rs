//! Ownership of per-session resources and terminal reporting.

use log::{error, info, warn};
use serde::Serialize;

use crate::delivery::{DeliveryMethod, DeliveryTarget};
use crate::error::GenerationError;
use crate::session::{GenerationSession, SessionState};
use crate::store::InvoiceStore;
use crate::surface::RenderSurface;

pub(crate) const EMBEDDED_VIEW_HINT: &str =
    "The invoice opened in a viewer. Use Share, then Save to Files (or Print, then Save as PDF) to keep a copy.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutcome {
    pub method: DeliveryMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Success {
        invoice_number: String,
        method: DeliveryMethod,
        message: String,
    },
    Failure {
        invoice_number: String,
        message: String,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Routes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Success { message, .. } => info!("{}", message),
            Notification::Failure { message, .. } => error!("{}", message),
        }
    }
}

/// Holds the render surface and delivery target of one session. Dropping the
/// controller releases the surface whatever path the session took, and closes
/// the target if the session never reached [`Lifecycle::finish`].
pub struct Lifecycle<'a> {
    invoice_id: String,
    invoice_number: String,
    surface: Option<RenderSurface>,
    target: Option<Box<dyn DeliveryTarget>>,
    store: &'a dyn InvoiceStore,
    notifier: &'a dyn Notifier,
    finished: bool,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        invoice_id: &str,
        invoice_number: &str,
        target: Option<Box<dyn DeliveryTarget>>,
        store: &'a dyn InvoiceStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Lifecycle {
            invoice_id: invoice_id.to_string(),
            invoice_number: invoice_number.to_string(),
            surface: None,
            target,
            store,
            notifier,
            finished: false,
        }
    }

    pub fn adopt_surface(&mut self, surface: RenderSurface) -> &mut RenderSurface {
        self.surface.insert(surface)
    }

    pub fn target_mut(&mut self) -> &mut Option<Box<dyn DeliveryTarget>> {
        &mut self.target
    }

    fn release_surface(&mut self) {
        if let Some(surface) = self.surface.take() {
            surface.release();
        }
    }

    fn close_target(&mut self) {
        if let Some(mut target) = self.target.take() {
            if !target.is_closed() {
                target.close();
            }
        }
    }

    /// Closes out the session and reports its terminal state.
    pub async fn finish(
        mut self,
        session: &mut GenerationSession,
        result: Result<DeliveryMethod, GenerationError>,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.finished = true;
        self.release_surface();
        let result = result.and_then(|method| {
            session.advance(SessionState::Succeeded)?;
            Ok(method)
        });
        match result {
            Ok(method) => {
                if let Err(e) = self.store.mark_pdf_generated(&self.invoice_id).await {
                    warn!("could not record PDF generation for {}: {}", self.invoice_id, e);
                }
                let message = match method {
                    DeliveryMethod::Download => {
                        format!("Invoice {} downloaded as {}.pdf", self.invoice_number, self.invoice_number)
                    }
                    DeliveryMethod::EmbeddedView => {
                        format!("Invoice {} is ready. {}", self.invoice_number, EMBEDDED_VIEW_HINT)
                    }
                };
                self.notifier.notify(&Notification::Success {
                    invoice_number: self.invoice_number.clone(),
                    method,
                    message,
                });
                Ok(GenerationOutcome { method })
            }
            Err(err) => {
                if let Err(illegal) = session.advance(SessionState::Failed) {
                    error!("session for {}: {}", self.invoice_id, illegal);
                }
                self.close_target();
                self.notifier.notify(&Notification::Failure {
                    invoice_number: self.invoice_number.clone(),
                    message: format!("Could not generate invoice {}: {}", self.invoice_number, err),
                });
                Err(err)
            }
        }
    }
}

impl Drop for Lifecycle<'_> {
    fn drop(&mut self) {
        if !self.finished && self.target.is_some() {
            warn!("generation for {} abandoned, closing its viewer", self.invoice_number);
            self.close_target();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, TargetError};
    use crate::model::{InvoiceRecord, InvoiceStatus};
    use crate::raster::Artifact;
    use crate::session::{IllegalTransition, SessionGuard};
    use crate::surface::SurfaceRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CountingStore {
        marked: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl InvoiceStore for CountingStore {
        async fn fetch_invoice(&self, id: &str) -> Result<InvoiceRecord, StoreError> {
            Err(StoreError::NotFound(id.into()))
        }

        async fn mark_pdf_generated(&self, id: &str) -> Result<(), StoreError> {
            self.marked.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::NotFound(id.into()));
            }
            Ok(())
        }

        async fn update_invoice_status(&self, _id: &str, _status: InvoiceStatus) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list_invoices(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    impl Notifier for Recorder {
        fn notify(&self, notification: &Notification) {
            self.0.lock().unwrap().push(notification.clone());
        }
    }

    struct Viewer(Arc<AtomicBool>);

    #[async_trait]
    impl DeliveryTarget for Viewer {
        fn is_closed(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        async fn inject(&mut self, _artifact: &Artifact) -> Result<(), TargetError> {
            Ok(())
        }

        fn close(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn running_session(guard: &SessionGuard) -> GenerationSession {
        let mut session = guard.begin("inv-1").unwrap();
        for next in [
            SessionState::Building,
            SessionState::Rendering,
            SessionState::Syncing,
            SessionState::Rasterizing,
            SessionState::Delivering,
        ] {
            session.advance(next).unwrap();
        }
        session
    }

    #[tokio::test]
    async fn success_marks_once_releases_surface_and_keeps_viewer() {
        let store = CountingStore::default();
        let notifier = Recorder::default();
        let registry = SurfaceRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::new();
        let mut session = running_session(&guard);

        let mut lifecycle = Lifecycle::new("inv-1", "VDL-1", Some(Box::new(Viewer(closed.clone()))), &store, &notifier);
        lifecycle.adopt_surface(registry.mount("inv-1"));
        let outcome = lifecycle.finish(&mut session, Ok(DeliveryMethod::EmbeddedView)).await.unwrap();

        assert_eq!(outcome.method, DeliveryMethod::EmbeddedView);
        assert_eq!(session.state(), SessionState::Succeeded);
        assert_eq!(store.marked.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live(), 0);
        assert!(!closed.load(Ordering::SeqCst));
        let notes = notifier.0.lock().unwrap();
        assert!(matches!(&notes[0], Notification::Success { message, .. } if message.contains("Save to Files")));
    }

    #[tokio::test]
    async fn failure_closes_viewer_and_reports_message() {
        let store = CountingStore::default();
        let notifier = Recorder::default();
        let registry = SurfaceRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::new();
        let mut session = running_session(&guard);

        let mut lifecycle = Lifecycle::new("inv-1", "VDL-1", Some(Box::new(Viewer(closed.clone()))), &store, &notifier);
        lifecycle.adopt_surface(registry.mount("inv-1"));
        let err = lifecycle
            .finish(&mut session, Err(GenerationError::DeliveryTargetClosed))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::DeliveryTargetClosed));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(store.marked.load(Ordering::SeqCst), 0);
        assert_eq!(registry.live(), 0);
        assert!(closed.load(Ordering::SeqCst));
        let notes = notifier.0.lock().unwrap();
        assert!(matches!(&notes[0], Notification::Failure { message, .. } if message.contains("viewer was closed")));
    }

    #[tokio::test]
    async fn failed_bookkeeping_does_not_fail_delivery() {
        let store = CountingStore {
            fail: true,
            ..Default::default()
        };
        let notifier = Recorder::default();
        let guard = SessionGuard::new();
        let mut session = running_session(&guard);
        let lifecycle = Lifecycle::new("inv-1", "VDL-1", None, &store, &notifier);
        let outcome = lifecycle.finish(&mut session, Ok(DeliveryMethod::Download)).await;
        assert_eq!(outcome.unwrap().method, DeliveryMethod::Download);
    }

    #[tokio::test]
    async fn out_of_order_success_is_reported_as_failure() {
        let store = CountingStore::default();
        let notifier = Recorder::default();
        let closed = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::new();
        let mut session = guard.begin("inv-1").unwrap();
        session.advance(SessionState::Building).unwrap();

        let lifecycle = Lifecycle::new("inv-1", "VDL-1", Some(Box::new(Viewer(closed.clone()))), &store, &notifier);
        let err = lifecycle.finish(&mut session, Ok(DeliveryMethod::Download)).await.unwrap_err();

        assert!(matches!(
            err,
            GenerationError::Session(IllegalTransition {
                from: SessionState::Building,
                to: SessionState::Succeeded
            })
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(store.marked.load(Ordering::SeqCst), 0);
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(&notifier.0.lock().unwrap()[0], Notification::Failure { .. }));
    }

    #[test]
    fn abandoned_controller_closes_the_viewer() {
        let store = CountingStore::default();
        let closed = Arc::new(AtomicBool::new(false));
        drop(Lifecycle::new("inv-1", "VDL-1", Some(Box::new(Viewer(closed.clone()))), &store, &LogNotifier));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_the_controller_releases_the_surface() {
        let store = CountingStore::default();
        let registry = SurfaceRegistry::new();
        {
            let mut lifecycle = Lifecycle::new("inv-1", "VDL-1", None, &store, &LogNotifier);
            lifecycle.adopt_surface(registry.mount("inv-1"));
            assert_eq!(registry.live(), 1);
        }
        assert_eq!(registry.live(), 0);
    }
}
