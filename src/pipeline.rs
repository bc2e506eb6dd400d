//! Entry point tying the stages of a generation session together.

use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;

use crate::config::{Engine, PipelineConfig};
use crate::delivery::{DeliveryHost, DeliveryMethod, DeliveryTarget, deliver};
use crate::document::{DocumentModel, PageGeometry};
use crate::error::{ConversionError, GenerationError};
use crate::lifecycle::{GenerationOutcome, Lifecycle, LogNotifier, Notifier};
use crate::model::{InvoiceRecord, SenderConfig};
use crate::platform::{ClientEnvironment, PlatformClass, detect};
use crate::raster::{BuiltinConverter, Converter, RasterOptions, TypstConverter, rasterize};
use crate::resources::{ResourceBarrier, ResourceLoader};
use crate::session::{GenerationSession, SessionGuard, SessionState};
use crate::store::InvoiceStore;
use crate::surface::SurfaceRegistry;

/// Picks the conversion engine named in the settings.
pub fn converter_for(engine: Engine) -> Result<Arc<dyn Converter>, ConversionError> {
    Ok(match engine {
        Engine::Builtin => Arc::new(BuiltinConverter),
        Engine::Typst => Arc::new(TypstConverter::new()?),
    })
}

pub struct DocumentGenerator {
    store: Arc<dyn InvoiceStore>,
    converter: Arc<dyn Converter>,
    loader: Arc<dyn ResourceLoader>,
    host: Arc<dyn DeliveryHost>,
    notifier: Arc<dyn Notifier>,
    config: PipelineConfig,
    sender: SenderConfig,
    sessions: SessionGuard,
    surfaces: SurfaceRegistry,
}

impl DocumentGenerator {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        converter: Arc<dyn Converter>,
        loader: Arc<dyn ResourceLoader>,
        host: Arc<dyn DeliveryHost>,
        config: PipelineConfig,
        sender: SenderConfig,
    ) -> Self {
        DocumentGenerator {
            store,
            converter,
            loader,
            host,
            notifier: Arc::new(LogNotifier),
            config,
            sender,
            sessions: SessionGuard::new(),
            surfaces: SurfaceRegistry::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn sessions(&self) -> &SessionGuard {
        &self.sessions
    }

    pub fn surfaces(&self) -> &SurfaceRegistry {
        &self.surfaces
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Generates and delivers the PDF for `invoice`.
    ///
    /// Platform detection, the in-flight check and, on restricted platforms,
    /// acquisition of the delivery target happen before this returns, inside
    /// the caller's stack. Everything else runs when the future is polled.
    pub fn generate_document<'a>(
        &'a self,
        invoice: InvoiceRecord,
        env: &ClientEnvironment,
    ) -> impl Future<Output = Result<GenerationOutcome, GenerationError>> + use<'a> {
        let class = detect(env);
        let started = self.start(&invoice, class);
        async move {
            let (session, target) = started?;
            self.run(invoice, class, session, target).await
        }
    }

    fn start(
        &self,
        invoice: &InvoiceRecord,
        class: PlatformClass,
    ) -> Result<(GenerationSession, Option<Box<dyn DeliveryTarget>>), GenerationError> {
        let Some(session) = self.sessions.begin(&invoice.id) else {
            warn!("generation for {} already in flight, rejecting", invoice.id);
            return Err(GenerationError::AlreadyInFlight(invoice.invoice_number.clone()));
        };
        debug!("starting generation for {} on a {} client", invoice.id, class);

        let target = match class {
            PlatformClass::Unrestricted => None,
            PlatformClass::Restricted => match self.host.acquire_target(&invoice.invoice_number) {
                Ok(target) => Some(target),
                Err(e) => {
                    warn!("could not reserve a viewer for {}: {}", invoice.invoice_number, e);
                    None
                }
            },
        };
        Ok((session, target))
    }

    async fn run(
        &self,
        invoice: InvoiceRecord,
        class: PlatformClass,
        mut session: GenerationSession,
        target: Option<Box<dyn DeliveryTarget>>,
    ) -> Result<GenerationOutcome, GenerationError> {
        let mut lifecycle = Lifecycle::new(
            &invoice.id,
            &invoice.invoice_number,
            target,
            self.store.as_ref(),
            self.notifier.as_ref(),
        );
        let result = self.stages(&invoice, class, &mut session, &mut lifecycle).await;
        lifecycle.finish(&mut session, result).await
    }

    async fn stages(
        &self,
        invoice: &InvoiceRecord,
        class: PlatformClass,
        session: &mut GenerationSession,
        lifecycle: &mut Lifecycle<'_>,
    ) -> Result<DeliveryMethod, GenerationError> {
        session.advance(SessionState::Building)?;
        let geometry = PageGeometry::letter(self.config.margin_pt);
        let model = DocumentModel::build(invoice, &self.sender, geometry).map_err(|issue| {
            GenerationError::Validation {
                invoice_number: invoice.invoice_number.clone(),
                issue,
            }
        })?;

        session.advance(SessionState::Rendering)?;
        let surface = lifecycle.adopt_surface(self.surfaces.mount(&invoice.id));
        surface.paint(&model);
        surface.settle(self.config.settle_window()).await;

        session.advance(SessionState::Syncing)?;
        let barrier = ResourceBarrier::new(self.config.image_timeout(), self.config.font_timeout());
        let report = barrier.settle(surface, self.loader.as_ref()).await;
        if report.soft_failures() > 0 {
            info!(
                "{} resource(s) unavailable for {}, rendering without them",
                report.soft_failures(),
                invoice.invoice_number
            );
        }

        session.advance(SessionState::Rasterizing)?;
        let snapshot = surface
            .snapshot()
            .ok_or_else(|| ConversionError::Aborted("surface was never painted".into()))?;
        let options = RasterOptions::for_platform(class, &self.config);
        let hard_timeout = match class {
            PlatformClass::Restricted => Some(self.config.raster_timeout()),
            PlatformClass::Unrestricted => None,
        };
        let artifact = rasterize(Arc::clone(&self.converter), snapshot, options, class, hard_timeout).await?;

        session.advance(SessionState::Delivering)?;
        deliver(
            self.host.as_ref(),
            class,
            &invoice.invoice_number,
            &artifact,
            lifecycle.target_mut(),
        )
        .await
    }
}
