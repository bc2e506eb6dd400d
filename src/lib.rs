//! Invoice document generation.
//!
//! Turns a stored invoice into a paginated PDF and hands it to the user in a
//! way the client platform allows: a direct download where downloads work, an
//! embedded view in a pre-opened viewer where they don't.
//!
//! [`pipeline::DocumentGenerator::generate_document`] is the entry point.

pub mod config;
pub mod delivery;
pub mod desktop;
pub mod document;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod platform;
pub mod raster;
pub mod resources;
pub mod session;
pub mod store;
pub mod surface;

pub use delivery::DeliveryMethod;
pub use error::GenerationError;
pub use lifecycle::{GenerationOutcome, Notification, Notifier};
pub use pipeline::DocumentGenerator;
pub use platform::{ClientEnvironment, PlatformClass};
