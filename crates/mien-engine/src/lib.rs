//! mien-engine — Face identity resolution engine.
//!
//! Ties a pluggable feature-extraction backend to persistent identity
//! bookkeeping: detections go in, extraction runs off-thread, and the
//! resolver decides whether each face is someone known, a duplicate record
//! to merge, or a new identity to enroll.

pub mod config;
pub mod engine;
pub mod resolver;
mod worker;

pub use config::EngineConfig;
pub use engine::{EngineError, FaceIdEngine, IdentityReport, KnownIdentity};
pub use resolver::{IdentityResolver, ResolveOutcome, ResolverError};
