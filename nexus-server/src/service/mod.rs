//! Service Module
//!
//! Business logic between the HTTP surface and the repositories. Services
//! validate requests at the boundary and own the status-precondition rules.

pub mod artifact;
pub mod gpu;
pub mod job;

// Re-export for convenience
pub use artifact as artifact_service;
pub use gpu as gpu_service;
pub use job as job_service;
