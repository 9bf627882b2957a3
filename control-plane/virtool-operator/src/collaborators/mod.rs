//! Interfaces to the systems the engine reads and drives, with an in-memory
//! implementation for development and tests and a Kubernetes one for
//! production.

pub mod error;
pub mod k8s;
pub mod memory;
pub mod traits;

pub use error::CollaboratorError;
pub use traits::*;
