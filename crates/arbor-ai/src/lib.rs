//! Enrichment of analysis results for Arbor
//!
//! After each scheduler cycle the successful analysis outcomes can be passed
//! to an [`EnrichmentBackend`], which returns free-form insights and
//! recommendations. The backend is picked once from configuration.

pub mod bridge;
pub mod prompt;
pub mod providers;

#[cfg(test)]
pub mod tests;

pub use bridge::*;
pub use providers::{create_backend, from_config};
