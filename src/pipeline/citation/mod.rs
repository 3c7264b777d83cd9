//! Citation extraction and verification.
//!
//! Extraction is pure pattern matching over generated text. Verification
//! asks an [`AuthoritySearch`] whether each citation refers to a real
//! authority and classifies the answer.

pub mod authority;
pub mod extract;
pub mod types;
pub mod verify;

use std::sync::Arc;

use thiserror::Error;

use crate::pipeline_config::PipelineConfig;

pub use authority::{AuthorityHit, AuthoritySearch, HttpAuthoritySearch, InMemoryAuthority};
pub use extract::{extract, normalize};
pub use types::*;
pub use verify::CitationVerifier;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthorityError {
    #[error("Authority request failed: {0}")]
    Http(String),

    #[error("Authority returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid authority response: {0}")]
    InvalidResponse(String),

    #[error("No authority service configured")]
    NotConfigured,

    #[error("Environment variable {0} is not set")]
    MissingApiKey(String),
}

/// Build the HTTP authority client described by `config.verifier`.
pub fn connect_authority(config: &PipelineConfig) -> Result<Arc<dyn AuthoritySearch>, AuthorityError> {
    let verifier = &config.verifier;
    let url = verifier
        .authority_url
        .as_deref()
        .ok_or(AuthorityError::NotConfigured)?;

    let api_key = match &verifier.api_key_env {
        Some(var) => Some(std::env::var(var).map_err(|_| AuthorityError::MissingApiKey(var.clone()))?),
        None => None,
    };

    tracing::info!(url, "Connecting citation authority");
    Ok(Arc::new(HttpAuthoritySearch::new(
        url,
        api_key,
        verifier.citation_timeout(),
    )?))
}
