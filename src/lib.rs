//! Verified generation: chunked LLM generation over large document sets,
//! consolidation into one result, and citation verification with bounded
//! regeneration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use verigen::pipeline::citation::connect_authority;
//! use verigen::pipeline::gateway;
//! use verigen::pipeline::prompt_templates::PromptTemplate;
//! use verigen::{Document, EventSink, GenerationRequest, PipelineConfig, VerificationPolicy, VerifiedPipeline};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! verigen::init_tracing();
//! let config = PipelineConfig::load()?;
//! let events = EventSink::disabled();
//! let pipeline = VerifiedPipeline::new(
//!     config.clone(),
//!     gateway::connect(&config, events.clone())?,
//!     connect_authority(&config)?,
//!     events,
//! )?;
//!
//! let request = GenerationRequest::new(
//!     vec![Document::primary("claim.txt", std::fs::read_to_string("claim.txt")?)],
//!     PromptTemplate::new("Summarise the claim.")?,
//!     "markdown",
//!     VerificationPolicy::strict(3),
//! );
//! let output = pipeline.run(request).await?.into_accepted()?;
//! println!("{}", output.result.content);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod pipeline;
pub mod pipeline_config;

use tracing_subscriber::EnvFilter;

pub use pipeline::{
    Document, DocumentRole, EventSink, GenerationRequest, GroundingPolicy, GroundingRequest,
    OutcomeStatus, PipelineError, PipelineEvent, PipelineOutput, Stage, VerificationMode,
    VerificationPolicy, VerifiedPipeline,
};
pub use pipeline_config::PipelineConfig;

/// Install the global `tracing` subscriber. `RUST_LOG` wins over the
/// crate default filter. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();

    tracing::debug!("{} v{} tracing initialised", config::APP_NAME, config::APP_VERSION);
}
