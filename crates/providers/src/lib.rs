//! Oracle implementations for Threadloom.
//!
//! All oracles implement the `threadloom_core::Oracle` trait.

pub mod openai_compat;

use std::sync::Arc;

use threadloom_config::OracleConfig;
use threadloom_core::Oracle;
use threadloom_core::error::OracleError;

pub use openai_compat::OpenAiCompatOracle;

/// Build the oracle named by the `[oracle]` config section.
pub fn build_oracle(config: &OracleConfig) -> Result<Arc<dyn Oracle>, OracleError> {
    match config.provider.as_str() {
        "openai" | "openrouter" | "ollama" | "compatible" => {
            Ok(Arc::new(OpenAiCompatOracle::from_config(config)?))
        }
        other => Err(OracleError::NotConfigured(format!("unknown oracle provider '{other}'"))),
    }
}
