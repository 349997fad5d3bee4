//! Runtime configuration assembled from the command line.

use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Model identifier (GGUF path or served model name).
    pub model: String,
    pub db_path: PathBuf,
    /// Base URL of the OpenAI-compatible engine endpoint.
    pub engine_url: String,
    pub retrieval: RetrievalConfig,
}

/// Retrieval tunables. The candidate limits bound the keyword stage so
/// the vector rerank never touches the whole table.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub candidate_limit_short: i64,
    pub candidate_limit_long: i64,
    /// Queries at or above this many runes use the long candidate limit.
    pub long_query_runes: usize,
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit_short: 400,
            candidate_limit_long: 800,
            long_query_runes: 30,
            top_k: 5,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(Error::InvalidInput("retrieval.top_k must be > 0".into()));
        }
        if self.retrieval.candidate_limit_short <= 0 || self.retrieval.candidate_limit_long <= 0 {
            return Err(Error::InvalidInput(
                "retrieval candidate limits must be > 0".into(),
            ));
        }
        Ok(())
    }
}
