pub mod attributes;
pub mod clients;
pub mod config;
pub mod error;
pub mod keys;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod retry;

pub use attributes::AttributeSet;
pub use config::GenerationConfig;
pub use error::{AttrGenError, Result};
pub use pipeline::{GenerationStats, Pipeline};
