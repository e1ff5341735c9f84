pub mod types;
pub mod config;
pub mod error;
pub mod job;
pub mod messages;
pub mod providers;
pub mod retry;

pub use types::*;
pub use config::{Config, LlmConfig, PipelineConfig, RetrievalConfig, SynthesisConfig};
pub use error::PravahError;
pub use job::{AckOutcome, Job, JobState};
pub use messages::*;
pub use providers::*;
pub use retry::{retry_transient, RetryPolicy};
