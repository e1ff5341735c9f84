pub mod classifier;
pub mod llm;
pub mod merge;
pub mod server;
pub mod synthesis;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod worker;

pub use classifier::{Classification, Classifier};
pub use llm::OpenAi;
pub use merge::MergeLayer;
pub use synthesis::Stage2Worker;
pub use worker::{AckSink, BatchReport, Deduplicator, HttpAckSink, ItemReport, Stage1Worker};
