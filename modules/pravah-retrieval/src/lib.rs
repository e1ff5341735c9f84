pub mod engine;
pub mod fusion;

pub use engine::RetrievalEngine;
