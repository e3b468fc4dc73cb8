mod engine;
pub mod error;

pub use engine::SledStorageEngine;
