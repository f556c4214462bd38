mod engine;
mod segment;

pub use engine::ArqEngine;
pub use segment::{Command, SegmentHeader};
