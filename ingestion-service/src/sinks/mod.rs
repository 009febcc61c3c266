pub mod engine;

pub use engine::{EngineSink, SinkStats};
