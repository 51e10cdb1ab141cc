pub mod engine;
pub mod pipeline;
pub mod recognition;
pub mod shared;
pub mod tracking;
