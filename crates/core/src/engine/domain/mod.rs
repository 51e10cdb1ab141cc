pub mod engine_error;
pub mod engine_handle;
pub mod face_engine;
