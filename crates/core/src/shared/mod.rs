pub mod config;
pub mod constants;
pub mod face_rect;
pub mod frame;
