pub mod face_tracker;
pub mod rect_transformer;
