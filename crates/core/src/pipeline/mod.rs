pub mod face_pipeline;
pub mod pipeline_event;
pub mod pipeline_logger;
pub mod recognition_stages;
pub mod stability_buffer;
