pub mod enroller;
pub mod identity_gallery;
pub mod matching_service;
pub mod recognition_registry;
pub mod recognize_entry;
