pub mod annotate;
pub mod background_model;
pub mod blob_detector;
pub mod frame;
pub mod motion_detector;
pub mod smart_blob;
pub mod synthetic;
