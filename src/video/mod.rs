pub mod camera;

pub use camera::{CameraCapture, CameraConfig, FrameSource};
