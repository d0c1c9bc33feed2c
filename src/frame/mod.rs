//! Per-frame image data: payload, camera model, pyramid and pixel selection.

pub mod camera;
pub mod image;
pub mod pixel_selector;
pub mod pyramid;

pub use camera::CameraModel;
pub use image::{ImageAndExposure, PhotometricResponse};
pub use pixel_selector::{Candidate, PixelSelector, PixelSelectorSettings};
pub use pyramid::{ImagePyramid, PyramidLevel};
