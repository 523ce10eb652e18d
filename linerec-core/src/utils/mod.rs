//! Utility functions for line images.

pub mod image;

pub use self::image::{gray_to_chw, load_line_image, load_line_images, resize_to_height};
