//! Frame buffers and primitive drawing for the lookout pipeline.
//!
//! # Frames and Images
//!
//! A [`Frame`] is what capture devices produce: an immutable, cheaply cloneable pixel buffer in
//! one of a few [`PixelLayout`]s. Frames are handed from the capture loop to the workers and never
//! change afterwards.
//!
//! An [`Image`] is an owned, mutable RGBA buffer. Rendering converts a [`Frame`] into an [`Image`]
//! and draws the detection overlay onto it using the functions in [`draw`].

pub mod draw;

mod color;
mod frame;
mod image;
mod rect;
mod resolution;


pub use color::Color;
pub use frame::{Frame, PixelLayout};
pub use image::Image;
pub use rect::Rect;
pub use resolution::Resolution;
