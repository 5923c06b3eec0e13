pub mod image;
pub mod writer;

pub use image::{Architecture, Slice, Universal};
