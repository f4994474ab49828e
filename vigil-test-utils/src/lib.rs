//! In-memory capability fakes and fixtures for vigil tests.
//!
//! The fakes implement the real capability traits, so a whole service can be
//! wired together in a test without a broker, an object store, a key/value
//! store, or a GPU box anywhere near it.

mod memory_broker;
mod memory_status;
mod memory_store;
mod scripted_models;

pub use memory_broker::MemoryBroker;
pub use memory_status::MemoryStatusStore;
pub use memory_store::MemoryObjectStore;
pub use scripted_models::ScriptedModels;

use image::{Rgb, RgbImage};

/// A small solid-color image.
pub fn solid_image(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(color))
}

/// JPEG bytes of a small solid-color frame.
pub fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    vigil_models::imaging::encode_jpeg(&solid_image(width, height, [40, 80, 120]))
        .expect("can encode fixture image")
}
