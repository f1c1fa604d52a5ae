//! Configuration handlers

pub mod types;
mod video;

pub use video::{get_video_config, update_video_config};
