//! kvm-broadcast - WebRTC media broadcast core for IP-KVM appliances
//!
//! Captured H.264 video and Opus audio are paced out once per frame period
//! and fanned out to every connected browser peer.

pub mod config;
pub mod error;
pub mod media;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
