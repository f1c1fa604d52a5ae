use serde::Deserialize;

use crate::config::VideoConfig;
use crate::error::AppError;

// ===== Video Config =====
#[derive(Debug, Default, Deserialize)]
pub struct VideoConfigUpdate {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub bitrate_kbps: Option<u32>,
}

impl VideoConfigUpdate {
    pub fn validate(&self) -> crate::error::Result<()> {
        if let Some(width) = self.width {
            if !(320..=7680).contains(&width) {
                return Err(AppError::BadRequest("Invalid width: must be 320-7680".into()));
            }
        }
        if let Some(height) = self.height {
            if !(240..=4320).contains(&height) {
                return Err(AppError::BadRequest("Invalid height: must be 240-4320".into()));
            }
        }
        if let Some(fps) = self.fps {
            if !(1..=120).contains(&fps) {
                return Err(AppError::BadRequest("Invalid fps: must be 1-120".into()));
            }
        }
        if let Some(bitrate) = self.bitrate_kbps {
            if !(100..=50000).contains(&bitrate) {
                return Err(AppError::BadRequest(
                    "Invalid bitrate: must be 100-50000 kbps".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut VideoConfig) {
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(bitrate) = self.bitrate_kbps {
            config.bitrate_kbps = bitrate;
        }
    }
}
