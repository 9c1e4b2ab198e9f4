use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use image::{Rgb, RgbImage};

use crate::frame::{encode_png, FRAME_HEIGHT, FRAME_WIDTH};
use crate::logger;
use crate::types::StopFlag;
use super::Device;

/// Offline device: logs every call and always shows a blank portrait screen.
pub struct StubDevice {
    serial: String,
    screen: RgbImage,
}

impl StubDevice {
    pub fn new() -> Self {
        Self {
            serial: "stub:0".into(),
            screen: RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([24, 24, 32])),
        }
    }
}

impl Default for StubDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for StubDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, cmd: &str) -> Result<String> {
        logger::info_p("stub", &format!("shell(\"{}\")", cmd));
        if cmd.starts_with("date") {
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
            return Ok(format!("{:.6}\n", now.as_secs_f64()));
        }
        Ok(String::new())
    }

    fn screencap(&self) -> Result<Vec<u8>> {
        logger::debug_p("stub", "screencap()");
        encode_png(&self.screen)
    }

    fn reconnect(&self, _stop: &StopFlag) -> Result<()> {
        logger::info_p("stub", "reconnect()");
        Ok(())
    }

    fn relaunch_emulator(&self, _stop: &StopFlag) -> Result<()> {
        logger::info_p("stub", "relaunch_emulator()");
        Ok(())
    }
}
