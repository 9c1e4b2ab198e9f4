pub mod adb;
pub mod scripted;
pub mod stub;

use std::sync::Arc;

use anyhow::Result;

use crate::logger;
use crate::settings::Settings;
use crate::types::StopFlag;

/// Raw access to the emulated phone. Every call may block or fail; the
/// command channel decides what to do about it.
pub trait Device: Send + Sync {
    fn serial(&self) -> &str;
    fn shell(&self, cmd: &str) -> Result<String>;
    /// PNG-encoded screenshot.
    fn screencap(&self) -> Result<Vec<u8>>;
    /// Re-establish the link. Gives up early once `stop` is raised.
    fn reconnect(&self, stop: &StopFlag) -> Result<()>;
    fn relaunch_emulator(&self, stop: &StopFlag) -> Result<()>;
}

/// Create the device back-end: the adb bridge, or an in-memory stub.
pub fn create_device(force_stub: bool, settings: &Settings) -> Arc<dyn Device> {
    if force_stub {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return Arc::new(stub::StubDevice::new());
    }
    Arc::new(adb::AdbDevice::new(settings))
}
