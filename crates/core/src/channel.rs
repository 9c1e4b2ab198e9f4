//! Retrying, timeout-guarded wrapper around a `Device`.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::interrupt::{Interrupt, Step};
use crate::logger;
use crate::platform::Device;
use crate::types::{Point, StopFlag, Swipe};

pub const KEYCODE_BACK: &str = "KEYCODE_BACK";

/// Every device call runs on a throwaway worker joined with a timeout. A call
/// that hangs or fails triggers a reconnect and is retried until it succeeds
/// or the stop flag is raised.
pub struct CommandChannel {
    device: Arc<dyn Device>,
    stop: StopFlag,
    timeout: Duration,
    resets: u32,
}

impl CommandChannel {
    pub fn new(device: Arc<dyn Device>, stop: StopFlag, timeout: Duration) -> Self {
        Self { device, stop, timeout, resets: 0 }
    }

    /// Reconnects performed so far.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    fn call<T, F>(&mut self, what: &str, job: F) -> Step<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Device) -> Result<T> + Clone + Send + 'static,
    {
        loop {
            if self.stop.is_set() {
                return Err(Interrupt::Stop);
            }
            let (tx, rx) = mpsc::channel();
            let device = Arc::clone(&self.device);
            let worker = job.clone();
            // A hung worker is abandoned, never joined.
            thread::spawn(move || {
                tx.send(worker(device.as_ref())).ok();
            });
            match rx.recv_timeout(self.timeout) {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => logger::warn_p("adb", &format!("{} failed: {:#}", what, e)),
                Err(RecvTimeoutError::Timeout) => {
                    logger::warn_p("adb", &format!("{} timed out after {:?}", what, self.timeout))
                }
                Err(RecvTimeoutError::Disconnected) => logger::warn_p("adb", &format!("{} worker vanished", what)),
            }
            if self.stop.is_set() {
                return Err(Interrupt::Stop);
            }
            self.reset()?;
        }
    }

    /// Full reconnect of the device link. `Err(Stop)` if the stop flag was
    /// raised while reconnecting.
    pub fn reset(&mut self) -> Step<()> {
        self.resets += 1;
        logger::info_p("adb", &format!("resetting connection to {}", self.device.serial()));
        if let Err(e) = self.device.reconnect(&self.stop) {
            logger::error_p("adb", &format!("reconnect failed: {:#}", e));
        }
        if self.stop.is_set() {
            return Err(Interrupt::Stop);
        }
        Ok(())
    }

    pub fn shell(&mut self, cmd: &str) -> Step<String> {
        logger::debug_p("adb", &format!("shell {}", cmd));
        let cmd = cmd.to_string();
        self.call("shell", move |d: &dyn Device| d.shell(&cmd))
    }

    pub fn screencap(&mut self) -> Step<Vec<u8>> {
        self.call("screencap", |d: &dyn Device| d.screencap())
    }

    pub fn tap(&mut self, p: Point) -> Step<()> {
        self.shell(&format!("input tap {} {}", p.x, p.y)).map(drop)
    }

    pub fn swipe(&mut self, s: Swipe) -> Step<()> {
        self.shell(&s.shell()).map(drop)
    }

    pub fn key(&mut self, code: &str) -> Step<()> {
        self.shell(&format!("input keyevent {}", code)).map(drop)
    }

    /// Device wall clock in seconds; also retried through reconnects.
    pub fn device_time(&mut self) -> Step<f64> {
        self.call("date", |d: &dyn Device| {
            let out = d.shell("date +%s.%N")?;
            out.trim().parse::<f64>().map_err(|e| anyhow!("bad date output {:?}: {}", out.trim(), e))
        })
    }

    pub fn relaunch_emulator(&mut self) -> Step<()> {
        if let Err(e) = self.device.relaunch_emulator(&self.stop) {
            logger::error_p("adb", &format!("emulator relaunch failed: {:#}", e));
        }
        if self.stop.is_set() {
            return Err(Interrupt::Stop);
        }
        Ok(())
    }
}
