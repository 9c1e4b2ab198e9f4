//! In-memory device driven by a script of frames. Used by unit tests and the
//! scenario harness.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::frame::encode_png;
use crate::sleep::sleep_unless_stopped;
use crate::types::{Frame, StopFlag};
use super::Device;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Shell(String),
    Screencap,
    Reconnect,
    RelaunchEmulator,
}

struct Script {
    frames: VecDeque<Vec<u8>>,
    idle: Vec<u8>,
    replies: Vec<(String, String)>,
    failures: u32,
    stall: Option<(u32, Duration)>,
    link_down: bool,
    events: Vec<DeviceEvent>,
}

/// Serves queued frames in order, then repeats the idle frame forever.
pub struct ScriptedDevice {
    script: Mutex<Script>,
}

impl ScriptedDevice {
    pub fn new(idle: &Frame) -> Result<Self> {
        Ok(Self {
            script: Mutex::new(Script {
                frames: VecDeque::new(),
                idle: encode_png(idle)?,
                replies: Vec::new(),
                failures: 0,
                stall: None,
                link_down: false,
                events: Vec::new(),
            }),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> Result<T> {
        let mut script = self.script.lock().map_err(|_| anyhow!("script lock poisoned"))?;
        Ok(f(&mut script))
    }

    pub fn push_frame(&self, frame: &Frame) -> Result<()> {
        let png = encode_png(frame)?;
        self.with(|s| s.frames.push_back(png))
    }

    /// Raw payload served as-is, e.g. a corrupt or empty screencap.
    pub fn push_raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.with(|s| s.frames.push_back(bytes))
    }

    pub fn set_idle(&self, frame: &Frame) -> Result<()> {
        let png = encode_png(frame)?;
        self.with(|s| s.idle = png)
    }

    /// Answer shell commands starting with `prefix` with `output`.
    pub fn reply(&self, prefix: &str, output: &str) -> Result<()> {
        self.with(|s| s.replies.push((prefix.to_string(), output.to_string())))
    }

    /// The next `n` shell or screencap calls fail.
    pub fn fail_next(&self, n: u32) -> Result<()> {
        self.with(|s| s.failures = n)
    }

    /// The next `n` shell or screencap calls block for `delay` first.
    pub fn stall_next(&self, n: u32, delay: Duration) -> Result<()> {
        self.with(|s| s.stall = Some((n, delay)))
    }

    /// Reconnects block until the stop flag is raised, then fail.
    pub fn keep_link_down(&self) -> Result<()> {
        self.with(|s| s.link_down = true)
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.with(|s| s.events.clone()).unwrap_or_default()
    }

    pub fn shell_log(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::Shell(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn screencaps(&self) -> usize {
        self.events().iter().filter(|e| **e == DeviceEvent::Screencap).count()
    }

    /// Record the call; returns how long to stall and whether it should fail.
    fn begin(&self, event: DeviceEvent) -> Result<(Option<Duration>, bool)> {
        self.with(|s| {
            s.events.push(event);
            let stall = match s.stall.as_mut() {
                Some((n, delay)) if *n > 0 => {
                    *n -= 1;
                    Some(*delay)
                }
                _ => None,
            };
            let fail = s.failures > 0;
            if fail {
                s.failures -= 1;
            }
            (stall, fail)
        })
    }
}

impl Device for ScriptedDevice {
    fn serial(&self) -> &str {
        "scripted:0"
    }

    fn shell(&self, cmd: &str) -> Result<String> {
        let (stall, fail) = self.begin(DeviceEvent::Shell(cmd.to_string()))?;
        if let Some(d) = stall {
            thread::sleep(d);
        }
        if fail {
            bail!("scripted failure on shell({cmd})");
        }
        self.with(|s| {
            s.replies
                .iter()
                .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default()
        })
    }

    fn screencap(&self) -> Result<Vec<u8>> {
        let (stall, fail) = self.begin(DeviceEvent::Screencap)?;
        if let Some(d) = stall {
            thread::sleep(d);
        }
        if fail {
            bail!("scripted failure on screencap");
        }
        self.with(|s| s.frames.pop_front().unwrap_or_else(|| s.idle.clone()))
    }

    fn reconnect(&self, stop: &StopFlag) -> Result<()> {
        let down = self.with(|s| {
            s.events.push(DeviceEvent::Reconnect);
            s.link_down
        })?;
        if down {
            while sleep_unless_stopped(stop, Duration::from_millis(20)) {}
            bail!("scripted link stayed down");
        }
        Ok(())
    }

    fn relaunch_emulator(&self, _stop: &StopFlag) -> Result<()> {
        self.with(|s| s.events.push(DeviceEvent::RelaunchEmulator))
    }
}
