//! Frozen-screen detection and the force-relaunch that every stuck path ends in.

use std::collections::VecDeque;

use chrono::Local;
use image::GrayImage;
use regex::Regex;

use crate::frame;
use crate::interrupt::{Interrupt, Step};
use crate::logger;
use crate::session::Session;
use crate::types::Frame;

pub const FREEZE_WINDOW: usize = 10;
/// Summed consecutive-frame difference at or below which the screen is frozen.
pub const FREEZE_THRESHOLD: f32 = 0.15;
/// Orientation faults tolerated before the emulator itself is relaunched.
const CRASH_LIMIT: u32 = 5;

/// Sliding window over the last [`FREEZE_WINDOW`] frames.
#[derive(Default)]
pub struct FreezeDetector {
    window: VecDeque<GrayImage>,
}

impl FreezeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame; `true` once a full window shows no meaningful change.
    pub fn push(&mut self, frame: &Frame) -> bool {
        self.window.push_back(frame::to_gray(frame));
        if self.window.len() > FREEZE_WINDOW {
            self.window.pop_front();
        }
        if self.window.len() < FREEZE_WINDOW {
            return false;
        }
        let total: f32 = self
            .window
            .iter()
            .zip(self.window.iter().skip(1))
            .map(|(a, b)| frame::mean_abs_diff(a, b))
            .sum();
        logger::debug_p("restart", &format!("freeze window diff {:.4}", total));
        total <= FREEZE_THRESHOLD
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// Last `package/activity` line of `cmd package resolve-activity --brief`.
fn launch_activity(output: &str) -> Option<String> {
    let re = Regex::new(r"^[\w.]+/[\w.$]+$").ok()?;
    output
        .lines()
        .map(str::trim)
        .filter(|l| re.is_match(l))
        .last()
        .map(String::from)
}

fn save_diagnostic(s: &mut Session) -> Step<()> {
    let Some(dir) = s.diagnostics_dir().map(|d| d.to_path_buf()) else {
        return Ok(());
    };
    let bytes = s.channel.screencap()?;
    let path = dir.join(format!("{}.png", Local::now().format("%Y%m%d_%H%M%S")));
    match frame::decode(&bytes).and_then(|f| frame::save_png(&f, &path)) {
        Ok(()) => logger::info_p("restart", &format!("screenshot saved to {}", path.display())),
        Err(e) => logger::warn_p("restart", &format!("no screenshot: {:#}", e)),
    }
    Ok(())
}

fn relaunch(s: &mut Session, skip_screenshot: bool) -> Step<()> {
    s.ctx.speed_applied = false;
    s.retry.grow();
    s.ctx.combat_started = None;
    s.ctx.chest_started = None;
    s.ctx.world_map_zoomed = false;
    s.ctx.stepped_after_restart = false;
    s.ctx.counters.restarts += 1;
    s.emit_counters();
    logger::warn_p("restart", &format!("restarting game (poll limit now {})", s.retry.limit));

    if skip_screenshot {
        s.ctx.crash_counter += 1;
        if s.ctx.crash_counter > CRASH_LIMIT {
            s.ctx.crash_counter = 0;
            logger::error_p("restart", "repeated capture faults, relaunching emulator");
            s.channel.relaunch_emulator()?;
        }
    } else {
        save_diagnostic(s)?;
    }

    let package = s.settings.package_name.clone();
    let resolved = s.shell(&format!("cmd package resolve-activity --brief {}", package))?;
    s.shell(&format!("am force-stop {}", package))?;
    s.sleep(2.0)?;
    match launch_activity(&resolved) {
        Some(activity) => s.shell(&format!("am start -n {}", activity))?,
        None => {
            logger::warn_p("restart", "launch activity unresolved, using launcher intent");
            s.shell(&format!("monkey -p {} -c android.intent.category.LAUNCHER 1", package))?
        }
    };
    s.sleep(10.0)
}

/// Force-stop and relaunch the game, then hand back the restart signal.
/// `Stop` wins if the operator stops mid-relaunch.
pub fn restart_game(s: &mut Session, skip_screenshot: bool) -> Interrupt {
    match relaunch(s, skip_screenshot) {
        Ok(()) => Interrupt::Restart,
        Err(i) => i,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::scripted::DeviceEvent;
    use crate::session::testing::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn static_frames_freeze() {
        let mut d = FreezeDetector::new();
        let f = noise(90, 160, 1);
        let verdicts: Vec<bool> = (0..FREEZE_WINDOW).map(|_| d.push(&f)).collect();
        assert!(verdicts[..FREEZE_WINDOW - 1].iter().all(|v| !v));
        assert!(verdicts[FREEZE_WINDOW - 1]);
    }

    #[test]
    fn perturbed_frames_do_not_freeze() {
        let mut d = FreezeDetector::new();
        let base = noise(90, 160, 2);
        let mut rng = StdRng::seed_from_u64(3);
        let mut frozen = false;
        for _ in 0..FREEZE_WINDOW * 2 {
            let f = Frame::from_fn(90, 160, |x, y| {
                let p = base.get_pixel(x, y);
                let delta: i16 = rng.gen_range(-40..=40);
                Rgb(p.0.map(|c| (c as i16 + delta).clamp(0, 255) as u8))
            });
            frozen |= d.push(&f);
        }
        assert!(!frozen);
    }

    #[test]
    fn activity_is_last_component_line() {
        let out = "priority=0 preferredOrder=0\njp.co.drecom.wizardry.daphne/.MainActivity\n";
        assert_eq!(launch_activity(out).as_deref(), Some("jp.co.drecom.wizardry.daphne/.MainActivity"));
        assert_eq!(launch_activity("No activity found\n"), None);
    }

    #[test]
    fn restart_resets_transient_state() {
        let mut r = rig();
        r.session.ctx.speed_applied = true;
        r.session.ctx.world_map_zoomed = true;
        r.session.ctx.stepped_after_restart = true;
        r.session.ctx.combat_started = Some(std::time::Duration::from_secs(3));
        assert!(matches!(restart_game(&mut r.session, false), Interrupt::Restart));
        let ctx = &r.session.ctx;
        assert!(!ctx.speed_applied && !ctx.world_map_zoomed && !ctx.stepped_after_restart);
        assert!(ctx.combat_started.is_none());
        assert_eq!(r.session.retry.limit, 25);
        assert_eq!(
            r.device.shell_log(),
            vec![
                "cmd package resolve-activity --brief jp.co.drecom.wizardry.daphne",
                "am force-stop jp.co.drecom.wizardry.daphne",
                "am start -n jp.co.drecom.wizardry.daphne/.MainActivity",
            ]
        );
    }

    #[test]
    fn screenshot_saved_when_not_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = rig().session.with_diagnostics(dir.path());
        restart_game(&mut session, false);
        let pngs = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(pngs, 1);
    }

    #[test]
    fn repeated_capture_faults_relaunch_emulator() {
        let mut r = rig();
        for _ in 0..6 {
            restart_game(&mut r.session, true);
        }
        let relaunches = r.device.events().iter().filter(|e| **e == DeviceEvent::RelaunchEmulator).count();
        assert_eq!(relaunches, 1);
        assert_eq!(r.session.ctx.crash_counter, 0);
        assert_eq!(r.session.retry.limit, 50);
    }
}
