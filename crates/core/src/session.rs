//! One engine run: settings, quest, device link and every piece of mutable
//! state the state machine reads and writes.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use crate::channel::{CommandChannel, KEYCODE_BACK};
use crate::frame::{self, Geometry};
use crate::interrupt::{Interrupt, Step};
use crate::logger;
use crate::matcher::{Roi, TemplateLibrary};
use crate::platform::Device;
use crate::poller::RetryPolicy;
use crate::quest::{FarmQuest, SpellSequence};
use crate::recovery;
use crate::sleep::{self, Clock};
use crate::settings::Settings;
use crate::types::{Counters, Frame, Milestone, Point, StopFlag, Swipe};

/// Link resets tolerated for captures of an unknown size before giving up.
pub const WRONG_SIZE_RESETS: u32 = 5;

/// Mutable state of one run. Lives exactly as long as the engine thread's run.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub counters: Counters,
    /// Start of the current Inn-to-Inn lap.
    pub lap_started: Option<Duration>,
    pub total_time: Duration,
    pub last_lap: Duration,

    pub combat_started: Option<Duration>,
    pub chest_started: Option<Duration>,
    pub combat_time: Duration,
    pub chest_time: Duration,
    pub met_chest_or_combat: bool,

    pub enough_aoe: bool,
    pub aoe_casts: u32,
    pub speed_applied: bool,
    pub self_sacrifice: bool,
    pub active_sequence: Option<SpellSequence>,
    pub should_apply_sequence: bool,
    pub recover_after_revive: bool,

    pub world_map_zoomed: bool,
    pub crash_counter: u32,
    pub stepped_after_restart: bool,
    pub resume_available: bool,

    pub notable: Vec<String>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            counters: Counters::default(),
            lap_started: None,
            total_time: Duration::ZERO,
            last_lap: Duration::ZERO,
            combat_started: None,
            chest_started: None,
            combat_time: Duration::ZERO,
            chest_time: Duration::ZERO,
            met_chest_or_combat: false,
            enough_aoe: false,
            aoe_casts: 0,
            speed_applied: false,
            self_sacrifice: false,
            active_sequence: None,
            should_apply_sequence: true,
            recover_after_revive: false,
            world_map_zoomed: false,
            crash_counter: 0,
            stepped_after_restart: true,
            resume_available: false,
            notable: Vec::new(),
        }
    }
}

pub struct Session {
    pub settings: Settings,
    pub quest: FarmQuest,
    pub ctx: RuntimeContext,
    pub channel: CommandChannel,
    pub templates: TemplateLibrary,
    pub retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    stop: StopFlag,
    progress: Option<Sender<Milestone>>,
    diagnostics: Option<PathBuf>,
}

impl Session {
    pub fn new(settings: Settings, quest: FarmQuest, device: Arc<dyn Device>, clock: Arc<dyn Clock>, stop: StopFlag) -> Self {
        let timeout = Duration::from_millis(settings.command_timeout_ms);
        Self {
            templates: TemplateLibrary::new(settings.images_dir()),
            retry: settings.retry_policy(),
            channel: CommandChannel::new(device, stop.clone(), timeout),
            ctx: RuntimeContext::default(),
            settings,
            quest,
            clock,
            stop,
            progress: None,
            diagnostics: None,
        }
    }

    pub fn with_progress(mut self, tx: Sender<Milestone>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Directory for restart screenshots. Without one no screenshot is taken.
    pub fn with_diagnostics(mut self, dir: impl Into<PathBuf>) -> Self {
        self.diagnostics = Some(dir.into());
        self
    }

    pub fn diagnostics_dir(&self) -> Option<&Path> {
        self.diagnostics.as_deref()
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn check_stop(&self) -> Step<()> {
        if self.stop.is_set() {
            Err(Interrupt::Stop)
        } else {
            Ok(())
        }
    }

    /// Raise the stop flag and wrap `err` for propagation.
    pub fn fatal(&self, err: anyhow::Error) -> Interrupt {
        logger::error(&format!("aborting run: {:#}", err));
        self.stop.set();
        Interrupt::Fatal(err)
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn sleep(&self, secs: f64) -> Step<()> {
        self.clock.sleep(Duration::from_secs_f64(secs.max(0.0)));
        self.check_stop()
    }

    /// `sleep` with +/-30% jitter, for taps that should not look scripted.
    pub fn sleep_jitter(&self, secs: f64) -> Step<()> {
        self.clock.sleep(sleep::jitter(secs));
        self.check_stop()
    }

    /// Current screen, portrait 900x1600. Undecodable payloads reset the link
    /// and try again; a landscape frame forces a restart. A frame of any other
    /// size is retried through `WRONG_SIZE_RESETS` resets, then is fatal.
    pub fn capture(&mut self) -> Step<Frame> {
        let mut wrong_size = 0;
        loop {
            let bytes = self.channel.screencap()?;
            match frame::decode(&bytes) {
                Ok(f) => match frame::geometry(&f) {
                    Geometry::Portrait => return Ok(f),
                    Geometry::Landscape => {
                        logger::error_p("restart", "capture came back landscape");
                        return Err(recovery::restart_game(self, true));
                    }
                    Geometry::Unexpected(w, h) => {
                        if wrong_size >= WRONG_SIZE_RESETS {
                            return Err(self.fatal(anyhow!(
                                "capture size {}x{} is not {}x{} after {} link resets",
                                w, h, frame::FRAME_WIDTH, frame::FRAME_HEIGHT, wrong_size
                            )));
                        }
                        wrong_size += 1;
                        logger::warn_p("adb", &format!("unexpected capture size {}x{}", w, h))
                    }
                },
                Err(e) => logger::warn_p("adb", &format!("bad capture: {:#}", e)),
            }
            self.channel.reset()?;
        }
    }

    pub fn find(&mut self, frame: &Frame, name: &str) -> Option<Point> {
        self.templates.find(frame, name, None)
    }

    pub fn find_in(&mut self, frame: &Frame, name: &str, roi: &Roi) -> Option<Point> {
        self.templates.find(frame, name, Some(roi))
    }

    /// Every distinct hit of `name` inside `roi`, strongest first.
    pub fn find_all_in(&mut self, frame: &Frame, name: &str, roi: &Roi) -> Vec<Point> {
        self.templates.find_all(frame, name, Some(roi))
    }

    pub fn tap(&mut self, p: Point) -> Step<()> {
        self.channel.tap(p)
    }

    /// Tap `p` when present. Returns whether anything was tapped.
    pub fn press(&mut self, p: Option<Point>) -> Step<bool> {
        match p {
            Some(p) => self.tap(p).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn back(&mut self) -> Step<()> {
        self.channel.key(KEYCODE_BACK)
    }

    pub fn swipe(&mut self, s: Swipe) -> Step<()> {
        self.channel.swipe(s)
    }

    pub fn shell(&mut self, cmd: &str) -> Step<String> {
        self.channel.shell(cmd)
    }

    /// Append to the notable-events log shown in the lap summary.
    pub fn note(&mut self, event: &str) {
        logger::info(event);
        self.ctx.notable.push(event.to_string());
        self.emit(Milestone::Notable(event.to_string()));
    }

    pub fn emit(&self, m: Milestone) {
        if let Some(tx) = &self.progress {
            tx.send(m).ok();
        }
    }

    pub fn emit_counters(&self) {
        self.emit(Milestone::Counters(self.ctx.counters));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::platform::scripted::ScriptedDevice;
    use crate::sleep::ManualClock;
    use image::{imageops, Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub fn quest() -> FarmQuest {
        FarmQuest::parse(
            r#"{ "q": { "type": "dungeon", "waypoints": [["harken", null, "default"]] } }"#,
            "q",
        )
        .unwrap()
    }

    pub fn blank() -> Frame {
        RgbImage::from_pixel(900, 1600, Rgb([20, 20, 30]))
    }

    pub fn noise(w: u32, h: u32, seed: u64) -> Frame {
        let mut rng = StdRng::seed_from_u64(seed);
        Frame::from_fn(w, h, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
    }

    /// 64x48 icon of 8 px colour blocks; survives the matcher's downscaled pass
    /// when pasted on a multiple of 8.
    pub fn icon(seed: u64) -> Frame {
        let blocks = noise(8, 6, seed);
        Frame::from_fn(64, 48, |x, y| *blocks.get_pixel(x / 8, y / 8))
    }

    /// `blank()` with each `(template, top-left)` pasted in.
    pub fn scene(parts: &[(&Frame, u32, u32)]) -> Frame {
        let mut f = blank();
        for (t, x, y) in parts {
            imageops::replace(&mut f, *t, *x as i64, *y as i64);
        }
        f
    }

    pub struct Rig {
        pub device: Arc<ScriptedDevice>,
        pub clock: Arc<ManualClock>,
        pub session: Session,
    }

    pub fn rig_with(settings: Settings, quest: FarmQuest) -> Rig {
        let device = Arc::new(ScriptedDevice::new(&blank()).unwrap());
        device
            .reply("cmd package resolve-activity", "priority=0\njp.co.drecom.wizardry.daphne/.MainActivity\n")
            .unwrap();
        let clock = Arc::new(ManualClock::new());
        let settings = Settings { resource_dir: PathBuf::from("/nonexistent"), ..settings };
        let session = Session::new(settings, quest, device.clone(), clock.clone(), StopFlag::new());
        Rig { device, clock, session }
    }

    pub fn rig() -> Rig {
        rig_with(Settings::default(), quest())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::platform::scripted::DeviceEvent;

    #[test]
    fn capture_of_wrong_size_becomes_fatal() {
        let mut r = rig();
        for _ in 0..=WRONG_SIZE_RESETS {
            r.device.push_frame(&Frame::new(720, 1280)).unwrap();
        }
        assert!(matches!(r.session.capture(), Err(Interrupt::Fatal(_))));
        assert!(r.session.stop_flag().is_set());
        assert_eq!(r.session.channel.resets(), WRONG_SIZE_RESETS);
        assert_eq!(r.device.screencaps(), WRONG_SIZE_RESETS as usize + 1);
        assert!(!r.device.shell_log().iter().any(|c| c.starts_with("am force-stop")));
    }

    #[test]
    fn capture_resets_link_on_garbage() {
        let mut r = rig();
        r.device.push_raw(Vec::new()).unwrap();
        r.device.push_raw(b"junk".to_vec()).unwrap();
        r.device.push_frame(&Frame::new(720, 1280)).unwrap();
        let f = r.session.capture().unwrap();
        assert_eq!(f.dimensions(), (900, 1600));
        assert_eq!(r.device.screencaps(), 4);
        assert_eq!(r.session.channel.resets(), 3);
    }

    #[test]
    fn landscape_capture_forces_restart_without_screenshot() {
        let mut r = rig();
        r.device.push_frame(&Frame::new(1600, 900)).unwrap();
        assert!(matches!(r.session.capture(), Err(Interrupt::Restart)));
        assert_eq!(r.session.ctx.crash_counter, 1);
        assert_eq!(r.session.ctx.counters.restarts, 1);
        let log = r.device.shell_log();
        assert!(log.iter().any(|c| c == "am force-stop jp.co.drecom.wizardry.daphne"));
        assert!(log.iter().any(|c| c == "am start -n jp.co.drecom.wizardry.daphne/.MainActivity"));
        assert!(!r.device.events().contains(&DeviceEvent::RelaunchEmulator));
    }

    #[test]
    fn sleep_reports_stop() {
        let r = rig();
        r.session.sleep(1.5).unwrap();
        assert_eq!(r.clock.now(), Duration::from_millis(1500));
        r.session.stop_flag().set();
        assert!(matches!(r.session.sleep(1.0), Err(Interrupt::Stop)));
    }

    #[test]
    fn fatal_raises_stop_flag() {
        let r = rig();
        let i = r.session.fatal(anyhow::anyhow!("bad action"));
        assert!(matches!(i, Interrupt::Fatal(_)));
        assert!(r.session.stop_flag().is_set());
    }

    #[test]
    fn notes_reach_the_progress_sink() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut session = rig().session.with_progress(tx);
        session.note("someone died");
        assert_eq!(rx.try_recv().unwrap(), Milestone::Notable("someone died".into()));
        assert_eq!(session.ctx.notable, vec!["someone died"]);
    }
}
