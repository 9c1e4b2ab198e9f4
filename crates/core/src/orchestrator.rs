use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::farm;
use crate::interrupt::Interrupt;
use crate::logger;
use crate::platform::Device;
use crate::quest::FarmQuest;
use crate::session::Session;
use crate::settings::Settings;
use crate::sleep::SystemClock;
use crate::types::{Command, Milestone, OrchestratorState, StopFlag};

/// Everything needed to start a farm run.
pub struct Engine {
    pub settings: Settings,
    pub quest: FarmQuest,
    pub device: Arc<dyn Device>,
    pub progress: mpsc::Sender<Milestone>,
}

impl Engine {
    /// Fresh session on the wall clock, wired to the progress sink and the
    /// diagnostics directory.
    pub fn session(&self, stop: StopFlag) -> Session {
        let clock = Arc::new(SystemClock::new(stop.clone()));
        let logs: PathBuf = self.settings.logs_dir.clone();
        Session::new(self.settings.clone(), self.quest.clone(), Arc::clone(&self.device), clock, stop)
            .with_progress(self.progress.clone())
            .with_diagnostics(logs)
    }
}

/// Run the farm to completion on the current thread.
pub fn run_farm(mut session: Session) {
    match farm::farm(&mut session) {
        Ok(()) => logger::info("farm run ended"),
        Err(Interrupt::Fatal(e)) => logger::error(&format!("farm run failed: {:#}", e)),
        Err(e) => logger::warn(&format!("farm run ended with {}", e)),
    }
}

struct Run {
    stop: StopFlag,
    handle: JoinHandle<()>,
}

impl Run {
    fn start(engine: &Engine) -> Self {
        let stop = StopFlag::new();
        let session = engine.session(stop.clone());
        let handle = thread::spawn(move || run_farm(session));
        Self { stop, handle }
    }

    fn finish(self) {
        self.stop.set();
        if self.handle.join().is_err() {
            logger::error("farm thread panicked");
        }
    }
}

fn set_state(orch_state: &Mutex<OrchestratorState>, state: OrchestratorState) {
    if let Ok(mut s) = orch_state.lock() {
        *s = state;
    }
}

fn current_state(orch_state: &Mutex<OrchestratorState>) -> OrchestratorState {
    orch_state.lock().map(|s| *s).unwrap_or(OrchestratorState::Stopped)
}

/// Main orchestration loop. Runs on a background thread until `Quit` or
/// until the command sender is dropped.
///
/// The observer flips `orch_state` to `Running`/`Stopping` before sending
/// `StartStop`; this loop starts or stops the run to match and moves the
/// state back to `Stopped` once the farm thread is gone.
pub fn orchestrate(
    orch_state: Arc<Mutex<OrchestratorState>>,
    cmd_rx: mpsc::Receiver<Command>,
    engine: Engine,
) {
    let mut run: Option<Run> = None;

    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Command::Quit) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                logger::info("shutting down");
                if let Some(r) = run.take() {
                    r.finish();
                }
                set_state(&orch_state, OrchestratorState::Stopped);
                return;
            }
            Ok(Command::StartStop) => match current_state(&orch_state) {
                OrchestratorState::Running if run.is_none() => {
                    logger::info(&format!("starting \"{}\" on {}", engine.quest.name, engine.device.serial()));
                    run = Some(Run::start(&engine));
                }
                OrchestratorState::Stopping => {
                    logger::info("stopping...");
                    if let Some(r) = &run {
                        r.stop.set();
                    }
                }
                _ => {}
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if run.as_ref().is_some_and(|r| r.handle.is_finished()) {
            if let Some(r) = run.take() {
                r.finish();
            }
            set_state(&orch_state, OrchestratorState::Stopped);
            logger::info("orchestrator stopped");
        } else if run.is_none() && current_state(&orch_state) == OrchestratorState::Stopping {
            set_state(&orch_state, OrchestratorState::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::scripted::ScriptedDevice;
    use image::{Rgb, RgbImage};
    use std::time::Instant;

    fn engine(progress: mpsc::Sender<Milestone>) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ScriptedDevice::new(&RgbImage::from_pixel(900, 1600, Rgb([20, 20, 30]))).unwrap());
        let settings = Settings {
            resource_dir: dir.path().join("missing"),
            logs_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let quest = FarmQuest::parse(
            r#"{ "q": { "type": "dungeon", "waypoints": [["harken", null, "default"]] } }"#,
            "q",
        )
        .unwrap();
        (Engine { settings, quest, device, progress }, dir)
    }

    fn wait_for(orch_state: &Mutex<OrchestratorState>, want: OrchestratorState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if current_state(orch_state) == want {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn start_then_stop_finishes_the_task() {
        let (progress_tx, progress_rx) = mpsc::channel();
        let (engine, _dir) = engine(progress_tx);
        let orch_state = Arc::new(Mutex::new(OrchestratorState::Stopped));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let state = Arc::clone(&orch_state);
        let handle = thread::spawn(move || orchestrate(state, cmd_rx, engine));

        set_state(&orch_state, OrchestratorState::Running);
        cmd_tx.send(Command::StartStop).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(current_state(&orch_state), OrchestratorState::Running);

        set_state(&orch_state, OrchestratorState::Stopping);
        cmd_tx.send(Command::StartStop).unwrap();
        assert!(wait_for(&orch_state, OrchestratorState::Stopped));
        assert!(progress_rx.try_iter().any(|m| m == Milestone::TaskFinished));

        cmd_tx.send(Command::Quit).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn quit_while_running_joins_the_farm() {
        let (progress_tx, _progress_rx) = mpsc::channel();
        let (engine, _dir) = engine(progress_tx);
        let orch_state = Arc::new(Mutex::new(OrchestratorState::Running));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let state = Arc::clone(&orch_state);
        let handle = thread::spawn(move || orchestrate(state, cmd_rx, engine));

        cmd_tx.send(Command::StartStop).unwrap();
        thread::sleep(Duration::from_millis(200));
        cmd_tx.send(Command::Quit).unwrap();
        handle.join().unwrap();
        assert_eq!(current_state(&orch_state), OrchestratorState::Stopped);
    }

    #[test]
    fn dropped_sender_ends_the_loop() {
        let (progress_tx, _progress_rx) = mpsc::channel();
        let (engine, _dir) = engine(progress_tx);
        let orch_state = Arc::new(Mutex::new(OrchestratorState::Stopped));
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        drop(cmd_tx);
        orchestrate(Arc::clone(&orch_state), cmd_rx, engine);
        assert_eq!(current_state(&orch_state), OrchestratorState::Stopped);
    }
}
