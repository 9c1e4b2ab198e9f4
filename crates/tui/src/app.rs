use std::sync::{Arc, Mutex, mpsc};

use wvdas_core::types::{Command, Counters, Milestone, OrchestratorState};

use crate::confirm::ConfirmDialog;

const MAX_NOTABLE: usize = 50;
const MAX_LOG_LINES: usize = 5000;

pub struct App {
    pub orch_state: Arc<Mutex<OrchestratorState>>,
    pub quest: String,
    pub counters: Counters,
    pub summary: Option<String>,
    pub notable: Vec<String>,
    pub runs_finished: u32,
    pub log_visible: bool,
    pub log_messages: Vec<String>,
    pub log_scroll: usize, // scroll offset from bottom (0 = latest)
    pub log_rx: mpsc::Receiver<String>,
    pub progress_rx: mpsc::Receiver<Milestone>,
    pub cmd_tx: mpsc::Sender<Command>,
    pub confirm: Option<ConfirmDialog>,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        orch_state: Arc<Mutex<OrchestratorState>>,
        quest: impl Into<String>,
        log_rx: mpsc::Receiver<String>,
        progress_rx: mpsc::Receiver<Milestone>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            orch_state,
            quest: quest.into(),
            counters: Counters::default(),
            summary: None,
            notable: Vec::new(),
            runs_finished: 0,
            log_visible: true,
            log_messages: Vec::new(),
            log_scroll: 0,
            log_rx,
            progress_rx,
            cmd_tx,
            confirm: None,
            should_quit: false,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.orch_state.lock().map(|s| *s).unwrap_or(OrchestratorState::Stopped)
    }

    pub fn drain_logs(&mut self) {
        let before = self.log_messages.len();
        while let Ok(msg) = self.log_rx.try_recv() {
            self.log_messages.push(msg);
        }
        let added = self.log_messages.len() - before;
        // Keep the view anchored when scrolled back.
        if self.log_scroll > 0 {
            self.log_scroll += added;
        }
        if self.log_messages.len() > MAX_LOG_LINES {
            let excess = self.log_messages.len() - MAX_LOG_LINES;
            self.log_messages.drain(..excess);
        }
    }

    pub fn drain_progress(&mut self) {
        while let Ok(m) = self.progress_rx.try_recv() {
            self.apply(m);
        }
    }

    pub fn apply(&mut self, milestone: Milestone) {
        match milestone {
            Milestone::Counters(c) => self.counters = c,
            Milestone::Summary(text) => self.summary = Some(text),
            Milestone::Notable(event) => {
                self.notable.push(event);
                if self.notable.len() > MAX_NOTABLE {
                    self.notable.remove(0);
                }
            }
            Milestone::TaskFinished => self.runs_finished += 1,
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_add(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    /// Flip the banner state and tell the orchestrator. Ignored while a stop
    /// is still in progress.
    pub fn start_stop(&mut self) {
        let Ok(mut state) = self.orch_state.lock() else {
            return;
        };
        *state = match *state {
            OrchestratorState::Stopped => OrchestratorState::Running,
            OrchestratorState::Running => OrchestratorState::Stopping,
            OrchestratorState::Stopping => return,
        };
        drop(state);
        self.cmd_tx.send(Command::StartStop).ok();
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    /// Quit right away when idle; ask first while a run is active.
    pub fn request_quit(&mut self) {
        if self.state() == OrchestratorState::Stopped {
            self.quit();
        } else {
            self.confirm = Some(ConfirmDialog::new("Stop farming and quit?"));
        }
    }

    /// Close the dialog, quitting when it was answered with Yes.
    pub fn answer_confirm(&mut self, accept: bool) {
        if let Some(dialog) = self.confirm.take() {
            if accept && dialog.selected {
                self.quit();
            }
        }
    }

    pub fn quit(&mut self) {
        self.cmd_tx.send(Command::Quit).ok();
        self.should_quit = true;
    }
}
