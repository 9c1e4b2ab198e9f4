use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use anyhow::{Context, Result};
use crossterm::{
    execute,
    event::{EnableMouseCapture, DisableMouseCapture},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{Terminal, backend::CrosstermBackend};

use wvdas_core::{logger, orchestrator, settings::Settings};
use wvdas_core::orchestrator::Engine;
use wvdas_core::platform::create_device;
use wvdas_core::quest::FarmQuest;
use wvdas_core::types::{Command, Milestone, OrchestratorState, StopFlag};

struct Args {
    stub: bool,
    headless: bool,
    quest: Option<String>,
    settings: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args = Args { stub: false, headless: false, quest: None, settings: None };
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--stub" => args.stub = true,
            "--headless" => args.headless = true,
            "--quest" => args.quest = it.next(),
            "--settings" => args.settings = it.next().map(PathBuf::from),
            other => eprintln!("ignoring unknown argument {}", other),
        }
    }
    args
}

/// Print forwarded log records on stdout when there is no terminal UI.
fn print_logs(log_rx: mpsc::Receiver<String>) {
    for raw in log_rx {
        let parts: Vec<&str> = raw.splitn(5, '\x1f').collect();
        match parts[..] {
            [level, "", _, ts, msg] => println!("{} {:<5} {}", ts, level, msg),
            [level, prefix, _, ts, msg] => println!("{} {:<5} [{}] {}", ts, level, prefix, msg),
            _ => println!("{}", raw),
        }
    }
}

fn main() -> Result<()> {
    let args = parse_args();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let settings_path = args.settings.clone().unwrap_or_else(|| cwd.join("settings.json"));
    let mut settings = Settings::load(&settings_path);
    let seeded = (!settings_path.exists()).then(|| settings.save(&settings_path));
    if settings.logs_dir.is_relative() {
        settings.logs_dir = cwd.join(&settings.logs_dir);
    }

    logger::init(&settings.logs_dir)?;
    logger::set_verbose(settings.verbose);
    logger::register_engine_prefixes();
    match seeded {
        Some(Ok(())) => logger::info(&format!("wrote default settings to {}", settings_path.display())),
        Some(Err(e)) => logger::warn(&format!("could not write default settings: {:#}", e)),
        None => {}
    }

    let quest_name = args.quest.clone().unwrap_or_else(|| settings.quest.clone());
    let quest = FarmQuest::load(&settings.quest_file(), &quest_name)
        .with_context(|| format!("loading quest from {}", settings.quest_file().display()))?;
    let unknown = settings.apply_overrides(&quest.extra_config_overrides)?;
    for key in unknown {
        logger::warn(&format!("quest override {:?} matches no setting, ignored", key));
    }

    let device = create_device(args.stub, &settings);

    let (log_tx, log_rx) = mpsc::channel::<String>();
    let (progress_tx, progress_rx) = mpsc::channel::<Milestone>();
    logger::set_tui_sender(log_tx);
    logger::info(&format!("wvdas started, quest \"{}\"", quest.name));

    let engine = Engine { settings, quest, device, progress: progress_tx };

    if args.headless {
        thread::spawn(move || print_logs(log_rx));
        thread::spawn(move || {
            for m in progress_rx {
                if let Milestone::Summary(text) = m {
                    logger::info(&text);
                }
            }
        });
        orchestrator::run_farm(engine.session(StopFlag::new()));
        return Ok(());
    }

    let orch_state = Arc::new(Mutex::new(OrchestratorState::Stopped));
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = wvdas_tui::App::new(Arc::clone(&orch_state), engine.quest.name.clone(), log_rx, progress_rx, cmd_tx);

    // Spawn orchestrator on a background thread
    let orch_run_state = Arc::clone(&orch_state);
    let engine_thread = thread::spawn(move || orchestrator::orchestrate(orch_run_state, cmd_rx, engine));

    // Run TUI event loop on main thread
    let result = wvdas_tui::event::run(&mut terminal, &mut app);
    drop(app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    if engine_thread.join().is_err() {
        eprintln!("engine thread panicked");
    }
    result
}
