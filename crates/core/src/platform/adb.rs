//! Device back-end that drives a real emulator through the adb command-line
//! bridge, including the connect and emulator relaunch ladder.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::logger;
use crate::settings::Settings;
use crate::sleep::{sleep_ms, sleep_unless_stopped};
use crate::types::StopFlag;
use super::Device;

const CLI_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECT_ROUNDS: u32 = 20;
const KILL_BRIDGE_ON_ROUND: u32 = 3;
const EMULATOR_BOOT_MS: u64 = 15_000;

/// Emulator executable -> bundled bridge executable.
const BRIDGE_NAMES: &[(&str, &str)] = &[
    ("HD-Player.exe", "HD-Adb.exe"),
    ("MuMuPlayer.exe", "adb.exe"),
    ("MuMuNxDevice.exe", "adb.exe"),
];

/// Captured result of one CLI invocation.
pub struct CliOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CliOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn connected(&self) -> bool {
        let out = self.text();
        self.success && (out.contains("connected") || out.contains("already")) && !out.contains("cannot")
    }

    fn refused(&self) -> bool {
        self.stderr.contains("refused") || self.text().contains("cannot connect")
    }
}

/// Run `program args..`, killing it if it outlives `timeout`.
pub fn run_cli(program: &Path, args: &[&str], timeout: Duration) -> Result<CliOutput> {
    logger::debug_p("adb", &format!("cmd line: {} {}", program.display(), args.join(" ")));
    let mut child = ProcessCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {}", program.display()))?;

    // Drain pipes off-thread; screencap output exceeds the pipe buffer.
    let stdout = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).ok();
            buf
        })
    });
    let stderr = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            pipe.read_to_string(&mut buf).ok();
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            bail!("{} {} timed out after {:?}", program.display(), args.join(" "), timeout);
        }
        sleep_ms(20);
    };

    Ok(CliOutput {
        success: status.success(),
        stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
        stderr: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
    })
}

/// Sleep `ms`, failing as soon as `stop` is raised.
fn pause(stop: &StopFlag, ms: u64) -> Result<()> {
    if !sleep_unless_stopped(stop, Duration::from_millis(ms)) {
        bail!("stop requested while reconnecting");
    }
    Ok(())
}

/// Locate the bridge shipped next to a known emulator executable.
pub fn derive_adb_path(emulator: &Path) -> Option<PathBuf> {
    let name = emulator.file_name()?.to_str()?;
    BRIDGE_NAMES
        .iter()
        .find(|(player, _)| *player == name)
        .map(|(_, bridge)| emulator.with_file_name(bridge))
}

/// Parse `adb devices` output into `(serial, state)` pairs.
pub fn parse_devices(output: &str) -> Vec<(String, String)> {
    let Ok(re) = Regex::new(r"(?m)^(\S+)\s+(device|offline|unauthorized|no permissions.*)\s*$") else {
        return Vec::new();
    };
    re.captures_iter(output)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// Device reached through the adb command-line bridge.
pub struct AdbDevice {
    adb: PathBuf,
    serial: String,
    emulator: Option<PathBuf>,
}

impl AdbDevice {
    pub fn new(settings: &Settings) -> Self {
        let adb = settings
            .adb_path
            .clone()
            .or_else(|| settings.emulator_path.as_deref().and_then(derive_adb_path))
            .unwrap_or_else(|| PathBuf::from("adb"));
        logger::info_p("adb", &format!("using bridge {}", adb.display()));
        Self {
            adb,
            serial: format!("127.0.0.1:{}", settings.adb_port),
            emulator: settings.emulator_path.clone(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<CliOutput> {
        run_cli(&self.adb, args, CLI_TIMEOUT)
    }

    fn connect(&self) -> Result<CliOutput> {
        self.run(&["connect", &self.serial])
    }

    fn kill_bridge(&self) {
        logger::info_p("adb", "killing the bridge server");
        self.run(&["kill-server"]).ok();
        let name = self.adb.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(name) = name {
            kill_process(&name);
        }
    }

    fn kill_emulator(&self, stop: &StopFlag) -> Result<()> {
        let Some(name) = self.emulator.as_ref().and_then(|p| p.file_name()) else {
            return Ok(());
        };
        let name = name.to_string_lossy();
        logger::info_p("adb", &format!("killing emulator {}", name));
        kill_process(&name);
        pause(stop, 1000)
    }

    fn start_emulator(&self, stop: &StopFlag) -> Result<()> {
        let Some(path) = &self.emulator else {
            bail!("no emulator_path configured, cannot start the emulator");
        };
        if !path.exists() {
            bail!("emulator executable {} does not exist", path.display());
        }
        logger::info_p("adb", &format!("starting emulator {}", path.display()));
        let mut cmd = ProcessCommand::new(path);
        if let Some(dir) = path.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::null()).spawn()
            .with_context(|| format!("launching {}", path.display()))?;
        pause(stop, EMULATOR_BOOT_MS)
    }

    /// One connect round. `Ok(true)` once the serial answers.
    fn try_connect(&self, stop: &StopFlag) -> Result<bool> {
        let devices = self.run(&["devices"])?;
        let listed = parse_devices(&devices.text());
        logger::debug_p("adb", &format!("devices: {:?}", listed));
        let offline = listed.iter().any(|(_, state)| state == "offline");
        if devices.stderr.contains("daemon not running") || offline {
            logger::info_p("adb", "bridge server wedged, restarting it");
            self.run(&["kill-server"]).ok();
            self.run(&["start-server"])?;
            pause(stop, 2000)?;
        }

        let result = self.connect()?;
        if result.connected() {
            return Ok(true);
        }
        if result.refused() {
            logger::info_p("adb", "emulator not answering, launching it");
            self.start_emulator(stop)?;
            if self.connect()?.connected() {
                return Ok(true);
            }
        }
        logger::warn_p("adb", &format!("connect failed: {}", result.stderr.trim()));
        Ok(false)
    }
}

fn kill_process(name: &str) {
    let result = if cfg!(target_os = "windows") {
        run_cli(Path::new("taskkill"), &["/f", "/im", name], CLI_TIMEOUT)
    } else {
        run_cli(Path::new("pkill"), &["-f", name], CLI_TIMEOUT)
    };
    if let Err(e) = result {
        logger::debug_p("adb", &format!("kill {}: {}", name, e));
    }
}

impl Device for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, cmd: &str) -> Result<String> {
        let out = self.run(&["-s", &self.serial, "shell", cmd])?;
        if !out.success && out.stderr.contains("not found") {
            bail!("device {} not found: {}", self.serial, out.stderr.trim());
        }
        Ok(out.text())
    }

    fn screencap(&self) -> Result<Vec<u8>> {
        let out = self.run(&["-s", &self.serial, "exec-out", "screencap", "-p"])?;
        if !out.success {
            bail!("screencap failed: {}", out.stderr.trim());
        }
        Ok(out.stdout)
    }

    fn reconnect(&self, stop: &StopFlag) -> Result<()> {
        for attempt in 0..MAX_CONNECT_ROUNDS {
            if stop.is_set() {
                bail!("stop requested, abandoning reconnect to {}", self.serial);
            }
            logger::info_p("adb", &format!("connecting to {} ({}/{})", self.serial, attempt + 1, MAX_CONNECT_ROUNDS));
            if attempt == KILL_BRIDGE_ON_ROUND {
                self.kill_bridge();
            }
            match self.try_connect(stop) {
                Ok(true) => {
                    logger::info_p("adb", &format!("connected to {}", self.serial));
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => logger::warn_p("adb", &format!("connect round failed: {:#}", e)),
            }
            pause(stop, 2000)?;
            self.kill_emulator(stop)?;
            self.kill_bridge();
            pause(stop, 2000)?;
        }
        bail!("gave up connecting to {} after {} rounds", self.serial, MAX_CONNECT_ROUNDS)
    }

    fn relaunch_emulator(&self, stop: &StopFlag) -> Result<()> {
        logger::warn_p("adb", "relaunching the emulator");
        self.kill_emulator(stop)?;
        self.kill_bridge();
        self.reconnect(stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_path_follows_emulator() {
        let player = Path::new("C:/Program Files/BlueStacks_nxt/HD-Player.exe");
        assert_eq!(derive_adb_path(player), Some(PathBuf::from("C:/Program Files/BlueStacks_nxt/HD-Adb.exe")));
        let mumu = Path::new("/opt/mumu/MuMuPlayer.exe");
        assert_eq!(derive_adb_path(mumu), Some(PathBuf::from("/opt/mumu/adb.exe")));
        assert_eq!(derive_adb_path(Path::new("/usr/bin/qemu")), None);
    }

    #[test]
    fn device_list_parsing() {
        let out = "List of devices attached\n127.0.0.1:5555\tdevice\nemulator-5554\toffline\n\n";
        assert_eq!(
            parse_devices(out),
            vec![
                ("127.0.0.1:5555".to_string(), "device".to_string()),
                ("emulator-5554".to_string(), "offline".to_string()),
            ]
        );
        assert!(parse_devices("* daemon not running; starting now at tcp:5037").is_empty());
    }

    #[test]
    fn reconnect_gives_up_once_stopped() {
        let settings = Settings { adb_path: Some(PathBuf::from("/nonexistent/adb")), ..Settings::default() };
        let device = AdbDevice::new(&settings);
        let stop = StopFlag::new();
        stop.set();
        let started = Instant::now();
        assert!(device.reconnect(&stop).is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn failing_connect_rounds_end_when_stop_is_raised() {
        let settings = Settings { adb_path: Some(PathBuf::from("/nonexistent/adb")), ..Settings::default() };
        let device = AdbDevice::new(&settings);
        let stop = StopFlag::new();
        let raiser = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            raiser.set();
        });
        let started = Instant::now();
        let err = device.reconnect(&stop).unwrap_err();
        handle.join().unwrap();
        assert!(format!("{err:#}").contains("stop requested"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn connect_output_classification() {
        let ok = CliOutput { success: true, stdout: b"already connected to 127.0.0.1:5555".to_vec(), stderr: String::new() };
        assert!(ok.connected());
        let refused = CliOutput {
            success: true,
            stdout: b"cannot connect to 127.0.0.1:5555: No connection could be made (10061)".to_vec(),
            stderr: String::new(),
        };
        assert!(!refused.connected());
        assert!(refused.refused());
    }
}
