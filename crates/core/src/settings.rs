//! Persistent engine settings, loaded from `settings.json` and patched by
//! per-quest overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::poller::{RetryPolicy, MAP_STALL_LIMIT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Quest selected from the quest file.
    pub quest: String,
    /// Bridge executable. Derived from `emulator_path` when empty.
    pub adb_path: Option<PathBuf>,
    pub adb_port: u16,
    pub emulator_path: Option<PathBuf>,
    pub package_name: String,
    /// Holds `images/` and `quest/quest.json`.
    pub resource_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub verbose: bool,

    pub smart_disarm_chest: bool,
    /// 0 picks a random character, 1..=6 a fixed party slot.
    pub preferred_opener: u8,
    pub skip_combat_recover: bool,
    pub skip_chest_recover: bool,

    pub system_auto_combat: bool,
    pub aoe_once: bool,
    pub aoe_budget: u32,
    pub auto_after_aoe: bool,
    pub spell_priority: Vec<String>,
    pub aoe_abilities: Vec<String>,

    pub active_rest: bool,
    pub royal_suite_rest: bool,
    pub rest_interval: u32,
    pub dungeon_wait_timeout_secs: u64,

    pub retry_limit: u32,
    pub retry_limit_step: u32,
    pub retry_limit_cap: u32,
    pub command_timeout_ms: u64,
    pub phase_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quest: String::new(),
            adb_path: None,
            adb_port: 5555,
            emulator_path: None,
            package_name: "jp.co.drecom.wizardry.daphne".into(),
            resource_dir: PathBuf::from("resources"),
            logs_dir: PathBuf::from("logs"),
            verbose: false,
            smart_disarm_chest: false,
            preferred_opener: 0,
            skip_combat_recover: false,
            skip_chest_recover: false,
            system_auto_combat: false,
            aoe_once: false,
            aoe_budget: 1,
            auto_after_aoe: false,
            spell_priority: ["KANTIOS", "SAoLABADIOS", "SAoLAERLIK", "SAoLAFOROS", "LAERLIK", "LAMIGAL", "LAZELOS", "LACONES", "LAFOROS", "LAHALITO", "LAFERU"]
                .into_iter()
                .map(String::from)
                .collect(),
            aoe_abilities: [
                "SAoLABADIOS", "SAoLAERLIK", "SAoLAFOROS",
                "LAERLIK", "LAMIGAL", "LAZELOS", "LACONES", "LAFOROS", "LAHALITO", "LAFERU",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            active_rest: true,
            royal_suite_rest: false,
            rest_interval: 0,
            dungeon_wait_timeout_secs: 0,
            retry_limit: 20,
            retry_limit_step: 5,
            retry_limit_cap: 50,
            command_timeout_ms: 7000,
            phase_timeout_secs: 400,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Merge quest overrides by field name. Returns the keys that matched no field.
    pub fn apply_overrides(&mut self, overrides: &Map<String, Value>) -> Result<Vec<String>> {
        let mut merged = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => anyhow::bail!("settings did not serialize to an object"),
        };
        let mut unknown = Vec::new();
        for (key, value) in overrides {
            match merged.get_mut(key) {
                Some(slot) => *slot = value.clone(),
                None => unknown.push(key.clone()),
            }
        }
        *self = serde_json::from_value(Value::Object(merged)).context("applying quest overrides")?;
        Ok(unknown)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            limit: self.retry_limit,
            step: self.retry_limit_step,
            cap: self.retry_limit_cap,
            phase_timeout: Duration::from_secs(self.phase_timeout_secs),
            map_stall_limit: MAP_STALL_LIMIT,
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.resource_dir.join("images")
    }

    pub fn quest_file(&self) -> PathBuf {
        self.resource_dir.join("quest").join("quest.json")
    }
}
