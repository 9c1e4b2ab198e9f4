//! Quest scripts: the declarative per-quest data consumed by the engine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::matcher::Roi;
use crate::types::{Point, Rect, Swipe};

/// Full-frame inclusion used by chest searches without an explicit mask.
pub const FULL_FRAME: Rect = Rect::new(0, 0, 900, 1600);

/// Map chrome that must never produce a hit: header, footer, side buttons,
/// and the two labels above and below the cursor.
pub const MAP_CHROME: [Rect; 6] = [
    Rect::new(0, 0, 900, 208),
    Rect::new(0, 1265, 900, 335),
    Rect::new(0, 636, 137, 222),
    Rect::new(763, 636, 137, 222),
    Rect::new(336, 208, 228, 77),
    Rect::new(336, 1168, 228, 97),
];

/// Scroll order tried when a waypoint names no direction.
pub const ALL_DIRECTIONS: [Swipe; 5] = [
    Swipe::new(100, 100, 700, 1200),
    Swipe::new(400, 1200, 400, 100),
    Swipe::new(700, 800, 100, 800),
    Swipe::new(400, 100, 400, 1200),
    Swipe::new(100, 800, 700, 800),
];

/// Ability name lists keyed by the enemy-signature template they answer.
pub type SpellSequence = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A map cell; reached once the cursor sits on it.
    Position(Point),
    /// `stair_up`/`stair_down`/`stair_teleport` near `at`, or a floor marker
    /// whose presence means the floor change already happened.
    Stair { name: String, at: Point },
    /// The map's auto-chest shortcut.
    ChestAuto,
    Named(String),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Position(_) => "position",
            Target::Stair { name, .. } => name,
            Target::ChestAuto => "chest_auto",
            Target::Named(name) => name,
        }
    }

    /// Tapped straight away with auto-move, no focus check.
    pub fn is_place(&self) -> bool {
        match self {
            Target::Position(_) | Target::Stair { .. } => true,
            Target::ChestAuto => false,
            Target::Named(n) => matches!(n.as_str(), "harken" | "chest" | "leaveDung") || n.ends_with("_quit"),
        }
    }

    /// Dropped from the list when a search no longer finds it.
    pub fn consumed_when_missing(&self) -> bool {
        match self {
            Target::Position(_) | Target::Stair { .. } => true,
            Target::Named(n) => n == "chest",
            Target::ChestAuto => false,
        }
    }
}

/// One navigation goal: `[target, swipes, roi, applySpellSequence]` in quest data.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Waypoint {
    pub target: Target,
    /// `None` entries search the map as it is, without scrolling.
    pub swipes: Vec<Option<Swipe>>,
    pub roi: Option<Roi>,
    pub apply_spell_sequence: bool,
}

fn named_direction(name: &str) -> Result<Vec<Option<Swipe>>> {
    let swipe = match name {
        "左上" | "upperLeft" => Swipe::new(100, 250, 700, 1200),
        "右上" | "upperRight" => Swipe::new(700, 250, 100, 1200),
        "右下" | "lowerRight" => Swipe::new(700, 1200, 100, 250),
        "左下" | "lowerLeft" => Swipe::new(100, 1200, 700, 250),
        other => bail!("unknown swipe direction {:?}", other),
    };
    Ok(vec![Some(swipe)])
}

fn parse_swipes(v: Option<&Value>) -> Result<Vec<Option<Swipe>>> {
    match v {
        None | Some(Value::Null) => {
            let mut all = vec![None];
            all.extend(ALL_DIRECTIONS.iter().copied().map(Some));
            Ok(all)
        }
        Some(Value::String(name)) => named_direction(name),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => Ok(None),
                other => serde_json::from_value::<Swipe>(other.clone())
                    .map(Some)
                    .map_err(|e| anyhow!("bad swipe {}: {}", other, e)),
            })
            .collect(),
        Some(other) => bail!("bad swipe list {}", other),
    }
}

fn parse_point(v: Option<&Value>, what: &str) -> Result<Point> {
    let v = v.ok_or_else(|| anyhow!("{} needs a [x, y] point", what))?;
    serde_json::from_value::<Point>(v.clone()).map_err(|e| anyhow!("{} point {}: {}", what, v, e))
}

fn parse_roi(v: Option<&Value>) -> Result<Option<Vec<Rect>>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s == "default" => {
            let mut rects = vec![FULL_FRAME];
            rects.extend(MAP_CHROME);
            Ok(Some(rects))
        }
        Some(other) => serde_json::from_value::<Vec<Rect>>(other.clone())
            .map(Some)
            .map_err(|e| anyhow!("bad roi {}: {}", other, e)),
    }
}

impl TryFrom<Value> for Waypoint {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        let fields = value.as_array().ok_or_else(|| anyhow!("waypoint must be an array, got {}", value))?;
        let name = fields
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("waypoint target must be a name"))?;
        let swipes = parse_swipes(fields.get(1))?;
        let apply_spell_sequence = fields.get(3).and_then(Value::as_bool).unwrap_or(false);

        let (target, roi) = if name == "position" {
            (Target::Position(parse_point(fields.get(2), name)?), None)
        } else if name.starts_with("stair") {
            let at = parse_point(fields.get(2), name)?;
            (Target::Stair { name: name.to_string(), at }, None)
        } else if name == "chest_auto" {
            (Target::ChestAuto, None)
        } else if name == "chest" {
            let mut rects = parse_roi(fields.get(2))?.unwrap_or_else(|| vec![FULL_FRAME]);
            rects.extend(MAP_CHROME);
            (Target::Named(name.to_string()), Some(Roi::new(rects)))
        } else {
            (Target::Named(name.to_string()), parse_roi(fields.get(2))?.map(Roi::new))
        };

        Ok(Waypoint { target, swipes, roi, apply_spell_sequence })
    }
}

/// Step of the edge-of-town routine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum TownAction {
    /// Poll for `target` running `fallback` (kept raw, validated when run);
    /// tap the hit when `press` is set.
    Poll {
        press: bool,
        target: String,
        fallback: Value,
        wait_secs: f64,
    },
    /// Travel through the world map to `target`, scrolling with `swipe`.
    WorldMap { target: String, swipe: Value },
}

impl TryFrom<Value> for TownAction {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        let fields = value.as_array().ok_or_else(|| anyhow!("town action must be an array, got {}", value))?;
        let mode = fields.first().and_then(Value::as_str).unwrap_or_default();
        let press = match mode {
            "press" => true,
            "wait" => false,
            other => bail!("town action mode must be press or wait, got {:?}", other),
        };
        let target = fields
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("town action target must be a name"))?
            .to_string();
        if target == "intoWorldMap" {
            let dest = fields
                .get(2)
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("intoWorldMap needs [target, swipe]"))?;
            let target = dest
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("intoWorldMap target must be a name"))?
                .to_string();
            let swipe = dest.get(1).cloned().unwrap_or(Value::Null);
            return Ok(TownAction::WorldMap { target, swipe });
        }
        Ok(TownAction::Poll {
            press,
            target,
            fallback: fields.get(2).cloned().unwrap_or(Value::Null),
            wait_secs: fields.get(3).and_then(Value::as_f64).unwrap_or(1.0),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmQuest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    pub waypoints: Vec<Waypoint>,
    #[serde(default)]
    pub edge_of_town_actions: Vec<TownAction>,
    /// Tapped once before the edge-of-town routine when visible.
    #[serde(default)]
    pub pre_edge_of_town_check: Option<String>,
    #[serde(default)]
    pub special_dialog_options: Vec<String>,
    #[serde(default)]
    pub special_force_stop_symbols: Vec<String>,
    #[serde(default)]
    pub spell_sequence: Option<SpellSequence>,
    #[serde(default)]
    pub extra_config_overrides: Map<String, Value>,
}

impl FarmQuest {
    /// Parse one quest out of a quest file's JSON text.
    pub fn parse(text: &str, name: &str) -> Result<Self> {
        let mut all: HashMap<String, Value> = serde_json::from_str(text).context("parsing quest file")?;
        let raw = all.remove(name).ok_or_else(|| anyhow!("quest {:?} not found", name))?;
        let mut quest: FarmQuest = serde_json::from_value(raw).with_context(|| format!("quest {:?}", name))?;
        if quest.kind != "dungeon" {
            bail!("quest {:?} has type {:?}; only dungeon quests are supported", name, quest.kind);
        }
        if quest.waypoints.is_empty() {
            bail!("quest {:?} has no waypoints", name);
        }
        quest.name = name.to_string();
        Ok(quest)
    }

    pub fn load(path: &Path, name: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text, name)
    }
}

/// Per-dungeon copy of the waypoint list, drained strictly from the front.
#[derive(Debug, Clone, Default)]
pub struct WaypointQueue {
    items: VecDeque<Waypoint>,
}

impl WaypointQueue {
    pub fn new(waypoints: &[Waypoint]) -> Self {
        Self { items: waypoints.iter().cloned().collect() }
    }

    pub fn front(&self) -> Option<&Waypoint> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<Waypoint> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn waypoint(v: Value) -> Waypoint {
        Waypoint::try_from(v).unwrap()
    }

    #[test]
    fn position_and_stair_take_a_point() {
        let w = waypoint(json!(["position", "左上", [459, 1188]]));
        assert_eq!(w.target, Target::Position(Point::new(459, 1188)));
        assert_eq!(w.swipes, vec![Some(Swipe::new(100, 250, 700, 1200))]);
        assert!(w.roi.is_none());

        let w = waypoint(json!(["stair_down", null, [300, 700], true]));
        assert_eq!(w.target, Target::Stair { name: "stair_down".into(), at: Point::new(300, 700) });
        assert_eq!(w.swipes.len(), 6);
        assert_eq!(w.swipes[0], None);
        assert!(w.apply_spell_sequence);
    }

    #[test]
    fn chest_always_masks_map_chrome() {
        let w = waypoint(json!(["chest", []]));
        let roi = w.roi.unwrap();
        assert_eq!(roi.inclusion(), Some(FULL_FRAME));
        assert_eq!(roi.exclusions(), &MAP_CHROME);
        assert!(w.swipes.is_empty());

        let w = waypoint(json!(["chest", null, [[0, 400, 900, 800]]]));
        let roi = w.roi.unwrap();
        assert_eq!(roi.inclusion(), Some(Rect::new(0, 400, 900, 800)));
        assert_eq!(roi.exclusions().len(), 6);
    }

    #[test]
    fn default_roi_keyword() {
        let w = waypoint(json!(["harken", [[400, 1200, 400, 100]], "default"]));
        assert_eq!(w.roi.unwrap().0.len(), 7);
        assert_eq!(w.swipes, vec![Some(Swipe::new(400, 1200, 400, 100))]);
    }

    #[test]
    fn malformed_waypoints_are_rejected() {
        assert!(Waypoint::try_from(json!("harken")).is_err());
        assert!(Waypoint::try_from(json!(["position", null])).is_err());
        assert!(Waypoint::try_from(json!(["harken", "sideways"])).is_err());
    }

    #[test]
    fn town_actions() {
        let a = TownAction::try_from(json!(["press", "GotoDung", [1, 1], 2])).unwrap();
        assert_eq!(
            a,
            TownAction::Poll { press: true, target: "GotoDung".into(), fallback: json!([1, 1]), wait_secs: 2.0 }
        );
        let a = TownAction::try_from(json!(["press", "intoWorldMap", ["DH", "input swipe 400 400 400 1200"]])).unwrap();
        assert_eq!(
            a,
            TownAction::WorldMap { target: "DH".into(), swipe: json!("input swipe 400 400 400 1200") }
        );
        assert!(TownAction::try_from(json!(["tap", "x"])).is_err());
    }

    #[test]
    fn quest_file_selection() {
        let text = json!({
            "farm": {
                "type": "dungeon",
                "waypoints": [["harken", null, "default"], ["chest_auto"]],
                "edgeOfTownActions": [["wait", "EdgeOfTown", null, 1]],
                "specialForceStopSymbols": ["gameover"],
                "spellSequence": { "boss": ["LAHALITO", "attack"] },
                "extraConfigOverrides": { "aoe_once": true }
            },
            "event": { "type": "event", "waypoints": [["x"]] }
        })
        .to_string();
        let q = FarmQuest::parse(&text, "farm").unwrap();
        assert_eq!(q.name, "farm");
        assert_eq!(q.waypoints.len(), 2);
        assert_eq!(q.waypoints[1].target, Target::ChestAuto);
        assert_eq!(q.spell_sequence.unwrap()["boss"], vec!["LAHALITO", "attack"]);
        assert!(FarmQuest::parse(&text, "event").is_err());
        assert!(FarmQuest::parse(&text, "missing").is_err());
    }

    #[test]
    fn queue_drains_from_front() {
        let ws = vec![waypoint(json!(["a", []])), waypoint(json!(["b", []]))];
        let mut q = WaypointQueue::new(&ws);
        assert_eq!(q.pop().unwrap().target.name(), "a");
        assert_eq!(q.front().unwrap().target.name(), "b");
        assert_eq!(q.len(), 1);
        assert_eq!(ws.len(), 2, "quest data untouched");
    }

    #[test]
    fn target_kinds() {
        assert!(Target::Named("leaveDung".into()).is_place());
        assert!(Target::Named("B2F_quit".into()).is_place());
        assert!(!Target::Named("shrine".into()).is_place());
        assert!(Target::Named("chest".into()).consumed_when_missing());
        assert!(!Target::Named("harken".into()).consumed_when_missing());
    }

    #[test]
    fn bundled_quest_file_parses() {
        let text = include_str!("../../../resources/quest/quest.json");
        let q = FarmQuest::parse(text, "fordraig-b2f").unwrap();
        assert_eq!(q.waypoints[0].target, Target::ChestAuto);
        assert!(q.waypoints[0].apply_spell_sequence);
        assert_eq!(q.waypoints[1].target, Target::Position(Point::new(612, 448)));
        assert_eq!(q.edge_of_town_actions.len(), 2);
        assert_eq!(q.extra_config_overrides.get("aoe_once"), Some(&json!(true)));
        let rats = FarmQuest::parse(text, "ratfarm").unwrap();
        assert!(rats.waypoints[2].target.is_place());
    }
}
