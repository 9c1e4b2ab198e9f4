//! "Wait for X, else do Y": the polling primitive every state handler is built on.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;

use crate::identify;
use crate::interrupt::Step;
use crate::logger;
use crate::matcher;
use crate::recovery;
use crate::session::Session;
use crate::types::{Frame, Point, Rect, Swipe};

/// Where the fast-forward toggle sits when the game switches it off.
const FAST_FORWARD: Point = Point::new(240, 1490);
/// Network-retry prompts without a button are tapped this far below the text.
const RETRY_BLANK_OFFSET: i32 = 103;
pub const MAP_STALL_LIMIT: u32 = 50;

/// Bounds shared by every polling loop. `limit` grows after each restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub step: u32,
    pub cap: u32,
    /// Longest a chest or combat phase may stay open.
    pub phase_timeout: Duration,
    /// Consecutive map passes without progress before a restart.
    pub map_stall_limit: u32,
}

impl RetryPolicy {
    pub fn grow(&mut self) {
        self.limit = (self.limit + self.step).min(self.cap);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Tap(Point),
    /// Tap the named template if it is on the current frame.
    Press(String),
    Swipe(Swipe),
    /// The BACK key.
    Return,
}

impl Action {
    pub fn press(name: &str) -> Self {
        Action::Press(name.to_string())
    }

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("return") {
            Ok(Action::Return)
        } else if s.starts_with("input swipe") {
            Swipe::parse(s).map(Action::Swipe).ok_or_else(|| anyhow!("malformed swipe {:?}", s))
        } else if s.is_empty() {
            bail!("empty action")
        } else {
            Ok(Action::Press(s.to_string()))
        }
    }

    fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::String(s) => Self::from_str(s),
            Value::Array(_) => serde_json::from_value::<Point>(v.clone())
                .map(Action::Tap)
                .map_err(|_| anyhow!("invalid action {}", v)),
            other => bail!("invalid action {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    Nothing,
    Act(Action),
    /// Run in order; consecutive actions are spaced by at least 100 ms.
    Sequence(Vec<Action>),
}

impl Fallback {
    pub fn tap(x: i32, y: i32) -> Self {
        Fallback::Act(Action::Tap(Point::new(x, y)))
    }

    pub fn press(name: &str) -> Self {
        Fallback::Act(Action::press(name))
    }

    pub fn swipe(s: Swipe) -> Self {
        Fallback::Act(Action::Swipe(s))
    }

    /// Quest-data form: `null`, `[x, y]`, a string action, or a list of them.
    pub fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Null => Ok(Fallback::Nothing),
            Value::Array(items) if items.len() == 2 && items.iter().all(Value::is_number) => {
                Action::from_value(v).map(Fallback::Act)
            }
            Value::Array(items) => items.iter().map(Action::from_value).collect::<Result<_>>().map(Fallback::Sequence),
            Value::String(s) => Action::from_str(s).map(Fallback::Act),
            other => bail!("invalid fallback {}", other),
        }
    }
}

/// Which target of the poll appeared, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub name: String,
    pub at: Point,
}

impl Hit {
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

/// Targets are template names, or `combatActive` for the combat predicate.
pub fn locate(s: &mut Session, frame: &Frame, name: &str) -> Option<Point> {
    if name == "combatActive" {
        identify::combat_active(s, frame)
    } else {
        s.find(frame, name)
    }
}

/// Dismiss a network-retry prompt. Returns whether one was tapped.
pub fn try_press_retry(s: &mut Session, frame: &Frame) -> Step<bool> {
    if let Some(p) = s.find(frame, "retry") {
        logger::info_p("poll", "network retry prompt");
        s.tap(p)?;
        return Ok(true);
    }
    if let Some(p) = s.find(frame, "retry_blank") {
        logger::info_p("poll", "network retry prompt (blank)");
        s.tap(p.offset(0, RETRY_BLANK_OFFSET))?;
        return Ok(true);
    }
    Ok(false)
}

fn fast_forward_off(s: &mut Session, frame: &Frame) -> Option<Point> {
    let template = s.templates.get("fastforward_off")?;
    let m = matcher::match_in_region(frame, &template, Rect::around(FAST_FORWARD, 50, 50))?;
    m.found().then(|| m.center())
}

fn run_action(s: &mut Session, frame: &Frame, action: &Action) -> Step<()> {
    match action {
        Action::Tap(p) => s.tap(*p),
        Action::Press(name) => {
            let p = s.find(frame, name);
            s.press(p).map(drop)
        }
        Action::Swipe(sw) => s.swipe(*sw),
        Action::Return => s.back(),
    }
}

pub fn run_fallback(s: &mut Session, frame: &Frame, fallback: &Fallback) -> Step<()> {
    match fallback {
        Fallback::Nothing => Ok(()),
        Fallback::Act(a) => run_action(s, frame, a),
        Fallback::Sequence(actions) => {
            for (i, a) in actions.iter().enumerate() {
                if i > 0 {
                    s.sleep(0.1)?;
                }
                run_action(s, frame, a)?;
            }
            Ok(())
        }
    }
}

/// Poll until one of `targets` shows up, running `fallback` and sleeping
/// `wait` seconds after each miss. After `retry.limit` misses the game is
/// restarted and `Interrupt::Restart` returned.
pub fn find_or_fallback(s: &mut Session, targets: &[&str], fallback: &Fallback, wait: f64) -> Step<Hit> {
    let limit = s.retry.limit;
    for attempt in 0..limit {
        s.check_stop()?;
        let frame = s.capture()?;
        for name in targets {
            if let Some(at) = locate(s, &frame, name) {
                logger::debug_p("poll", &format!("{} at ({}, {}) after {} misses", name, at.x, at.y, attempt));
                return Ok(Hit { name: name.to_string(), at });
            }
        }
        if try_press_retry(s, &frame)? {
            s.sleep(1.0)?;
            continue;
        }
        if let Some(p) = fast_forward_off(s, &frame) {
            logger::info_p("poll", "fast-forward was off");
            s.tap(p)?;
            s.sleep(1.0)?;
            continue;
        }
        run_fallback(s, &frame, fallback)?;
        s.sleep(wait)?;
    }
    logger::warn_p("poll", &format!("{:?} not seen after {} polls", targets, limit));
    s.sleep(1.0)?;
    Err(recovery::restart_game(s, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::Interrupt;
    use crate::session::testing::*;
    use serde_json::json;

    #[test]
    fn fallback_parsing() {
        assert_eq!(Fallback::from_value(&json!(null)).unwrap(), Fallback::Nothing);
        assert_eq!(Fallback::from_value(&json!([550, 1])).unwrap(), Fallback::tap(550, 1));
        assert_eq!(Fallback::from_value(&json!("RETURN")).unwrap(), Fallback::Act(Action::Return));
        assert_eq!(
            Fallback::from_value(&json!(["closePartyInfo", [550, 1], "input swipe 1 2 3 4"])).unwrap(),
            Fallback::Sequence(vec![
                Action::press("closePartyInfo"),
                Action::Tap(Point::new(550, 1)),
                Action::Swipe(Swipe::new(1, 2, 3, 4)),
            ])
        );
        assert!(Fallback::from_value(&json!(42)).is_err());
        assert!(Fallback::from_value(&json!(["ok", {"x": 1}])).is_err());
        assert!(Fallback::from_value(&json!("input swipe 1 2")).is_err());
    }

    #[test]
    fn missing_target_restarts_once_after_limit() {
        let mut r = rig();
        r.session.retry.limit = 4;
        let fb = Fallback::tap(1, 1);
        let res = find_or_fallback(&mut r.session, &["neverThere"], &fb, 0.5);
        assert!(matches!(res, Err(Interrupt::Restart)));
        assert_eq!(r.device.screencaps(), 4);
        assert_eq!(r.session.ctx.counters.restarts, 1);
        let log = r.device.shell_log();
        assert_eq!(log.iter().filter(|c| *c == "input tap 1 1").count(), 4);
        assert_eq!(log.iter().filter(|c| c.starts_with("am force-stop")).count(), 1);
        assert_eq!(r.session.retry.limit, 9);
    }

    #[test]
    fn limit_growth_is_capped() {
        let mut p = RetryPolicy { limit: 45, step: 5, cap: 50, phase_timeout: Duration::ZERO, map_stall_limit: 50 };
        p.grow();
        assert_eq!(p.limit, 50);
        p.grow();
        assert_eq!(p.limit, 50);
    }

    #[test]
    fn hit_reports_which_target() {
        let mut r = rig();
        let inn = icon(7);
        r.session.templates.insert("Inn", inn.clone());
        r.session.templates.insert("OK", icon(8));
        r.device.push_frame(&blank()).unwrap();
        r.device.push_frame(&scene(&[(&inn, 304, 496)])).unwrap();
        let hit = find_or_fallback(&mut r.session, &["OK", "Inn"], &Fallback::Nothing, 1.0).unwrap();
        assert!(hit.is("Inn"));
        assert_eq!(hit.at, Point::new(336, 520));
        assert_eq!(r.device.screencaps(), 2);
    }

    #[test]
    fn sequence_taps_only_visible_patterns() {
        let mut r = rig();
        let stay = icon(9);
        r.session.templates.insert("Stay", stay.clone());
        r.session.templates.insert("Economy", icon(10));
        let frame = scene(&[(&stay, 96, 96)]);
        let fb = Fallback::Sequence(vec![Action::press("Economy"), Action::press("Stay"), Action::Return]);
        run_fallback(&mut r.session, &frame, &fb).unwrap();
        assert_eq!(r.device.shell_log(), vec!["input tap 128 120", "input keyevent KEYCODE_BACK"]);
    }

    #[test]
    fn stop_flag_ends_poll() {
        let mut r = rig();
        r.session.stop_flag().set();
        let res = find_or_fallback(&mut r.session, &["x"], &Fallback::Nothing, 1.0);
        assert!(matches!(res, Err(Interrupt::Stop)));
        assert_eq!(r.device.screencaps(), 0);
    }
}
