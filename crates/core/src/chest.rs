//! Chest handling: pick who opens it, then clear the disarm gauge.

use rand::seq::SliceRandom;

use crate::identify::{self, Revive};
use crate::interrupt::Step;
use crate::logger;
use crate::matcher::Roi;
use crate::motion::{self, Sample, GAUGE_WIDTH};
use crate::poller::{self, Action, Fallback};
use crate::session::Session;
use crate::types::{FineState, Point, Rect};

const PARTY_SIZE: usize = 6;
const DISARM: Point = Point::new(515, 934);
const DISARM_TIMED: Point = Point::new(527, 920);
/// Tap-to-effect delay subtracted from every predicted wait.
const TAP_LATENCY: f64 = 0.27;
const SAMPLES_NEEDED: usize = 20;
const SAMPLE_ATTEMPTS: usize = 60;
const TIMED_ATTEMPTS: usize = 5;

/// Centre of party slot `i` on the opener picker (two rows of three).
pub fn slot_center(i: usize) -> Point {
    Point::new(258 + (i % 3) as i32 * 258, 1161 + (i / 3 % 2) as i32 * 184)
}

fn fear_region(i: usize) -> Rect {
    Rect::around(slot_center(i), 125, 82)
}

fn disarm_taps(s: &mut Session) -> Step<()> {
    for i in 0..8 {
        if i > 0 {
            s.sleep(0.3)?;
        }
        s.tap(DISARM)?;
    }
    Ok(())
}

/// Choose an opener that is not afraid and tap them.
fn choose_opener(s: &mut Session, tried: &mut bool) -> Step<()> {
    let mut available: Vec<usize> = (0..PARTY_SIZE).collect();
    let preferred = (s.settings.preferred_opener as usize).checked_sub(1).filter(|&i| i < PARTY_SIZE);
    let frame = s.capture()?;
    loop {
        let pick = match preferred {
            Some(p) if !*tried && available.contains(&p) => p,
            _ => match available.choose(&mut rand::thread_rng()) {
                Some(&i) => i,
                None => {
                    logger::warn_p("chest", "whole party is afraid, trying anyway");
                    available = (0..PARTY_SIZE).collect();
                    *tried = true;
                    continue;
                }
            },
        };
        *tried = true;
        if s.find_in(&frame, "chestfear", &Roi::single(fear_region(pick))).is_some() {
            logger::info_p("chest", &format!("slot {} is afraid", pick + 1));
            available.retain(|&i| i != pick);
            continue;
        }
        logger::info_p("chest", &format!("slot {} opens the chest", pick + 1));
        s.tap(slot_center(pick))?;
        s.sleep(1.5)?;
        if !s.settings.smart_disarm_chest {
            disarm_taps(s)?;
        }
        return Ok(());
    }
}

fn overlay_visible(s: &mut Session) -> Step<bool> {
    let frame = s.capture()?;
    Ok(s.find(&frame, "chestOpening").is_some())
}

/// Predict when the gauge cursor lines up with the widest slot and tap then.
/// Ends when the disarm overlay is gone.
fn timed_disarm(s: &mut Session) -> Step<()> {
    for _ in 0..TIMED_ATTEMPTS {
        let mut samples = Vec::with_capacity(SAMPLES_NEEDED);
        for _ in 0..SAMPLE_ATTEMPTS {
            if samples.len() >= SAMPLES_NEEDED {
                break;
            }
            s.sleep(0.2)?;
            let frame = s.capture()?;
            let t = s.channel.device_time()?;
            match s.find(&frame, "cursor") {
                Some(p) => samples.push(Sample { t, x: p.x as f64 / GAUGE_WIDTH }),
                None if s.find(&frame, "chestOpening").is_none() => return Ok(()),
                None => {}
            }
        }
        let Some(fit) = motion::fit_triangle(&samples).filter(|_| samples.len() >= SAMPLES_NEEDED) else {
            logger::warn_p("chest", &format!("only {} cursor samples", samples.len()));
            break;
        };
        logger::debug_p("chest", &format!("gauge period {:.3}s phase {:.3}", fit.period, fit.phase));

        let frame = s.capture()?;
        let t = s.channel.device_time()?;
        if s.find(&frame, "chestOpening").is_none() {
            return Ok(());
        }
        if let (Some(cursor), Some(target)) = (s.find(&frame, "cursor"), motion::widest_slot(&frame)) {
            let wait = fit.wait_until(t, cursor.x as f64, target as f64);
            logger::debug_p("chest", &format!("cursor {} target {} wait {:.3}s", cursor.x, target, wait));
            if wait > TAP_LATENCY {
                s.sleep(wait - TAP_LATENCY)?;
                s.tap(DISARM_TIMED)?;
                s.sleep(3.0)?;
            }
        }
        if !overlay_visible(s)? {
            return Ok(());
        }
    }
    logger::warn_p("chest", "prediction failed, tapping blind");
    disarm_taps(s)
}

/// Drive a chest to completion. Returns the state to continue with:
/// `Dungeon` or `Combat` when seen, `None` after a revive.
pub fn state_chest(s: &mut Session) -> Step<Option<FineState>> {
    if s.ctx.chest_started.is_none() {
        s.ctx.chest_started = Some(s.now());
    }
    let mut tried = false;
    let open = Fallback::Sequence(vec![
        Action::Tap(Point::new(1, 1)),
        Action::Tap(Point::new(1, 1)),
        Action::press("chestFlag"),
    ]);
    let disarm = Fallback::Sequence(vec![Action::Tap(DISARM); 8]);
    loop {
        let hit = poller::find_or_fallback(
            s,
            &["dungFlag", "combatActive", "chestOpening", "whowillopenit", "RiseAgain"],
            &open,
            1.0,
        )?;
        match hit.name.as_str() {
            "whowillopenit" => choose_opener(s, &mut tried)?,
            "chestOpening" => {
                s.sleep(1.0)?;
                if s.settings.smart_disarm_chest {
                    timed_disarm(s)?;
                }
                poller::find_or_fallback(s, &["dungFlag", "combatActive", "chestFlag", "RiseAgain"], &disarm, 1.0)?;
            }
            "RiseAgain" => {
                identify::rise_again_reset(s, Revive::Chest)?;
                return Ok(None);
            }
            "dungFlag" => return Ok(Some(FineState::Dungeon)),
            _ => return Ok(Some(FineState::Combat)),
        }
    }
}
