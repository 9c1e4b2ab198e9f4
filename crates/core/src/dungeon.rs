//! The in-dungeon state machine: from entering the dungeon until the party
//! is back at the Inn or the waypoint list runs out.

use std::time::Duration;

use crate::chest;
use crate::combat;
use crate::frame;
use crate::identify;
use crate::interrupt::Step;
use crate::logger;
use crate::matcher::Roi;
use crate::navigator::{self, OPEN_MAP};
use crate::poller::{self, Fallback};
use crate::quest::{Target, WaypointQueue};
use crate::recovery::{self, FreezeDetector};
use crate::session::Session;
use crate::types::{CoarseState, FineState, Frame, Point, Rect};

const CHEST_AUTO_BUTTON: Rect = Rect::new(710, 250, 180, 180);
const STORY_BADGE: Rect = Rect::new(676, 800, 220, 108);
/// Party slots tried when opening a character sheet.
const RECOVER_ATTEMPTS: u32 = 20;
const STILL_AUTO_CHEST: f32 = 0.05;
const STILL_RESUME: f32 = 0.1;

/// Bookkeeping for one dungeon run.
struct Run {
    freeze: FreezeDetector,
    map_stalls: u32,
    chest_pending: bool,
    combat_pending: bool,
    should_recover: bool,
}

fn same_screen(a: &Frame, b: &Frame, limit: f32) -> bool {
    let diff = frame::mean_abs_diff(&frame::to_gray(a), &frame::to_gray(b));
    logger::debug_p("dungeon", &format!("still check {:.3}", diff));
    diff < limit
}

/// Close open phase timers into the totals. When both phases ran, the
/// overlapping stretch is counted once, for the longer phase.
fn close_phase_timers(s: &mut Session) {
    let now = s.now();
    let combat = s.ctx.combat_started.take().map(|t| now.saturating_sub(t));
    let chest = s.ctx.chest_started.take().map(|t| now.saturating_sub(t));
    match (combat, chest) {
        (Some(c), Some(h)) if c > h => {
            s.ctx.combat_time += c - h;
            s.ctx.chest_time += h;
        }
        (Some(c), Some(h)) => {
            s.ctx.chest_time += h - c;
            s.ctx.combat_time += c;
        }
        (Some(c), None) => s.ctx.combat_time += c,
        (None, Some(h)) => s.ctx.chest_time += h,
        (None, None) => return,
    }
    logger::info_p(
        "dungeon",
        &format!("chest {:.1}s combat {:.1}s so far", s.ctx.chest_time.as_secs_f64(), s.ctx.combat_time.as_secs_f64()),
    );
}

/// Open a character sheet and use the party-wide recover. Gives up quietly
/// when no sheet opens.
fn recover_party(s: &mut Session) -> Step<bool> {
    s.tap(Point::new(1, 1))?;
    for attempt in 0..=RECOVER_ATTEMPTS {
        let frame = s.capture()?;
        if s.find(&frame, "dungflag").is_none() {
            break;
        }
        s.tap(Point::new(36 + (attempt % 3) as i32 * 286, 1425))?;
        s.sleep(1.0)?;

        let frame = s.capture()?;
        if s.find(&frame, "trait").is_none() {
            continue;
        }
        let story = s.find_in(&frame, "story", &Roi::single(STORY_BADGE));
        s.tap(if story.is_some() { Point::new(725, 850) } else { Point::new(830, 850) })?;
        s.sleep(1.0)?;
        poller::find_or_fallback(s, &["recover", "combatActive"], &Fallback::tap(833, 843), 1.0)?;
        let frame = s.capture()?;
        if s.find(&frame, "recover").is_some() {
            s.sleep(1.5)?;
            s.tap(Point::new(600, 1200))?;
            s.sleep(1.0)?;
            for i in 0..5 {
                if i > 0 {
                    s.sleep(0.3)?;
                }
                s.back()?;
            }
            return Ok(true);
        }
    }
    logger::info_p("dungeon", "recover unavailable, skipping");
    Ok(false)
}

/// After a fight or a chest: close timers, count it, heal when configured.
fn on_dungeon(s: &mut Session, run: &mut Run) -> Step<Option<FineState>> {
    s.tap(Point::new(1, 1))?;
    if s.settings.aoe_once {
        s.ctx.enough_aoe = false;
        s.ctx.aoe_casts = 0;
    }
    close_phase_timers(s);

    if std::mem::take(&mut run.chest_pending) {
        s.ctx.counters.chests += 1;
        s.ctx.met_chest_or_combat = true;
        run.should_recover |= !s.settings.skip_chest_recover;
    }
    if std::mem::take(&mut run.combat_pending) {
        s.ctx.counters.combats += 1;
        s.ctx.met_chest_or_combat = true;
        run.should_recover |= !s.settings.skip_combat_recover;
    }
    if std::mem::take(&mut s.ctx.recover_after_revive) {
        run.should_recover = true;
    }
    s.emit_counters();

    if run.should_recover && recover_party(s)? {
        run.should_recover = false;
    }

    if !s.ctx.stepped_after_restart {
        s.tap(Point::new(27, 950))?;
        s.sleep(1.0)?;
        s.tap(Point::new(853, 950))?;
        s.ctx.stepped_after_restart = true;
    }

    if s.ctx.resume_available {
        let frame = s.capture()?;
        let resume = s.find(&frame, "resume");
        if s.press(resume)? {
            logger::info_p("dungeon", "resuming the interrupted move");
            let mut last = s.capture()?;
            loop {
                s.sleep(3.0)?;
                let id = identify::identify_state(s)?;
                let fine = if id.coarse == CoarseState::Dungeon { id.fine } else { None };
                if fine != Some(FineState::Dungeon) {
                    return Ok(fine);
                }
                if same_screen(&id.frame, &last, STILL_RESUME) {
                    s.ctx.resume_available = false;
                    break;
                }
                last = id.frame;
            }
        }
    }
    Ok(Some(FineState::Map))
}

/// Tap the auto-chest shortcut and follow the walk. The waypoint is done
/// once the party stands still in the dungeon view.
fn auto_chest(s: &mut Session, queue: &mut WaypointQueue) -> Step<Option<FineState>> {
    let roi = Roi::single(CHEST_AUTO_BUTTON);
    let mut last = s.capture()?;
    let button = s.find_in(&last, "chest_auto", &roi);
    if !s.press(button)? {
        let map = s.find(&last, "mapflag");
        s.press(map)?;
        s.tap(Point::new(664, 329))?;
        s.sleep(1.0)?;
        last = s.capture()?;
        let button = s.find_in(&last, "chest_auto", &roi);
        if !s.press(button)? {
            logger::warn_p("dungeon", "auto-chest button not found");
            return Ok(None);
        }
    }
    s.sleep(0.5)?;
    loop {
        s.sleep(3.0)?;
        let id = identify::identify_state(s)?;
        let fine = if id.coarse == CoarseState::Dungeon { id.fine } else { None };
        if fine != Some(FineState::Dungeon) {
            return Ok(fine);
        }
        if same_screen(&id.frame, &last, STILL_AUTO_CHEST) {
            logger::info_p("dungeon", "auto-chest walk finished");
            queue.pop();
            return Ok(fine);
        }
        last = id.frame;
    }
}

fn copy_sequence(s: &mut Session, apply: bool) {
    s.ctx.active_sequence = if apply { s.quest.spell_sequence.clone() } else { None };
}

enum MapTick {
    Next(Option<FineState>),
    /// No waypoints left.
    Done,
}

fn on_map(s: &mut Session, run: &mut Run, queue: &mut WaypointQueue, since: Duration) -> Step<MapTick> {
    let Some(head) = queue.front() else {
        return Ok(MapTick::Done);
    };
    if std::mem::take(&mut s.ctx.should_apply_sequence) && head.apply_spell_sequence {
        logger::info_p("dungeon", "applying the quest's spell sequence");
        copy_sequence(s, true);
    }
    if head.target == Target::ChestAuto {
        return auto_chest(s, queue).map(MapTick::Next);
    }

    s.sleep(1.0)?;
    s.tap(OPEN_MAP)?;
    let before = queue.len();
    let next = navigator::state_search(s, queue, since)?;
    if queue.len() == before {
        run.map_stalls += 1;
        logger::debug_p("dungeon", &format!("map stall {}", run.map_stalls));
        if run.map_stalls > s.retry.map_stall_limit {
            run.map_stalls = 0;
            return Err(recovery::restart_game(s, false));
        }
    } else {
        run.map_stalls = 0;
    }
    let Some(head) = queue.front() else {
        logger::info_p("dungeon", "all waypoints done");
        return Ok(MapTick::Done);
    };
    if queue.len() != before {
        let apply = head.apply_spell_sequence;
        copy_sequence(s, apply);
    }
    Ok(MapTick::Next(next))
}

/// Run the dungeon until the Inn, a quit marker, or an empty waypoint list.
pub fn state_dungeon(s: &mut Session, queue: &mut WaypointQueue) -> Step<()> {
    let mut run = Run {
        freeze: FreezeDetector::new(),
        map_stalls: 0,
        chest_pending: false,
        combat_pending: false,
        should_recover: false,
    };
    let since = s.now();
    let mut state: Option<FineState> = None;
    s.ctx.should_apply_sequence = true;

    loop {
        s.check_stop()?;
        logger::debug_p("dungeon", &format!("state {:?}", state));
        state = match state {
            None => {
                let id = identify::identify_state(s)?;
                if id.coarse != CoarseState::Dungeon || id.fine == Some(FineState::Quit) {
                    logger::info_p("dungeon", &format!("left the dungeon ({:?})", id.coarse));
                    return Ok(());
                }
                if run.freeze.push(&id.frame) {
                    logger::error_p("dungeon", "screen frozen");
                    run.freeze.clear();
                    return Err(recovery::restart_game(s, false));
                }
                let now = s.now();
                let limit = s.retry.phase_timeout;
                for (phase, started) in [("chest", s.ctx.chest_started), ("combat", s.ctx.combat_started)] {
                    if started.is_some_and(|t| now.saturating_sub(t) > limit) {
                        logger::error_p("dungeon", &format!("{} took too long", phase));
                        return Err(recovery::restart_game(s, false));
                    }
                }
                id.fine
            }
            Some(FineState::Quit) => return Ok(()),
            Some(FineState::Dungeon) => on_dungeon(s, &mut run)?,
            Some(FineState::Map) => match on_map(s, &mut run, queue, since)? {
                MapTick::Next(next) => next,
                MapTick::Done => return Ok(()),
            },
            Some(FineState::Chest) => {
                run.chest_pending = true;
                chest::state_chest(s)?
            }
            Some(FineState::Combat) => {
                run.combat_pending = true;
                combat::state_combat(s)?;
                None
            }
        };
    }
}
