//! Screen classification. One call may dismiss several dialogs on the way
//! and always ends: with a state, a stop, or a forced restart.

use rand::Rng;

use crate::frame;
use crate::interrupt::Step;
use crate::logger;
use crate::matcher::Roi;
use crate::poller::{self, Action, Fallback};
use crate::recovery;
use crate::session::Session;
use crate::types::{CoarseState, FineState, Frame, Point, Rect};

/// Variants of the in-combat banner, all shown in the top-left corner.
pub const COMBAT_VARIANTS: [&str; 4] = ["combatActive", "combatActive_2", "combatActive_3", "combatActive_4"];
const COMBAT_BANNER: Rect = Rect::new(0, 0, 150, 80);

/// Passes before unstick taps and dialog sweeps start.
const ESCALATE_AFTER: u32 = 4;
const BLACK_SCREEN_AFTER: u32 = 15;
const PASS_LIMIT: u32 = 25;

/// Choices taken whenever one of these dialogs blocks the screen.
const DIALOG_CHOICES: [&str; 12] = [
    "adventurersbones",
    "halfBone",
    "nothanks",
    "strange_things",
    "blessing",
    "DontBuyIt",
    "donthelp",
    "buyNothing",
    "Nope",
    "ignorethequest",
    "dontGiveAntitoxin",
    "pass",
];

#[derive(Debug, Clone)]
pub struct Identified {
    pub coarse: CoarseState,
    pub fine: Option<FineState>,
    pub frame: Frame,
}

impl Identified {
    fn new(coarse: CoarseState, fine: Option<FineState>, frame: Frame) -> Self {
        Self { coarse, fine, frame }
    }
}

/// Which phase a revive interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revive {
    Combat,
    Chest,
}

pub fn combat_active(s: &mut Session, frame: &Frame) -> Option<Point> {
    let roi = Roi::single(COMBAT_BANNER);
    COMBAT_VARIANTS.iter().find_map(|name| s.find_in(frame, name, &roi))
}

/// In-dungeon sub-state from the fixed markers, checked in priority order.
pub fn dungeon_marker(s: &mut Session, frame: &Frame) -> Option<FineState> {
    if s.find(frame, "dungFlag").is_some() {
        Some(FineState::Dungeon)
    } else if s.find(frame, "chestFlag").is_some() || s.find(frame, "whowillopenit").is_some() {
        Some(FineState::Chest)
    } else if s.find(frame, "mapFlag").is_some() {
        Some(FineState::Map)
    } else if combat_active(s, frame).is_some() {
        Some(FineState::Combat)
    } else {
        None
    }
}

fn is_black(s: &mut Session, frame: &Frame) -> bool {
    match s.templates.get("blackScreen") {
        Some(t) if t.dimensions() == frame.dimensions() => {
            frame::mean_abs_diff(&frame::to_gray(frame), &frame::to_gray(&t)) < 0.02
        }
        _ => frame::mean_brightness(frame) < 15.0,
    }
}

/// Party wiped and was revived: undo the phase's count and force a recovery pass.
pub fn rise_again_reset(s: &mut Session, phase: Revive) -> Step<()> {
    s.ctx.self_sacrifice = false;
    s.ctx.should_apply_sequence = true;
    s.ctx.recover_after_revive = true;
    match phase {
        Revive::Combat => s.ctx.counters.combats = s.ctx.counters.combats.saturating_sub(1),
        Revive::Chest => s.ctx.counters.chests = s.ctx.counters.chests.saturating_sub(1),
    }
    s.note(&format!("party revived during {:?}", phase).to_lowercase());
    s.tap(Point::new(450, 750))?;
    s.sleep(10.0)
}

enum Pass {
    Done(Identified),
    /// A dialog was dismissed; classify again right away.
    Rerun,
    Unknown(Frame),
}

fn classify(s: &mut Session) -> Step<Pass> {
    let frame = s.capture()?;
    if poller::try_press_retry(s, &frame)? {
        s.sleep(2.0)?;
    }
    if let Some(fine) = dungeon_marker(s, &frame) {
        return Ok(Pass::Done(Identified::new(CoarseState::Dungeon, Some(fine), frame)));
    }

    if s.find(&frame, "someonedead").is_some() {
        s.note("a party member is down");
        for _ in 0..5 {
            let mut rng = rand::thread_rng();
            let p = Point::new(400 + rng.gen_range(0..100), 750 + rng.gen_range(0..100));
            s.tap(p)?;
            s.sleep_jitter(1.0)?;
        }
    }

    if let Some(p) = s.find(&frame, "returnText") {
        s.tap(p)?;
        s.sleep(2.0)?;
        return Ok(Pass::Rerun);
    }

    if s.find(&frame, "returntoTown").is_some() {
        if s.ctx.met_chest_or_combat {
            logger::info_p("identify", "back in town after a fight, heading to the inn");
            let back = Fallback::Sequence(vec![Action::Return, Action::Tap(Point::new(1, 1))]);
            poller::find_or_fallback(s, &["Inn"], &back, 1.0)?;
            return Ok(Pass::Done(Identified::new(CoarseState::Inn, None, frame)));
        }
        return Ok(Pass::Done(Identified::new(CoarseState::EdgeOfTown, None, frame)));
    }

    if let Some(p) = s.find(&frame, "openworldmap") {
        if s.ctx.met_chest_or_combat {
            s.tap(p)?;
            return Ok(Pass::Rerun);
        }
        return Ok(Pass::Done(Identified::new(CoarseState::EdgeOfTown, None, frame)));
    }

    if s.find(&frame, "Inn").is_some() {
        return Ok(Pass::Done(Identified::new(CoarseState::Inn, None, frame)));
    }

    let symbols = s.quest.special_force_stop_symbols.clone();
    if let Some(sym) = symbols.iter().find(|sym| s.find(&frame, sym).is_some()) {
        logger::warn_p("identify", &format!("{} on screen, ending the run", sym));
        return Ok(Pass::Done(Identified::new(CoarseState::Quit, Some(FineState::Quit), frame)));
    }
    let options = s.quest.special_dialog_options.clone();
    for option in &options {
        if let Some(p) = s.find(&frame, option) {
            s.tap(p)?;
            return Ok(Pass::Rerun);
        }
    }

    Ok(Pass::Unknown(frame))
}

/// Dialog sweep run once a few passes went unclassified. `true` asks for a re-run.
fn escalate(s: &mut Session, frame: &Frame) -> Step<bool> {
    if s.find(frame, "RiseAgain").is_some() {
        rise_again_reset(s, Revive::Combat)?;
        return Ok(true);
    }
    if s.find(frame, "worldmapflag").is_some() {
        for _ in 0..3 {
            s.tap(Point::new(100, 1500))?;
            s.sleep(0.5)?;
        }
        s.tap(Point::new(250, 1500))?;
    }
    if let Some(p) = s.find(frame, "sandman_recover") {
        s.tap(p)?;
        return Ok(true);
    }
    for choice in DIALOG_CHOICES {
        if let Some(p) = s.find(frame, &format!("dialogueChoices/{}", choice)) {
            s.tap(p)?;
            s.sleep(2.0)?;
            if choice == "adventurersbones" || choice == "halfBone" {
                s.note("picked up adventurer's bones");
            }
            return Ok(true);
        }
    }
    if s.find(frame, "multipeopledead").is_some() {
        s.ctx.self_sacrifice = true;
        s.note("several party members are down, switching to defend");
        let skull = s.find(frame, "skull");
        s.press(skull)?;
        s.sleep(2.0)?;
    }
    if let Some(p) = s.find(frame, "startdownload") {
        s.tap(p)?;
        s.sleep(2.0)?;
    }
    if let Some(p) = s.find(frame, "totitle") {
        s.tap(p)?;
        return Ok(true);
    }
    s.back()?;
    s.sleep(0.5)?;
    s.back()?;
    Ok(false)
}

/// Classify the current screen. Every pass, re-runs included, counts toward
/// the pass limit, after which the game is restarted.
pub fn identify_state(s: &mut Session) -> Step<Identified> {
    let mut pass = 0u32;
    loop {
        s.check_stop()?;
        if pass > PASS_LIMIT {
            logger::error_p("identify", "dialogs kept reappearing");
            return Err(recovery::restart_game(s, false));
        }
        let frame = match classify(s)? {
            Pass::Done(id) => {
                logger::debug_p("identify", &format!("{:?}/{:?} after {} passes", id.coarse, id.fine, pass));
                return Ok(id);
            }
            Pass::Rerun => {
                pass += 1;
                continue;
            }
            Pass::Unknown(frame) => frame,
        };

        if pass >= ESCALATE_AFTER {
            if escalate(s, &frame)? {
                pass += 1;
                continue;
            }
        }
        if pass > BLACK_SCREEN_AFTER && is_black(s, &frame) {
            logger::warn_p("identify", &format!("black screen, restart in {} passes", PASS_LIMIT.saturating_sub(pass)));
        }
        if pass >= PASS_LIMIT {
            logger::error_p("identify", "screen never classified");
            return Err(recovery::restart_game(s, false));
        }
        if pass >= ESCALATE_AFTER {
            for i in 0..3 {
                if i > 0 {
                    s.sleep_jitter(0.25)?;
                }
                s.tap(Point::new(1, 1))?;
            }
        }
        s.sleep(1.0)?;
        pass += 1;
    }
}
