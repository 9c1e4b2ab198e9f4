//! One combat tick: speed-up, scripted sequence, auto battle or the ability
//! priority list, with basic attacks when nothing can be cast.

use rand::Rng;

use crate::interrupt::Step;
use crate::logger;
use crate::matcher::Roi;
use crate::session::Session;
use crate::types::{Frame, Point, Rect};

const ATTACK: Point = Point::new(850, 1100);
const AUTO_BUTTON: Rect = Rect::new(700, 1000, 200, 200);
/// Enemy positions swept when a cast asks for a target without a prompt.
const ENEMY_ROW: [i32; 6] = [150, 300, 450, 550, 650, 750];
const ENEMY_ROW_Y: i32 = 750;

fn ability(name: &str) -> String {
    format!("spellskill/{}", name)
}

fn basic_attack(s: &mut Session) -> Step<()> {
    s.tap(ATTACK)?;
    s.sleep(0.5)?;
    s.tap(ATTACK)?;
    s.sleep(3.0)
}

fn short_of_resource(s: &mut Session, frame: &Frame) -> bool {
    s.find(frame, "notenoughsp").is_some() || s.find(frame, "notenoughmp").is_some()
}

/// Close the shortage dialog, pick the lowest level and confirm at `confirm`.
fn recast_lowest_level(s: &mut Session, frame: &Frame, confirm: Point) -> Step<()> {
    logger::info_p("combat", "not enough points, dropping to level 1");
    let close = s.find(frame, "notenough_close");
    s.press(close)?;
    let frame = s.capture()?;
    let lv1 = s.find(&frame, &ability("lv1"));
    s.press(lv1)?;
    s.tap(confirm)?;
    s.sleep(1.0)
}

/// Confirm a selected ability. Returns whether an `OK` prompt took it.
fn double_confirm(s: &mut Session) -> Step<bool> {
    s.sleep(1.0)?;
    let frame = s.capture()?;
    let mut confirmed = false;
    if let Some(ok) = s.find(&frame, "OK") {
        s.tap(ok)?;
        confirmed = true;
        s.sleep(2.0)?;
        let after = s.capture()?;
        if short_of_resource(s, &after) {
            recast_lowest_level(s, &after, ok)?;
        }
    } else if let Some(next) = s.find(&frame, "next") {
        let mut rng = rand::thread_rng();
        let target = Point::new(next.x - 15 + rng.gen_range(0..30), next.y + 150 + rng.gen_range(0..30));
        s.tap(target)?;
        s.sleep(1.0)?;
        let after = s.capture()?;
        if short_of_resource(s, &after) {
            recast_lowest_level(s, &after, target)?;
        }
    } else {
        for x in ENEMY_ROW {
            s.tap(Point::new(x, ENEMY_ROW_Y))?;
            s.sleep(0.1)?;
        }
        s.sleep(2.0)?;
    }
    s.sleep(1.0)?;
    Ok(confirmed)
}

/// Scripted answer for the first enemy signature on screen. `false` when no
/// signature matched.
fn cast_from_sequence(s: &mut Session, frame: &Frame) -> Step<bool> {
    let Some(sequence) = s.ctx.active_sequence.clone() else {
        return Ok(false);
    };
    for (signature, abilities) in &sequence {
        let Some(next) = abilities.first() else {
            continue;
        };
        if s.find(frame, &ability(signature)).is_none() {
            continue;
        }
        let Some(at) = s.find(frame, &ability(next)) else {
            logger::info_p("combat", &format!("{} answers {} but is not available", next, signature));
            basic_attack(s)?;
            return Ok(true);
        };
        // The last entry stays for every later turn.
        if abilities.len() > 1 {
            if let Some(list) = s.ctx.active_sequence.as_mut().and_then(|m| m.get_mut(signature)) {
                list.remove(0);
            }
        }
        logger::info_p("combat", &format!("{} -> {}", signature, next));
        s.tap(at)?;
        if next != "defend" {
            double_confirm(s)?;
        }
        return Ok(true);
    }
    Ok(false)
}

fn auto_battle(s: &mut Session, frame: &Frame) -> Step<()> {
    let roi = Roi::single(AUTO_BUTTON);
    let auto = s.find_in(frame, "combatAuto", &roi);
    if !s.press(auto)? {
        let auto = s.find_in(frame, "combatAuto_2", &roi);
        s.press(auto)?;
    }
    s.sleep(5.0)
}

/// Walk the priority list and cast the first available ability.
fn cast_by_priority(s: &mut Session, frame: &Frame) -> Step<bool> {
    for name in s.settings.spell_priority.clone() {
        let is_aoe = s.settings.aoe_abilities.contains(&name);
        if is_aoe && s.ctx.enough_aoe {
            continue;
        }
        let Some(at) = s.find(frame, &ability(&name)) else {
            continue;
        };
        logger::info_p("combat", &format!("casting {}", name));
        s.tap(at)?;
        if double_confirm(s)? && s.settings.aoe_once && is_aoe {
            s.ctx.aoe_casts += 1;
            if s.ctx.aoe_casts >= s.settings.aoe_budget {
                logger::info_p("combat", "area budget spent for this fight");
                s.ctx.enough_aoe = true;
                s.ctx.aoe_casts = 0;
            }
        }
        return Ok(true);
    }
    Ok(false)
}

pub fn state_combat(s: &mut Session) -> Step<()> {
    if s.ctx.combat_started.is_none() {
        s.ctx.combat_started = Some(s.now());
    }
    let frame = s.capture()?;

    if !s.ctx.speed_applied {
        if let Some(p) = s.find(&frame, "combatSpd") {
            s.tap(p)?;
            s.ctx.speed_applied = true;
            s.sleep(1.0)?;
        }
    }

    if cast_from_sequence(s, &frame)? {
        return Ok(());
    }

    if s.settings.system_auto_combat || (s.ctx.enough_aoe && s.settings.auto_after_aoe) {
        return auto_battle(s, &frame);
    }

    if s.find(&frame, "flee").is_none() {
        return Ok(());
    }

    let cast = if s.ctx.self_sacrifice {
        let defend = s.find(&frame, &ability("defend"));
        s.press(defend)?
    } else {
        cast_by_priority(s, &frame)?
    };
    if !cast {
        logger::debug_p("combat", "nothing castable, attacking");
        let frame = s.capture()?;
        let close = s.find(&frame, "combatClose");
        s.press(close)?;
        basic_attack(s)?;
    }
    Ok(())
}
