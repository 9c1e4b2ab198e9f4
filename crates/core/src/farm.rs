//! The outer loop: Inn, edge of town, dungeon, and round again until stopped.

use serde_json::Value;

use crate::dungeon;
use crate::identify;
use crate::interrupt::{Interrupt, Sequence, Step};
use crate::logger;
use crate::poller::{self, Action, Fallback};
use crate::quest::{TownAction, WaypointQueue};
use crate::session::Session;
use crate::types::{CoarseState, Milestone, Point};

const CLOSE_TOWN_PANEL: Point = Point::new(550, 1);

/// Rest at the Inn: pick a room, confirm, and leave the menu.
pub fn state_inn(s: &mut Session) -> Step<()> {
    let room = if s.settings.royal_suite_rest { "royalsuite" } else { "Economy" };
    let book = Fallback::Sequence(vec![
        Action::press("Inn"),
        Action::press("Stay"),
        Action::press(room),
        Action::Tap(Point::new(1, 1)),
    ]);
    poller::find_or_fallback(s, &["OK"], &book, 2.0)?;
    let confirm = Fallback::Sequence(vec![Action::press("OK"), Action::Tap(Point::new(299, 1464))]);
    poller::find_or_fallback(s, &["Stay"], &confirm, 2.0)?;
    s.back()
}

fn then_tap(fallback: Fallback, p: Point) -> Fallback {
    let mut actions = match fallback {
        Fallback::Nothing => Vec::new(),
        Fallback::Act(a) => vec![a],
        Fallback::Sequence(actions) => actions,
    };
    actions.push(Action::Tap(p));
    Fallback::Sequence(actions)
}

/// Travel from town to a world-map location.
fn teleport(s: &mut Session, target: &str, swipe: &Value) -> Step<()> {
    let scroll = Fallback::from_value(swipe).map_err(|e| s.fatal(e.context(format!("world map swipe for {}", target))))?;
    let close_panels = Fallback::Sequence(vec![
        Action::press("closePartyInfo"),
        Action::press("closePartyInfo_fortress"),
        Action::Tap(CLOSE_TOWN_PANEL),
    ]);
    poller::find_or_fallback(s, &["intoWorldMap", "dungFlag", "worldmapflag", "openworldmap"], &close_panels, 1.0)?;

    let frame = s.capture()?;
    if s.find(&frame, "dungFlag").is_some() || s.find(&frame, "openworldmap").is_some() {
        logger::info_p("dungeon", "already past the world map");
        return Ok(());
    }
    let into = s.find(&frame, "intoWorldMap");
    if s.press(into)? {
        s.sleep(0.5)?;
        poller::find_or_fallback(s, &["worldmapflag"], &Fallback::press("intoWorldMap"), 1.0)?;
    }

    s.sleep(0.5)?;
    if !s.ctx.world_map_zoomed {
        for _ in 0..3 {
            s.tap(Point::new(100, 1500))?;
            s.sleep(0.5)?;
        }
        s.tap(Point::new(250, 1500))?;
        s.ctx.world_map_zoomed = true;
    }
    let hit = poller::find_or_fallback(s, &[target], &then_tap(scroll, CLOSE_TOWN_PANEL), 1.0)?;
    s.sleep(1.0)?;
    s.tap(hit.at)?;
    s.sleep(1.0)?;
    let arrive = Fallback::Sequence(vec![Action::press(target), Action::Tap(CLOSE_TOWN_PANEL)]);
    poller::find_or_fallback(s, &["Inn", "openworldmap", "dungFlag"], &arrive, 1.0)?;
    Ok(())
}

/// Run the quest's edge-of-town actions, then enter the dungeon.
pub fn state_edge_of_town(s: &mut Session) -> Step<()> {
    s.ctx.resume_available = false;
    if let Some(check) = s.quest.pre_edge_of_town_check.clone() {
        let frame = s.capture()?;
        let p = s.find(&frame, &check);
        s.press(p)?;
    }
    for action in s.quest.edge_of_town_actions.clone() {
        match action {
            TownAction::WorldMap { target, swipe } => teleport(s, &target, &swipe)?,
            TownAction::Poll { press, target, fallback, wait_secs } => {
                let fallback = Fallback::from_value(&fallback)
                    .map_err(|e| s.fatal(e.context(format!("edge-of-town fallback for {}", target))))?;
                let hit = poller::find_or_fallback(s, &[target.as_str()], &fallback, wait_secs)?;
                if press {
                    s.tap(hit.at)?;
                }
            }
        }
    }
    s.sleep(1.0)?;
    let frame = s.capture()?;
    let go = s.find(&frame, "GotoDung");
    s.press(go)?;
    Ok(())
}

/// Close the lap that just ended. `None` on the first arrival at the Inn.
fn lap_summary(s: &mut Session) -> Option<String> {
    let started = s.ctx.lap_started?;
    let lap = s.now().saturating_sub(started);
    s.ctx.total_time += lap;
    s.ctx.last_lap = lap;

    let c = s.ctx.counters;
    let total = s.ctx.total_time.as_secs_f64();
    let mut text = format!(
        "{} runs of \"{}\". total {:.2}s, last lap {:.2}s.",
        c.dungeons,
        s.quest.name,
        total,
        lap.as_secs_f64()
    );
    if c.chests > 0 {
        let n = c.chests as f64;
        text += &format!(
            "\n{:.2}s per chest. {} chests opened, {:.2}s each on average.",
            total / n,
            c.chests,
            s.ctx.chest_time.as_secs_f64() / n
        );
    }
    if c.combats > 0 {
        text += &format!(
            "\n{} fights, {:.2}s each on average.",
            c.combats,
            s.ctx.combat_time.as_secs_f64() / c.combats as f64
        );
    }
    if !s.ctx.notable.is_empty() {
        text = format!("{}\n{}", s.ctx.notable.join("\n"), text);
    }
    Some(text)
}

/// Rest every `rest_interval + 1` laps, and only after a fight or a chest.
fn rest_due(s: &Session) -> bool {
    if !s.ctx.met_chest_or_combat {
        logger::info("nothing fought or opened, no rest needed");
        return false;
    }
    if !s.settings.active_rest {
        return false;
    }
    s.ctx.counters.dungeons.saturating_sub(1) % (s.settings.rest_interval + 1) == 0
}

fn farm_loop(s: &mut Session) -> Step<()> {
    let mut state: Option<CoarseState> = None;
    loop {
        s.sleep(1.0)?;
        s.check_stop()?;
        logger::debug(&format!("farm state {:?}", state));
        state = match state {
            None => {
                let mut seen = None;
                Sequence::new()
                    .then(|s: &mut Session| {
                        seen = Some(identify::identify_state(s)?.coarse);
                        Ok(())
                    })
                    .run(s)?;
                seen
            }
            Some(CoarseState::Quit) => {
                logger::info("quit marker seen, stopping");
                return Ok(());
            }
            Some(CoarseState::Inn) => {
                if let Some(text) = lap_summary(s) {
                    logger::info(&text);
                    s.emit(Milestone::Summary(text));
                }
                s.ctx.lap_started = Some(s.now());
                s.ctx.counters.dungeons += 1;
                s.emit_counters();
                if rest_due(s) {
                    logger::info("resting at the Inn");
                    s.ctx.met_chest_or_combat = false;
                    Sequence::new().then(state_inn).run(s)?;
                }
                Some(CoarseState::EdgeOfTown)
            }
            Some(CoarseState::EdgeOfTown) => {
                Sequence::new().then(state_edge_of_town).run(s)?;
                Some(CoarseState::Dungeon)
            }
            Some(CoarseState::Dungeon) => {
                let mut queue = WaypointQueue::new(&s.quest.waypoints);
                Sequence::new()
                    .then(|s: &mut Session| dungeon::state_dungeon(s, &mut queue))
                    .run(s)?;
                None
            }
        };
    }
}

/// Farm until stopped. Always reports `task_finished`; only a fatal
/// configuration error comes back as `Err`.
pub fn farm(s: &mut Session) -> Step<()> {
    logger::info(&format!("farming \"{}\"", s.quest.name));
    let result = farm_loop(s);
    s.emit(Milestone::TaskFinished);
    match result {
        Err(Interrupt::Stop) => {
            logger::info("stopped");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::FarmQuest;
    use crate::session::testing::*;
    use std::time::Duration;

    fn quest_with(extra: &str) -> FarmQuest {
        let text = format!(r#"{{ "q": {{ "type": "dungeon", "waypoints": [["harken", null, "default"]] {} }} }}"#, extra);
        FarmQuest::parse(&text, "q").unwrap()
    }

    #[test]
    fn inn_books_a_room() {
        let mut r = rig();
        let (inn, ok, stay) = (icon(1), icon(2), icon(3));
        r.session.templates.insert("Inn", inn.clone());
        r.session.templates.insert("OK", ok.clone());
        r.session.templates.insert("Stay", stay.clone());
        r.device.push_frame(&scene(&[(&inn, 400, 1000)])).unwrap();
        r.device.push_frame(&scene(&[(&ok, 400, 800)])).unwrap();
        r.device.push_frame(&scene(&[(&stay, 400, 600)])).unwrap();
        state_inn(&mut r.session).unwrap();
        assert_eq!(
            r.device.shell_log(),
            vec!["input tap 432 1024", "input tap 1 1", "input keyevent KEYCODE_BACK"]
        );
    }

    #[test]
    fn rest_interval_counts_laps() {
        let mut r = rig();
        r.session.settings.rest_interval = 2;
        r.session.ctx.met_chest_or_combat = true;
        let due: Vec<bool> = (1..=7)
            .map(|n| {
                r.session.ctx.counters.dungeons = n;
                rest_due(&r.session)
            })
            .collect();
        assert_eq!(due, [true, false, false, true, false, false, true]);
        r.session.ctx.met_chest_or_combat = false;
        assert!(!rest_due(&r.session));
    }

    #[test]
    fn summary_reports_averages() {
        let mut r = rig();
        assert!(lap_summary(&mut r.session).is_none());
        r.session.ctx.lap_started = Some(Duration::ZERO);
        r.session.ctx.counters.dungeons = 1;
        r.session.ctx.counters.chests = 2;
        r.session.ctx.chest_time = Duration::from_secs(30);
        r.session.ctx.notable.push("party revived during combat".into());
        r.clock.advance(Duration::from_secs(100));
        let text = lap_summary(&mut r.session).unwrap();
        assert!(text.starts_with("party revived during combat\n"));
        assert!(text.contains("total 100.00s"));
        assert!(text.contains("50.00s per chest"));
        assert!(text.contains("15.00s each"));
        assert!(!text.contains("fights"));
        assert_eq!(r.session.ctx.total_time, Duration::from_secs(100));
    }

    #[test]
    fn invalid_town_fallback_is_fatal() {
        let quest = quest_with(r#", "edgeOfTownActions": [["wait", "EdgeOfTown", {"tap": 1}, 1]]"#);
        let mut r = rig_with(Default::default(), quest);
        let res = state_edge_of_town(&mut r.session);
        assert!(matches!(res, Err(Interrupt::Fatal(_))));
        assert!(r.session.stop_flag().is_set());
        assert_eq!(r.device.screencaps(), 0);
    }

    #[test]
    fn town_action_taps_on_press() {
        let quest = quest_with(r#", "edgeOfTownActions": [["press", "EdgeOfTown", [1, 1], 1]]"#);
        let mut r = rig_with(Default::default(), quest);
        let (edge, go) = (icon(4), icon(5));
        r.session.templates.insert("EdgeOfTown", edge.clone());
        r.session.templates.insert("GotoDung", go.clone());
        r.device.push_frame(&blank()).unwrap();
        r.device.push_frame(&scene(&[(&edge, 400, 400)])).unwrap();
        r.device.push_frame(&scene(&[(&go, 400, 1200)])).unwrap();
        state_edge_of_town(&mut r.session).unwrap();
        assert_eq!(r.device.shell_log(), vec!["input tap 1 1", "input tap 432 424", "input tap 432 1224"]);
    }

    #[test]
    fn world_map_zooms_once() {
        let quest = quest_with(r#", "edgeOfTownActions": [["press", "intoWorldMap", ["DH", null]]]"#);
        let mut r = rig_with(Default::default(), quest);
        let (world, dh, inn) = (icon(6), icon(7), icon(8));
        r.session.templates.insert("worldmapflag", world.clone());
        r.session.templates.insert("DH", dh.clone());
        r.session.templates.insert("Inn", inn.clone());
        let world_map = scene(&[(&world, 40, 40), (&dh, 400, 800)]);
        r.device.push_frame(&world_map).unwrap();
        r.device.push_frame(&world_map).unwrap();
        r.device.push_frame(&world_map).unwrap();
        r.device.set_idle(&scene(&[(&inn, 400, 400)])).unwrap();
        state_edge_of_town(&mut r.session).unwrap();
        assert!(r.session.ctx.world_map_zoomed);
        let log = r.device.shell_log();
        assert_eq!(log.iter().filter(|c| *c == "input tap 100 1500").count(), 3);
        assert!(log.contains(&"input tap 432 824".to_string()));
    }

    #[test]
    fn farm_laps_until_quit_marker() {
        let quest = quest_with(r#", "specialForceStopSymbols": ["gameover"]"#);
        let (tx, rx) = std::sync::mpsc::channel();
        let Rig { device, session, .. } = rig_with(Default::default(), quest);
        let mut session = session.with_progress(tx);
        let (inn, over) = (icon(9), icon(10));
        session.templates.insert("Inn", inn.clone());
        session.templates.insert("gameover", over.clone());
        let at_inn = scene(&[(&inn, 400, 400)]);
        // identify, town, dungeon entry, identify, town
        for _ in 0..5 {
            device.push_frame(&at_inn).unwrap();
        }
        device.set_idle(&scene(&[(&over, 400, 400)])).unwrap();

        farm(&mut session).unwrap();
        assert_eq!(session.ctx.counters.dungeons, 2);
        let events: Vec<Milestone> = rx.try_iter().collect();
        assert_eq!(events.iter().filter(|m| matches!(m, Milestone::Summary(_))).count(), 1);
        assert_eq!(events.last(), Some(&Milestone::TaskFinished));
    }

    #[test]
    fn stop_ends_farm_cleanly() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut session = rig().session.with_progress(tx);
        session.stop_flag().set();
        farm(&mut session).unwrap();
        assert_eq!(rx.try_iter().last(), Some(Milestone::TaskFinished));
    }
}
