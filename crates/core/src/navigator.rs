//! Map search for the head waypoint and the walk that follows a hit.

use std::time::Duration;

use crate::frame;
use crate::identify;
use crate::interrupt::Step;
use crate::logger;
use crate::matcher::{self, Roi};
use crate::poller::{self, Action, Fallback};
use crate::quest::{Target, Waypoint, WaypointQueue};
use crate::session::Session;
use crate::types::{CoarseState, FineState, Frame, Point, Rect};

/// Half-size of the box checked around a position or stair.
const NEAR: i32 = 33;
const CURSORS: [&str; 4] = ["cursor_0", "cursor_1", "cursor_2", "cursor_3"];
const DIRECTIONAL_STAIRS: [&str; 3] = ["stair_up", "stair_down", "stair_teleport"];
const AUTO_MOVE: Point = Point::new(136, 1431);
pub const OPEN_MAP: Point = Point::new(777, 150);
/// Frame-to-frame change below which the party is standing still.
const STILL: f32 = 0.1;

enum Sighting {
    /// The map was not open.
    NoMap,
    Missing,
    Found(Point),
}

fn seen_near(s: &mut Session, frame: &Frame, name: &str, at: Point) -> bool {
    let Some(template) = s.templates.get(name) else {
        return false;
    };
    matcher::match_in_region(frame, &template, Rect::around(at, NEAR, NEAR)).is_some_and(|m| m.found())
}

/// Where the party cursor sits on the open map.
fn party_position(s: &mut Session, frame: &Frame) -> Option<Point> {
    CURSORS.iter().find_map(|c| s.find(frame, c))
}

/// Of several chests on the map, the one closest to the party. The strongest
/// hit when the cursor is hidden.
fn nearest_chest(s: &mut Session, frame: &Frame, roi: &Roi) -> Option<Point> {
    let hits = s.find_all_in(frame, "chest", roi);
    if hits.len() < 2 {
        return hits.first().copied();
    }
    let Some(party) = party_position(s, frame) else {
        return hits.first().copied();
    };
    logger::info_p("map", &format!("{} chests visible, taking the nearest", hits.len()));
    hits.into_iter()
        .min_by_key(|h| (h.x - party.x).pow(2) + (h.y - party.y).pow(2))
}

/// Try the waypoint's scroll sequence until the target shows up.
fn scan(s: &mut Session, waypoint: &Waypoint) -> Step<Sighting> {
    let mut sighting = Sighting::Missing;
    for swipe in &waypoint.swipes {
        let mut frame = s.capture()?;
        if s.find(&frame, "mapFlag").is_none() {
            logger::warn_p("map", "map closed during search");
            return Ok(Sighting::NoMap);
        }
        if let Some(sw) = swipe {
            s.swipe(*sw)?;
            s.sleep(2.0)?;
            frame = s.capture()?;
        }

        sighting = match &waypoint.target {
            Target::Position(at) => {
                if CURSORS.iter().any(|c| seen_near(s, &frame, c, *at)) {
                    logger::info_p("map", &format!("already at ({}, {})", at.x, at.y));
                    Sighting::Missing
                } else {
                    Sighting::Found(*at)
                }
            }
            Target::Stair { name, at } if DIRECTIONAL_STAIRS.contains(&name.as_str()) => {
                if seen_near(s, &frame, name, *at) {
                    Sighting::Found(*at)
                } else {
                    Sighting::Missing
                }
            }
            Target::Stair { name, at } => {
                // A floor marker on screen means the floor change already happened.
                if s.find(&frame, name).is_some() {
                    Sighting::Missing
                } else {
                    Sighting::Found(*at)
                }
            }
            Target::ChestAuto => Sighting::Missing,
            Target::Named(name) => match &waypoint.roi {
                Some(roi) if name == "chest" => nearest_chest(s, &frame, roi).map_or(Sighting::Missing, Sighting::Found),
                Some(roi) => s.find_in(&frame, name, roi).map_or(Sighting::Missing, Sighting::Found),
                None => match s.find(&frame, name) {
                    Some(_) => {
                        s.sleep(2.0)?;
                        s.tap(Point::new(1, 1255))?;
                        let frame = s.capture()?;
                        s.find(&frame, name).map_or(Sighting::Missing, Sighting::Found)
                    }
                    None => Sighting::Missing,
                },
            },
        };
        if matches!(sighting, Sighting::Found(_)) {
            break;
        }
    }
    Ok(sighting)
}

/// `true` when the named target is on the map and the party cursor is not
/// sitting on top of it.
fn visible_not_reached(s: &mut Session, frame: &Frame, waypoint: &Waypoint) -> bool {
    let name = waypoint.target.name();
    let Some(template) = s.templates.get(name) else {
        return false;
    };
    match matcher::match_template(frame, &template, waypoint.roi.as_ref()) {
        Some(m) if m.found() => matcher::center_matches(frame, &template, &m),
        _ => false,
    }
}

fn walk_to(s: &mut Session, at: Point) -> Step<Option<FineState>> {
    s.tap(at)?;
    s.tap(AUTO_MOVE)?;
    monitor_movement(s)
}

/// Follow an auto-move until the party stops, the screen leaves the dungeon
/// view, or the map reopens.
pub fn monitor_movement(s: &mut Session) -> Step<Option<FineState>> {
    s.ctx.resume_available = true;
    let mut last = None;
    loop {
        s.sleep(3.0)?;
        let id = identify::identify_state(s)?;
        let fine = if id.coarse == CoarseState::Dungeon { id.fine } else { None };
        match fine {
            Some(FineState::Dungeon) => {}
            Some(FineState::Map) => {
                let close = Fallback::Sequence(vec![Action::Tap(Point::new(280, 1433)), Action::Tap(Point::new(1, 1))]);
                poller::find_or_fallback(s, &["dungFlag"], &close, 1.0)?;
                return Ok(Some(FineState::Dungeon));
            }
            other => {
                logger::info_p("map", &format!("movement ended in {:?}", other));
                return Ok(other);
            }
        }
        let gray = frame::to_gray(&id.frame);
        if let Some(prev) = &last {
            let diff = frame::mean_abs_diff(prev, &gray);
            logger::debug_p("map", &format!("movement diff {:.3}", diff));
            if diff < STILL {
                logger::info_p("map", "party stopped");
                return Ok(None);
            }
        }
        last = Some(gray);
    }
}

/// Wait out a reached target, BACK-ing out of any dialog and watching for a
/// fight. Consumes the head once `timeout` has passed since `since`.
fn linger(s: &mut Session, queue: &mut WaypointQueue, since: Duration, timeout: Duration) -> Step<Option<FineState>> {
    s.back()?;
    s.sleep(0.5)?;
    s.back()?;
    loop {
        let frame = s.capture()?;
        if identify::combat_active(s, &frame).is_some() {
            return Ok(Some(FineState::Combat));
        }
        if s.now().saturating_sub(since) > timeout {
            if let Some(done) = queue.pop() {
                logger::info_p("map", &format!("{} done after waiting", done.target.name()));
            }
            s.sleep(1.0)?;
            s.tap(OPEN_MAP)?;
            return Ok(None);
        }
        s.sleep(1.0)?;
    }
}

/// Search the open map for the head waypoint and act on the result. The head
/// is popped exactly when it is known to be done.
pub fn state_search(s: &mut Session, queue: &mut WaypointQueue, since: Duration) -> Step<Option<FineState>> {
    let Some(waypoint) = queue.front().cloned() else {
        return Ok(None);
    };
    let frame = s.capture()?;
    if s.find(&frame, "mapFlag").is_none() {
        return Ok(None);
    }
    let name = waypoint.target.name().to_string();

    let at = match scan(s, &waypoint)? {
        Sighting::NoMap => return Ok(None),
        Sighting::Missing => {
            if waypoint.target.consumed_when_missing() {
                logger::info_p("map", &format!("{} no longer on the map", name));
                queue.pop();
            } else {
                logger::info_p("map", &format!("{} not found, keeping it", name));
            }
            return Ok(Some(FineState::Map));
        }
        Sighting::Found(at) => at,
    };
    logger::info_p("map", &format!("{} at ({}, {})", name, at.x, at.y));

    if waypoint.target.is_place() {
        return walk_to(s, at);
    }
    let frame = s.capture()?;
    if visible_not_reached(s, &frame, &waypoint) {
        return walk_to(s, at);
    }
    let timeout = Duration::from_secs(s.settings.dungeon_wait_timeout_secs);
    if timeout.is_zero() {
        logger::info_p("map", &format!("{} reached", name));
        queue.pop();
        return Ok(Some(FineState::Map));
    }
    linger(s, queue, since, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::FarmQuest;
    use crate::session::testing::*;
    use crate::sleep::Clock;

    fn queue_of(waypoints: &str) -> WaypointQueue {
        let text = format!(r#"{{ "q": {{ "type": "dungeon", "waypoints": {} }} }}"#, waypoints);
        WaypointQueue::new(&FarmQuest::parse(&text, "q").unwrap().waypoints)
    }

    #[test]
    fn reached_target_is_consumed_once() {
        let mut r = rig();
        let (map, shrine) = (icon(1), icon(2));
        r.session.templates.insert("mapFlag", map.clone());
        r.session.templates.insert("shrine", shrine.clone());
        let mut queue = queue_of(r#"[["shrine", [null]], ["harken", [null], "default"]]"#);
        assert_eq!(queue.len(), 2);

        let with_shrine = scene(&[(&map, 40, 40), (&shrine, 400, 600)]);
        r.device.push_frame(&scene(&[(&map, 40, 40)])).unwrap();
        r.device.push_frame(&with_shrine).unwrap();
        r.device.push_frame(&with_shrine).unwrap();
        // the focus capture no longer shows the icon: the party stands on it

        let next = state_search(&mut r.session, &mut queue, Duration::ZERO).unwrap();
        assert_eq!(next, Some(FineState::Map));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().target.name(), "harken");
        assert!(r.device.shell_log().contains(&"input tap 1 1255".to_string()));
    }

    #[test]
    fn position_under_cursor_is_consumed() {
        let mut r = rig();
        let (map, cursor) = (icon(3), icon(4));
        r.session.templates.insert("mapFlag", map.clone());
        r.session.templates.insert("cursor_0", cursor.clone());
        let mut queue = queue_of(r#"[["position", [null], [480, 800]], ["harken", [null]]]"#);
        let screen = scene(&[(&map, 40, 40), (&cursor, 448, 776)]);
        r.device.push_frame(&screen).unwrap();
        r.device.push_frame(&screen).unwrap();
        let next = state_search(&mut r.session, &mut queue, Duration::ZERO).unwrap();
        assert_eq!(next, Some(FineState::Map));
        assert_eq!(queue.len(), 1);
        assert!(r.device.shell_log().is_empty());
    }

    #[test]
    fn unseen_icon_is_kept() {
        let mut r = rig();
        let map = icon(5);
        r.session.templates.insert("mapFlag", map.clone());
        r.session.templates.insert("shrine", icon(6));
        let mut queue = queue_of(r#"[["shrine", null]]"#);
        r.device.set_idle(&scene(&[(&map, 40, 40)])).unwrap();
        let next = state_search(&mut r.session, &mut queue, Duration::ZERO).unwrap();
        assert_eq!(next, Some(FineState::Map));
        assert_eq!(queue.len(), 1);
        // one unscrolled look plus the five directions
        let swipes = r.device.shell_log().iter().filter(|c| c.starts_with("input swipe")).count();
        assert_eq!(swipes, 5);
    }

    #[test]
    fn closed_map_leaves_queue_alone() {
        let mut r = rig();
        r.session.templates.insert("mapFlag", icon(7));
        let mut queue = queue_of(r#"[["chest", []]]"#);
        let next = state_search(&mut r.session, &mut queue, Duration::ZERO).unwrap();
        assert_eq!(next, None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn place_target_walks_until_still() {
        let mut r = rig();
        let (map, harken, dung) = (icon(8), icon(9), icon(10));
        r.session.templates.insert("mapFlag", map.clone());
        r.session.templates.insert("harken", harken.clone());
        r.session.templates.insert("dungFlag", dung.clone());
        let mut queue = queue_of(r#"[["harken", [null], "default"]]"#);
        let on_map = scene(&[(&map, 40, 40), (&harken, 400, 600)]);
        r.device.push_frame(&on_map).unwrap();
        r.device.push_frame(&on_map).unwrap();
        r.device.set_idle(&scene(&[(&dung, 96, 1400)])).unwrap();

        let next = state_search(&mut r.session, &mut queue, Duration::ZERO).unwrap();
        assert_eq!(next, None);
        assert_eq!(queue.len(), 1, "arrival is confirmed by a later search");
        assert!(r.session.ctx.resume_available);
        assert_eq!(&r.device.shell_log()[..2], ["input tap 432 624", "input tap 136 1431"]);
    }

    #[test]
    fn nearest_of_several_chests_is_walked_to() {
        let mut r = rig();
        let (map, chest, cursor, dung) = (icon(13), icon(14), icon(15), icon(16));
        r.session.templates.insert("mapFlag", map.clone());
        r.session.templates.insert("chest", chest.clone());
        r.session.templates.insert("cursor_0", cursor.clone());
        r.session.templates.insert("dungFlag", dung.clone());
        let mut queue = queue_of(r#"[["chest", [null]]]"#);
        let on_map = scene(&[(&map, 40, 40), (&chest, 200, 500), (&chest, 600, 1000), (&cursor, 640, 1100)]);
        r.device.push_frame(&on_map).unwrap();
        r.device.push_frame(&on_map).unwrap();
        r.device.set_idle(&scene(&[(&dung, 96, 1400)])).unwrap();

        state_search(&mut r.session, &mut queue, Duration::ZERO).unwrap();
        assert_eq!(&r.device.shell_log()[..2], ["input tap 632 1024", "input tap 136 1431"]);
    }

    #[test]
    fn wait_timeout_consumes_after_deadline() {
        let mut r = rig();
        r.session.settings.dungeon_wait_timeout_secs = 5;
        let (map, shrine) = (icon(11), icon(12));
        r.session.templates.insert("mapFlag", map.clone());
        r.session.templates.insert("shrine", shrine.clone());
        let mut queue = queue_of(r#"[["shrine", [null], [[0, 400, 900, 800]]]]"#);
        let with_shrine = scene(&[(&map, 40, 40), (&shrine, 400, 600)]);
        r.device.push_frame(&with_shrine).unwrap();
        r.device.push_frame(&with_shrine).unwrap();

        let next = state_search(&mut r.session, &mut queue, r.clock.now()).unwrap();
        assert_eq!(next, None);
        assert!(queue.is_empty());
        let log = r.device.shell_log();
        assert_eq!(log.iter().filter(|c| *c == "input keyevent KEYCODE_BACK").count(), 2);
        assert_eq!(log.last().unwrap(), "input tap 777 150");
    }
}
