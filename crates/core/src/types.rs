use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Decoded screen image. Always 900x1600 portrait once it leaves the frame source.
pub type Frame = image::RgbImage;

/// Pixel coordinate on the device screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

impl From<[i32; 2]> for Point {
    fn from([x, y]: [i32; 2]) -> Self {
        Self::new(x, y)
    }
}

impl From<Point> for [i32; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned rectangle, serialized as `[x, y, w, h]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Box of `2 * half_w` by `2 * half_h` centred on `center`.
    pub fn around(center: Point, half_w: i32, half_h: i32) -> Self {
        Self::new(center.x - half_w, center.y - half_h, half_w * 2, half_h * 2)
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2, self.y + self.h / 2)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Intersection with the `width` x `height` area anchored at the origin.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let l = self.x.max(0);
        let t = self.y.max(0);
        let r = self.right().min(width as i32);
        let b = self.bottom().min(height as i32);
        (r > l && b > t).then(|| Rect::new(l, t, r - l, b - t))
    }
}

impl From<[i32; 4]> for Rect {
    fn from([x, y, w, h]: [i32; 4]) -> Self {
        Self::new(x, y, w, h)
    }
}

impl From<Rect> for [i32; 4] {
    fn from(r: Rect) -> Self {
        [r.x, r.y, r.w, r.h]
    }
}

/// A drag gesture from one point to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct Swipe {
    pub from: Point,
    pub to: Point,
}

impl Swipe {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { from: Point::new(x1, y1), to: Point::new(x2, y2) }
    }

    /// Parse the `input swipe x1 y1 x2 y2` form used in quest files.
    pub fn parse(cmd: &str) -> Option<Swipe> {
        let rest = cmd.trim().strip_prefix("input swipe")?;
        let nums: Vec<i32> = rest
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        match nums.as_slice() {
            [x1, y1, x2, y2, ..] => Some(Swipe::new(*x1, *y1, *x2, *y2)),
            _ => None,
        }
    }

    pub fn shell(&self) -> String {
        format!("input swipe {} {} {} {}", self.from.x, self.from.y, self.to.x, self.to.y)
    }
}

impl From<[i32; 4]> for Swipe {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Swipe::new(x1, y1, x2, y2)
    }
}

impl From<Swipe> for [i32; 4] {
    fn from(s: Swipe) -> Self {
        [s.from.x, s.from.y, s.to.x, s.to.y]
    }
}

/// Where the party is, as far as the screen tells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseState {
    Dungeon,
    Inn,
    EdgeOfTown,
    Quit,
}

/// Sub-state while inside a dungeon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FineState {
    Dungeon,
    Map,
    Chest,
    Combat,
    Quit,
}

/// Command from TUI to orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartStop,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Running,
    Stopping,
    Stopped,
}

/// Lifetime counters pushed to observers after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub dungeons: u32,
    pub combats: u32,
    pub chests: u32,
    pub restarts: u32,
}

/// Progress event for an external observer.
#[derive(Debug, Clone, PartialEq)]
pub enum Milestone {
    Counters(Counters),
    Summary(String),
    Notable(String),
    TaskFinished,
}

/// Cooperative cancellation flag shared between the observer and the engine thread.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swipe_parses_quest_form() {
        assert_eq!(Swipe::parse("input swipe 100 100 700 1200"), Some(Swipe::new(100, 100, 700, 1200)));
        assert_eq!(Swipe::parse("input swipe 1 2"), None);
        assert_eq!(Swipe::parse("input tap 1 2"), None);
        assert_eq!(Swipe::new(1, 2, 3, 4).shell(), "input swipe 1 2 3 4");
    }

    #[test]
    fn rect_clamps_to_frame() {
        let r = Rect::around(Point::new(10, 10), 33, 33);
        assert_eq!(r.clamp_to(900, 1600), Some(Rect::new(0, 0, 43, 43)));
        assert_eq!(Rect::new(950, 0, 10, 10).clamp_to(900, 1600), None);
        assert!(r.contains(0, 0));
        assert!(!r.contains(43, 0));
    }

    #[test]
    fn geometry_deserializes_from_arrays() {
        let r: Rect = serde_json::from_str("[0, 0, 900, 208]").unwrap();
        assert_eq!(r, Rect::new(0, 0, 900, 208));
        let p: Point = serde_json::from_str("[450, 800]").unwrap();
        assert_eq!(p, Point::new(450, 800));
    }

    #[test]
    fn stop_flag_is_shared() {
        let a = StopFlag::new();
        let b = a.clone();
        b.set();
        assert!(a.is_set());
    }
}
