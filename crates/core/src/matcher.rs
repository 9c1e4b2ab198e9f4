//! Template matching: normalised cross-correlation of named reference images
//! against a frame, with region masks and multi-candidate extraction.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::Rgb;
use serde::{Deserialize, Serialize};

use crate::frame::{self, crop};
use crate::logger;
use crate::types::{Frame, Point, Rect};

/// Scores at or above this count as a hit.
pub const MATCH_THRESHOLD: f32 = 0.80;
/// Side of the centre patch compared by [`center_matches`].
pub const FOCUS_SIZE: u32 = 15;
const FOCUS_MAX_DIFF: f32 = 0.2;

/// Above this many multiply-adds a coarse pass narrows the search first.
const PYRAMID_WORK: u64 = 40_000_000;
/// Smallest template side worth matching after downscaling.
const PYRAMID_MIN_SIDE: u32 = 12;
const PYRAMID_CANDIDATES: usize = 8;
/// Coarse scores run lower than full-size ones; multi-hit search keeps this much margin.
const COARSE_SLACK: f32 = 0.2;
const ALL_CANDIDATES: usize = 32;

pub fn is_found(score: f32) -> bool {
    score >= MATCH_THRESHOLD
}

/// Region mask: the first rectangle is kept, every later one is blanked out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roi(pub Vec<Rect>);

impl Roi {
    pub fn new(rects: Vec<Rect>) -> Self {
        Self(rects)
    }

    pub fn single(rect: Rect) -> Self {
        Self(vec![rect])
    }

    pub fn inclusion(&self) -> Option<Rect> {
        self.0.first().copied()
    }

    pub fn exclusions(&self) -> &[Rect] {
        self.0.get(1..).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn keeps(&self, x: i32, y: i32) -> bool {
        match self.inclusion() {
            None => true,
            Some(keep) => keep.contains(x, y) && !self.exclusions().iter().any(|r| r.contains(x, y)),
        }
    }

    /// Zero every pixel outside the inclusion rectangle or inside an exclusion.
    pub fn apply(&self, frame: &mut Frame) {
        if self.is_empty() {
            return;
        }
        for (x, y, px) in frame.enumerate_pixels_mut() {
            if !self.keeps(x as i32, y as i32) {
                *px = Rgb([0, 0, 0]);
            }
        }
    }

    pub fn masked(&self, frame: &Frame) -> Frame {
        let mut out = frame.clone();
        self.apply(&mut out);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub score: f32,
    /// Top-left corner of the matched window.
    pub location: Point,
    pub width: u32,
    pub height: u32,
}

impl Match {
    pub fn center(&self) -> Point {
        self.location.offset(self.width as i32 / 2, self.height as i32 / 2)
    }

    pub fn found(&self) -> bool {
        is_found(self.score)
    }
}

/// Template with per-channel mean removed.
struct Centered {
    width: usize,
    height: usize,
    values: Vec<[f32; 3]>,
    norm_sq: f64,
}

impl Centered {
    fn new(template: &Frame) -> Self {
        let (width, height) = (template.width() as usize, template.height() as usize);
        let n = (width * height).max(1) as f64;
        let mut mean = [0f64; 3];
        for px in template.pixels() {
            for c in 0..3 {
                mean[c] += px[c] as f64;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);
        let mut norm_sq = 0f64;
        let values = template
            .pixels()
            .map(|px| {
                let mut v = [0f32; 3];
                for c in 0..3 {
                    let d = px[c] as f64 - mean[c];
                    norm_sq += d * d;
                    v[c] = d as f32;
                }
                v
            })
            .collect();
        Self { width, height, values, norm_sq }
    }
}

/// Summed-area tables: per-channel sums and the all-channel sum of squares.
struct Integral {
    stride: usize,
    sum: Vec<[u32; 3]>,
    sq: Vec<u64>,
}

impl Integral {
    fn new(frame: &Frame) -> Self {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let stride = w + 1;
        let mut sum = vec![[0u32; 3]; stride * (h + 1)];
        let mut sq = vec![0u64; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = [0u32; 3];
            let mut row_sq = 0u64;
            for x in 0..w {
                let px = frame.get_pixel(x as u32, y as u32);
                let above = y * stride + x + 1;
                let here = (y + 1) * stride + x + 1;
                for c in 0..3 {
                    row_sum[c] += px[c] as u32;
                    row_sq += (px[c] as u64) * (px[c] as u64);
                    sum[here][c] = sum[above][c] + row_sum[c];
                }
                sq[here] = sq[above] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    /// Summed per-channel variance times pixel count, over the window.
    fn energy(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let n = (w * h) as f64;
        let (a, b) = (y * self.stride + x, y * self.stride + x + w);
        let (c, d) = ((y + h) * self.stride + x, (y + h) * self.stride + x + w);
        let squares = (self.sq[d] + self.sq[a] - self.sq[b] - self.sq[c]) as f64;
        let mean_part: f64 = (0..3)
            .map(|ch| {
                let s = (self.sum[d][ch] + self.sum[a][ch] - self.sum[b][ch] - self.sum[c][ch]) as f64;
                s * s / n
            })
            .sum();
        (squares - mean_part).max(0.0)
    }
}

fn score_at(frame: &Frame, tpl: &Centered, integral: &Integral, x: usize, y: usize) -> f32 {
    let energy = integral.energy(x, y, tpl.width, tpl.height);
    if energy < 1e-6 || tpl.norm_sq < 1e-6 {
        return 0.0;
    }
    let raw = frame.as_raw();
    let stride = frame.width() as usize * 3;
    let mut num = 0f64;
    for ty in 0..tpl.height {
        let row = (y + ty) * stride + x * 3;
        let tpl_row = &tpl.values[ty * tpl.width..(ty + 1) * tpl.width];
        let mut acc = 0f32;
        for (tx, t) in tpl_row.iter().enumerate() {
            let p = &raw[row + tx * 3..row + tx * 3 + 3];
            acc += t[0] * p[0] as f32 + t[1] * p[1] as f32 + t[2] * p[2] as f32;
        }
        num += acc as f64;
    }
    ((num / (energy * tpl.norm_sq).sqrt()) as f32).clamp(-1.0, 1.0)
}

/// Dense score map over a rectangle of window origins.
struct ScoreMap {
    xs: RangeInclusive<usize>,
    ys: RangeInclusive<usize>,
    scores: Vec<f32>,
}

impl ScoreMap {
    fn compute(frame: &Frame, tpl: &Centered, xs: RangeInclusive<usize>, ys: RangeInclusive<usize>) -> Self {
        let integral = Integral::new(frame);
        let mut scores = Vec::with_capacity(xs.clone().count() * ys.clone().count());
        for y in ys.clone() {
            for x in xs.clone() {
                scores.push(score_at(frame, tpl, &integral, x, y));
            }
        }
        Self { xs, ys, scores }
    }

    fn width(&self) -> usize {
        self.xs.clone().count()
    }

    fn iter(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        let w = self.width();
        let (x0, y0) = (*self.xs.start(), *self.ys.start());
        self.scores
            .iter()
            .enumerate()
            .map(move |(i, s)| (x0 + i % w, y0 + i / w, *s))
    }

    fn best(&self) -> Option<(usize, usize, f32)> {
        self.iter().fold(None, |best, cur| match best {
            Some(b) if b.2 >= cur.2 => Some(b),
            _ => Some(cur),
        })
    }
}

/// Window origins whose template-sized window touches the inclusion rectangle.
fn search_range(frame: &Frame, template: &Frame, roi: Option<&Roi>) -> Option<(RangeInclusive<usize>, RangeInclusive<usize>)> {
    let (fw, fh) = (frame.width() as i32, frame.height() as i32);
    let (tw, th) = (template.width() as i32, template.height() as i32);
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return None;
    }
    let (mut x0, mut y0, mut x1, mut y1) = (0, 0, fw - tw, fh - th);
    if let Some(keep) = roi.and_then(Roi::inclusion) {
        x0 = x0.max(keep.x - tw + 1);
        y0 = y0.max(keep.y - th + 1);
        x1 = x1.min(keep.right() - 1);
        y1 = y1.min(keep.bottom() - 1);
    }
    (x0 <= x1 && y0 <= y1).then(|| (x0 as usize..=x1 as usize, y0 as usize..=y1 as usize))
}

fn to_match(x: usize, y: usize, score: f32, template: &Frame) -> Match {
    Match {
        score,
        location: Point::new(x as i32, y as i32),
        width: template.width(),
        height: template.height(),
    }
}

/// Best normalised cross-correlation of `template` inside `frame`.
/// `None` when the template cannot fit the search area at all.
pub fn match_template(frame: &Frame, template: &Frame, roi: Option<&Roi>) -> Option<Match> {
    let (xs, ys) = search_range(frame, template, roi)?;
    let masked;
    let frame = match roi {
        Some(roi) if !roi.is_empty() => {
            masked = roi.masked(frame);
            &masked
        }
        _ => frame,
    };
    let positions = (xs.clone().count() * ys.clone().count()) as u64;
    let work = positions * template.width() as u64 * template.height() as u64;
    let tpl = Centered::new(template);
    let factor = pyramid_factor(work, template);
    if factor > 1 {
        return coarse_to_fine(frame, template, &tpl, factor, (xs, ys));
    }
    let (x, y, score) = ScoreMap::compute(frame, &tpl, xs, ys).best()?;
    Some(to_match(x, y, score, template))
}

/// Downscale factor keeping the coarse pass under budget while the template stays recognisable.
fn pyramid_factor(work: u64, template: &Frame) -> u32 {
    let side = template.width().min(template.height());
    let mut factor = 1u32;
    while work / (factor as u64).pow(4) > PYRAMID_WORK && side / (factor * 2) >= PYRAMID_MIN_SIDE {
        factor *= 2;
    }
    factor
}

type Bounds = (RangeInclusive<usize>, RangeInclusive<usize>);

/// Window origins of the strongest peaks of a downscaled search, reported at
/// reduced resolution. With `separate` set, peaks lie at least half a
/// template apart so each object yields one.
fn coarse_peaks(
    frame: &Frame,
    template: &Frame,
    factor: u32,
    (xs, ys): &Bounds,
    floor: f32,
    limit: usize,
    separate: bool,
) -> Vec<(usize, usize)> {
    let shrink = |img: &Frame| {
        imageops::resize(img, (img.width() / factor).max(1), (img.height() / factor).max(1), FilterType::Triangle)
    };
    let f = factor as usize;
    let small_frame = shrink(frame);
    let small_template = shrink(template);
    let Some((sxs, sys)) = search_range(&small_frame, &small_template, None) else {
        return Vec::new();
    };
    let sxs = (*xs.start() / f).max(*sxs.start())..=(*xs.end() / f).min(*sxs.end());
    let sys = (*ys.start() / f).max(*sys.start())..=(*ys.end() / f).min(*sys.end());
    if sxs.is_empty() || sys.is_empty() {
        return Vec::new();
    }
    let coarse = ScoreMap::compute(&small_frame, &Centered::new(&small_template), sxs, sys);
    let mut candidates: Vec<(usize, usize, f32)> = coarse.iter().filter(|c| c.2 >= floor).collect();
    candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

    let (apart_x, apart_y) = if separate {
        ((small_template.width() / 2).max(2) as usize, (small_template.height() / 2).max(2) as usize)
    } else {
        (2, 2)
    };
    let mut picked: Vec<(usize, usize)> = Vec::new();
    for (x, y, _) in candidates {
        if picked.len() >= limit {
            break;
        }
        if picked.iter().any(|&(px, py)| px.abs_diff(x) <= apart_x && py.abs_diff(y) <= apart_y) {
            continue;
        }
        picked.push((x, y));
    }
    picked
}

/// Best full-size score within one coarse cell of `(cx, cy)`.
fn refine_peak(
    frame: &Frame,
    template: &Frame,
    tpl: &Centered,
    integral: &Integral,
    (cx, cy): (usize, usize),
    f: usize,
    (xs, ys): &Bounds,
) -> Option<Match> {
    let rx = (cx * f).saturating_sub(f).max(*xs.start())..=(cx * f + f).min(*xs.end());
    let ry = (cy * f).saturating_sub(f).max(*ys.start())..=(cy * f + f).min(*ys.end());
    let mut best: Option<Match> = None;
    for y in ry {
        for x in rx.clone() {
            let score = score_at(frame, tpl, integral, x, y);
            if best.map_or(true, |b| score > b.score) {
                best = Some(to_match(x, y, score, template));
            }
        }
    }
    best
}

/// Search at reduced resolution, then refine the strongest candidates at full size.
fn coarse_to_fine(
    frame: &Frame,
    template: &Frame,
    tpl: &Centered,
    factor: u32,
    bounds: Bounds,
) -> Option<Match> {
    let picked = coarse_peaks(frame, template, factor, &bounds, f32::MIN, PYRAMID_CANDIDATES, false);
    let integral = Integral::new(frame);
    picked
        .into_iter()
        .filter_map(|peak| refine_peak(frame, template, tpl, &integral, peak, factor as usize, &bounds))
        .fold(None, |best: Option<Match>, m| match best {
            Some(b) if b.score >= m.score => Some(b),
            _ => Some(m),
        })
}

/// Every distinct location scoring at least `threshold`, overlapping hits merged.
pub fn match_all(frame: &Frame, template: &Frame, roi: Option<&Roi>, threshold: f32) -> Vec<Match> {
    let Some((xs, ys)) = search_range(frame, template, roi) else {
        return Vec::new();
    };
    let masked;
    let frame = match roi {
        Some(roi) if !roi.is_empty() => {
            masked = roi.masked(frame);
            &masked
        }
        _ => frame,
    };
    let tpl = Centered::new(template);
    let positions = (xs.clone().count() * ys.clone().count()) as u64;
    let factor = pyramid_factor(positions * template.width() as u64 * template.height() as u64, template);
    let mut hits: Vec<(usize, usize, f32)> = if factor > 1 {
        let integral = Integral::new(frame);
        let bounds = (xs, ys);
        coarse_peaks(frame, template, factor, &bounds, threshold - COARSE_SLACK, ALL_CANDIDATES, true)
            .into_iter()
            .filter_map(|peak| refine_peak(frame, template, &tpl, &integral, peak, factor as usize, &bounds))
            .map(|m| (m.location.x as usize, m.location.y as usize, m.score))
            .filter(|h| h.2 >= threshold)
            .collect()
    } else {
        ScoreMap::compute(frame, &tpl, xs, ys).iter().filter(|h| h.2 >= threshold).collect()
    };
    hits.sort_by(|a, b| b.2.total_cmp(&a.2));
    group_hits(&hits, template)
}

/// Merge hits whose windows overlap by more than half a template in each axis.
fn group_hits(hits: &[(usize, usize, f32)], template: &Frame) -> Vec<Match> {
    let (half_w, half_h) = ((template.width() / 2) as usize, (template.height() / 2) as usize);
    // (representative, sum of x, sum of y, members)
    let mut groups: Vec<(Match, usize, usize, usize)> = Vec::new();
    for &(x, y, score) in hits {
        let near = groups.iter_mut().find(|(m, ..)| {
            (m.location.x as usize).abs_diff(x) <= half_w && (m.location.y as usize).abs_diff(y) <= half_h
        });
        match near {
            Some((_, sx, sy, n)) => {
                *sx += x;
                *sy += y;
                *n += 1;
            }
            None => groups.push((to_match(x, y, score, template), x, y, 1)),
        }
    }
    groups
        .into_iter()
        .map(|(best, sx, sy, n)| Match {
            location: Point::new((sx / n) as i32, (sy / n) as i32),
            ..best
        })
        .collect()
}

/// Match restricted to a sub-rectangle; the location is reported in frame coordinates.
pub fn match_in_region(frame: &Frame, template: &Frame, region: Rect) -> Option<Match> {
    let r = region.clamp_to(frame.width(), frame.height())?;
    let part = crop(frame, r)?;
    let m = match_template(&part, template, None)?;
    Some(Match { location: m.location.offset(r.x, r.y), ..m })
}

/// Does the centre of the matched window look like the centre of the template?
/// The map cursor covers a reached icon's centre, so `false` means "already there".
pub fn center_matches(frame: &Frame, template: &Frame, m: &Match) -> bool {
    let size = FOCUS_SIZE.min(template.width()).min(template.height());
    let left = (template.width() - size) / 2;
    let top = (template.height() - size) / 2;
    let tpl_patch = Rect::new(left as i32, top as i32, size as i32, size as i32);
    let frame_patch = Rect::new(m.location.x + left as i32, m.location.y + top as i32, size as i32, size as i32);
    let (Some(a), Some(b)) = (crop(template, tpl_patch), crop(frame, frame_patch)) else {
        return false;
    };
    let diff = frame::mean_abs_diff(&frame::to_gray(&a), &frame::to_gray(&b));
    logger::debug_p("map", &format!("focus patch diff {:.3}", diff));
    diff < FOCUS_MAX_DIFF
}

/// Named reference images loaded from disk on first use.
pub struct TemplateLibrary {
    root: PathBuf,
    cache: HashMap<String, Option<Arc<Frame>>>,
}

impl TemplateLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), cache: HashMap::new() }
    }

    /// `None` when the image is missing or unreadable; the miss is cached too.
    pub fn get(&mut self, name: &str) -> Option<Arc<Frame>> {
        if let Some(hit) = self.cache.get(name) {
            return hit.clone();
        }
        let path = self.root.join(format!("{}.png", name));
        let loaded = match image::open(&path) {
            Ok(img) => Some(Arc::new(img.to_rgb8())),
            Err(e) => {
                logger::warn_p("poll", &format!("template {} unavailable: {}", name, e));
                None
            }
        };
        self.cache.insert(name.to_string(), loaded.clone());
        loaded
    }

    pub fn insert(&mut self, name: &str, image: Frame) {
        self.cache.insert(name.to_string(), Some(Arc::new(image)));
    }

    /// Best match of the named template, `None` if the template is unavailable.
    pub fn locate(&mut self, frame: &Frame, name: &str, roi: Option<&Roi>) -> Option<Match> {
        let template = self.get(name)?;
        match_template(frame, &template, roi)
    }

    /// Centre of the named template when it scores above the threshold.
    pub fn find(&mut self, frame: &Frame, name: &str, roi: Option<&Roi>) -> Option<Point> {
        let m = self.locate(frame, name, roi)?;
        logger::debug_p("poll", &format!("{} scored {:.3}", name, m.score));
        m.found().then(|| m.center())
    }

    /// Centres of every distinct hit of the named template, strongest first.
    pub fn find_all(&mut self, frame: &Frame, name: &str, roi: Option<&Roi>) -> Vec<Point> {
        let Some(template) = self.get(name) else {
            return Vec::new();
        };
        let (w, h) = (template.width() as i32, template.height() as i32);
        let hits = match_all(frame, &template, roi, MATCH_THRESHOLD);
        logger::debug_p("poll", &format!("{} has {} candidates", name, hits.len()));
        hits.into_iter()
            .map(|rough| {
                // Grouped locations are averages; settle on the peak next to each.
                let window = Rect::new(rough.location.x - 2, rough.location.y - 2, w + 4, h + 4);
                match_in_region(frame, &template, window)
                    .filter(Match::found)
                    .unwrap_or(rough)
                    .center()
            })
            .collect()
    }
}
