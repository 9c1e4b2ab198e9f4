//! Periodic-motion prediction for the chest disarm gauge.
//!
//! The gauge cursor sweeps left to right and back at constant speed, so its
//! normalised position over time is a triangle wave
//! `x(t) = tri((t - phase) / period)` that is 0 at `phase` and 1 half a period
//! later. Sampling it a couple of dozen times is enough to fit `period` and
//! `phase`, after which the time until the cursor crosses any target follows.

use image::GrayImage;

use crate::frame;
use crate::types::{Frame, Rect};

/// Gauge width in pixels; sample positions are normalised by it.
pub const GAUGE_WIDTH: f64 = 900.0;
/// Strip of the gauge holding the safe slots.
pub const SLOT_STRIP: Rect = Rect::new(30, 62, 850, 53);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub t: f64,
    /// Cursor position in `0.0..=1.0`.
    pub x: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fit {
    /// Seconds for a full left-right-left sweep.
    pub period: f64,
    /// A time at which the cursor sat at the left edge, in `0..period`.
    pub phase: f64,
}

pub fn triangle(t: f64, period: f64, phase: f64) -> f64 {
    let u = (t - phase).rem_euclid(period) / period;
    if u < 0.5 {
        2.0 * u
    } else {
        2.0 - 2.0 * u
    }
}

fn sse(samples: &[Sample], period: f64, phase: f64) -> f64 {
    samples.iter().map(|s| (triangle(s.t, period, phase) - s.x).powi(2)).sum()
}

/// Indices of strict local maxima in the upper half of the range.
pub fn find_peaks(samples: &[Sample]) -> Vec<usize> {
    samples
        .windows(3)
        .enumerate()
        .filter(|(_, w)| w[1].x > w[0].x && w[1].x >= w[2].x && w[1].x > 0.5)
        .map(|(i, _)| i + 1)
        .collect()
}

/// Starting period: mean spacing between detected peaks, or one second.
fn seed_period(samples: &[Sample]) -> f64 {
    let peaks = find_peaks(samples);
    if peaks.len() < 2 {
        return 1.0;
    }
    let first = samples[peaks[0]].t;
    let last = samples[peaks[peaks.len() - 1]].t;
    let spacing = (last - first) / (peaks.len() - 1) as f64;
    if spacing > 0.0 {
        spacing
    } else {
        1.0
    }
}

/// Best (period, phase) on a grid around the seed.
fn grid_search(samples: &[Sample], seed: f64) -> (f64, f64) {
    const PERIOD_STEPS: usize = 120;
    const PHASE_STEPS: usize = 240;
    let mut best = (seed, 0.0, f64::INFINITY);
    for i in 0..=PERIOD_STEPS {
        let period = seed * (0.7 + 0.6 * i as f64 / PERIOD_STEPS as f64);
        for j in 0..PHASE_STEPS {
            let phase = period * j as f64 / PHASE_STEPS as f64;
            let cost = sse(samples, period, phase);
            if cost < best.2 {
                best = (period, phase, cost);
            }
        }
    }
    (best.0, best.1)
}

/// Levenberg-Marquardt on the two parameters with numeric derivatives.
fn refine(samples: &[Sample], mut period: f64, mut phase: f64) -> (f64, f64) {
    const H: f64 = 1e-6;
    let mut lambda = 1e-3;
    let mut cost = sse(samples, period, phase);
    for _ in 0..100 {
        let (mut a, mut b, mut d) = (0.0, 0.0, 0.0);
        let (mut gp, mut gc) = (0.0, 0.0);
        for s in samples {
            let r = triangle(s.t, period, phase) - s.x;
            let jp = (triangle(s.t, period + H, phase) - triangle(s.t, period - H, phase)) / (2.0 * H);
            let jc = (triangle(s.t, period, phase + H) - triangle(s.t, period, phase - H)) / (2.0 * H);
            a += jp * jp;
            b += jp * jc;
            d += jc * jc;
            gp += jp * r;
            gc += jc * r;
        }
        let (a_l, d_l) = (a * (1.0 + lambda), d * (1.0 + lambda));
        let det = a_l * d_l - b * b;
        if det.abs() < 1e-12 {
            break;
        }
        let dp = -(d_l * gp - b * gc) / det;
        let dc = -(a_l * gc - b * gp) / det;
        let (np, nc) = (period + dp, phase + dc);
        if np <= 0.0 {
            lambda *= 10.0;
            continue;
        }
        let next = sse(samples, np, nc);
        if next < cost {
            let gain = cost - next;
            period = np;
            phase = nc;
            cost = next;
            lambda = (lambda / 10.0).max(1e-9);
            if gain < 1e-12 {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e9 {
                break;
            }
        }
    }
    (period, phase)
}

/// Fit period and phase to the samples. `None` with fewer than three samples.
pub fn fit_triangle(samples: &[Sample]) -> Option<Fit> {
    if samples.len() < 3 {
        return None;
    }
    // Device timestamps are epoch seconds; fit on offsets to keep precision.
    let t0 = samples[0].t;
    let shifted: Vec<Sample> = samples.iter().map(|s| Sample { t: s.t - t0, x: s.x }).collect();
    let seed = seed_period(&shifted);
    let (period, phase) = grid_search(&shifted, seed);
    let (period, phase) = refine(&shifted, period, phase);
    Some(Fit { period, phase: (phase + t0).rem_euclid(period) })
}

impl Fit {
    /// Gauge pixels per second.
    pub fn speed(&self) -> f64 {
        2.0 / self.period * GAUGE_WIDTH
    }

    pub fn moving_right(&self, t: f64) -> bool {
        (t - self.phase).rem_euclid(self.period) < self.period / 2.0
    }

    /// Seconds from `t` until the cursor at `x` next comes back to `target`
    /// after bouncing off the edge it is heading for.
    pub fn wait_until(&self, t: f64, x: f64, target: f64) -> f64 {
        let travel = if self.moving_right(t) {
            (GAUGE_WIDTH - x) + (GAUGE_WIDTH - target)
        } else {
            x + target
        };
        travel / self.speed()
    }
}

/// Mean brightness of every column of a grayscale image.
fn column_means(gray: &GrayImage) -> Vec<f64> {
    let h = gray.height().max(1) as f64;
    (0..gray.width())
        .map(|x| (0..gray.height()).map(|y| gray.get_pixel(x, y)[0] as f64).sum::<f64>() / h)
        .collect()
}

/// Frame x of the widest bright run in the slot strip.
pub fn widest_slot(frame: &Frame) -> Option<i32> {
    let strip = frame::crop(frame, SLOT_STRIP)?;
    let means = column_means(&frame::to_gray(&strip));
    if means.is_empty() {
        return None;
    }
    let average = means.iter().sum::<f64>() / means.len() as f64;

    let mut best: Option<(usize, usize)> = None;
    let mut start = None;
    for (i, m) in means.iter().enumerate().chain(std::iter::once((means.len(), &f64::NEG_INFINITY))) {
        match (start, *m > average) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                if best.map_or(true, |(bs, be)| i - s > be - bs) {
                    best = Some((s, i));
                }
                start = None;
            }
            _ => {}
        }
    }
    let (s, e) = best?;
    Some(SLOT_STRIP.x + ((s + e) / 2) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gaussian(rng: &mut StdRng, sigma: f64) -> f64 {
        let (u1, u2): (f64, f64) = (rng.gen_range(1e-12..1.0), rng.gen());
        sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn sampled(period: f64, phase: f64, n: usize, sigma: f64, seed: u64) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut t = 1_718_000_000.0;
        (0..n)
            .map(|_| {
                t += 0.2 + rng.gen_range(0.0..0.08);
                let x = (triangle(t, period, phase) + gaussian(&mut rng, sigma)).clamp(0.0, 1.0);
                Sample { t, x }
            })
            .collect()
    }

    /// Largest gap between the fitted and the true cursor position over the
    /// sampled window.
    fn window_error(fit: &Fit, samples: &[Sample], period: f64, phase: f64) -> f64 {
        samples
            .iter()
            .map(|s| (triangle(s.t, fit.period, fit.phase) - triangle(s.t, period, phase)).abs())
            .fold(0.0, f64::max)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn triangle_shape() {
        assert!(close(triangle(0.0, 2.0, 0.0), 0.0));
        assert!(close(triangle(0.5, 2.0, 0.0), 0.5));
        assert!(close(triangle(1.0, 2.0, 0.0), 1.0));
        assert!(close(triangle(1.5, 2.0, 0.0), 0.5));
        assert!(close(triangle(2.3, 2.0, 0.3), 0.0));
    }

    #[test]
    fn recovers_clean_wave() {
        for (period, phase, seed) in [(1.7, 0.4, 1), (2.4, 1.9, 2), (1.2, 0.05, 3)] {
            let samples = sampled(period, phase, 24, 0.0, seed);
            let fit = fit_triangle(&samples).unwrap();
            assert!((fit.period - period).abs() / period < 0.02, "period {} vs {}", fit.period, period);
            let err = window_error(&fit, &samples, period, phase);
            assert!(err < 0.03, "position off by {} (period {})", err, period);
        }
    }

    #[test]
    fn recovers_noisy_wave() {
        let (period, phase) = (1.9, 0.7);
        let samples = sampled(period, phase, 30, 0.02, 11);
        let fit = fit_triangle(&samples).unwrap();
        assert!((fit.period - period).abs() / period < 0.02, "period {}", fit.period);
        let err = window_error(&fit, &samples, period, phase);
        assert!(err < 0.06, "position off by {}", err);
    }

    #[test]
    fn too_few_samples() {
        assert!(fit_triangle(&[Sample { t: 0.0, x: 0.1 }, Sample { t: 0.2, x: 0.3 }]).is_none());
    }

    #[test]
    fn wait_bounces_off_the_far_edge() {
        let fit = Fit { period: 2.0, phase: 0.0 };
        assert_eq!(fit.speed(), 900.0);
        // Heading right from 300: 600 to the edge, 100 back to 800.
        assert!((fit.wait_until(0.3, 300.0, 800.0) - 700.0 / 900.0).abs() < 1e-9);
        // Heading left from 600: 600 to the edge, 200 back out.
        assert!((fit.wait_until(1.2, 600.0, 200.0) - 800.0 / 900.0).abs() < 1e-9);
    }

    #[test]
    fn widest_slot_middle() {
        let mut f = Frame::from_pixel(900, 1600, Rgb([10, 10, 10]));
        for (x0, x1) in [(100u32, 140u32), (500, 620), (700, 730)] {
            for x in x0..x1 {
                for y in 62..115 {
                    f.put_pixel(x, y, Rgb([230, 230, 230]));
                }
            }
        }
        assert_eq!(widest_slot(&f), Some((500 + 620) / 2));
    }

    #[test]
    fn flat_gauge_has_no_slot() {
        let f = Frame::from_pixel(900, 1600, Rgb([90, 90, 90]));
        assert_eq!(widest_slot(&f), None);
    }
}
