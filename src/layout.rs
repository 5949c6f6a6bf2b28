//! Stimulus layouts and the change applied to them on change trials.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

/// Candidate positions drawn per moved stimulus before the last one is
/// accepted regardless of distance.
pub const MAX_MOVE_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

pub const PALETTE: [Rgb; 8] = [
    Rgb(0xFF, 0x00, 0x00),
    Rgb(0x00, 0xFF, 0x00),
    Rgb(0x00, 0x00, 0xFF),
    Rgb(0xFF, 0xFF, 0x00),
    Rgb(0xFF, 0x00, 0xFF),
    Rgb(0x00, 0xFF, 0xFF),
    Rgb(0xFF, 0x80, 0x00),
    Rgb(0x80, 0x00, 0xFF),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Abstract drawing area. Positions are top-left corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StimulusArea {
    pub width: f64,
    pub height: f64,
    pub stimulus_size: f64,
    pub max_position_fraction: f64,
}

impl StimulusArea {
    pub fn max_x(&self) -> f64 {
        (self.max_position_fraction * (self.width - self.stimulus_size)).max(0.0)
    }

    pub fn max_y(&self) -> f64 {
        (self.max_position_fraction * (self.height - self.stimulus_size)).max(0.0)
    }

    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Position {
        Position {
            x: rng.gen::<f64>() * self.max_x(),
            y: rng.gen::<f64>() * self.max_y(),
        }
    }

    pub fn contains(&self, p: &Position) -> bool {
        (0.0..=self.max_x()).contains(&p.x) && (0.0..=self.max_y()).contains(&p.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeParams {
    pub min_objects_to_move: usize,
    pub max_objects_to_move: usize,
    pub swap_probability: f64,
    pub min_move_distance: f64,
    pub max_move_distance: f64,
}

impl ChangeParams {
    fn distance_ok(&self, d: f64) -> bool {
        d >= self.min_move_distance && d <= self.max_move_distance
    }
}

/// One stimulus moved by [`apply_change`]
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    pub index: usize,
    pub distance: f64,
    pub attempts: usize,
    /// The attempt cap ran out and the last candidate was kept.
    pub exhausted: bool,
}

/// What a change trial did to the study layout
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Swap { first: usize, second: usize },
    Moved(Vec<Relocation>),
}

impl Change {
    pub fn changed_indices(&self) -> Vec<usize> {
        match self {
            Change::Swap { first, second } => vec![*first, *second],
            Change::Moved(moves) => moves.iter().map(|m| m.index).collect(),
        }
    }
}

/// Independent uniform positions. Stimuli may overlap.
pub fn generate_layout<R: Rng + ?Sized>(
    rng: &mut R,
    area: &StimulusArea,
    count: usize,
) -> Vec<Position> {
    (0..count).map(|_| area.random_position(rng)).collect()
}

/// `count` distinct indices from `0..max`, uniformly chosen.
pub fn random_indices<R: Rng + ?Sized>(rng: &mut R, max: usize, count: usize) -> Vec<usize> {
    let mut available: Vec<usize> = (0..max).collect();
    available.shuffle(rng);
    available.truncate(count);
    available
}

/// Derive a test layout from `layout`.
///
/// Draws `k` from the configured range; with the swap probability and
/// `k == 2` two stimuli trade places exactly, otherwise `k` distinct stimuli
/// are resampled until their displacement lies within the distance bounds.
pub fn apply_change<R: Rng + ?Sized>(
    rng: &mut R,
    area: &StimulusArea,
    params: &ChangeParams,
    layout: &[Position],
) -> (Vec<Position>, Change) {
    let lo = params.min_objects_to_move.min(params.max_objects_to_move);
    let hi = params.min_objects_to_move.max(params.max_objects_to_move);
    let k = rng.gen_range(lo..=hi).min(layout.len());
    let is_swapping = rng.gen::<f64>() < params.swap_probability;

    let mut next = layout.to_vec();

    if is_swapping && k == 2 {
        let picked = random_indices(rng, layout.len(), 2);
        let (first, second) = (picked[0], picked[1]);
        next.swap(first, second);
        debug!(first, second, "swapped stimuli");
        return (next, Change::Swap { first, second });
    }

    let mut moves = Vec::with_capacity(k);
    for index in random_indices(rng, layout.len(), k) {
        let origin = layout[index];
        let mut attempts = 0;
        let (candidate, distance) = loop {
            attempts += 1;
            let candidate = area.random_position(rng);
            let distance = origin.distance(&candidate);
            if params.distance_ok(distance) || attempts >= MAX_MOVE_ATTEMPTS {
                break (candidate, distance);
            }
        };
        let exhausted = !params.distance_ok(distance);
        if exhausted {
            debug!(index, distance, "move attempts exhausted, keeping last candidate");
        }
        next[index] = candidate;
        moves.push(Relocation {
            index,
            distance,
            attempts,
            exhausted,
        });
    }
    debug!(moved = ?moves.iter().map(|m| m.index).collect::<Vec<_>>(), "moved stimuli");

    (next, Change::Moved(moves))
}

/// Shuffle the palette and hand its indices out cyclically.
pub fn assign_colors<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..PALETTE.len()).collect();
    order.shuffle(rng);
    (0..count).map(|i| order[i % order.len()]).collect()
}
