//! Circular score space `[0, 2^31 - 2]`

use std::fmt;

/// Position on the ring
pub type Score = u32;

/// Largest score on the ring (2^31 - 2). Its successor is 0.
pub const MAX_SCORE: Score = i32::MAX as u32 - 1;

/// Circular half-open interval `(after, upto]` of scores whose ownership
/// changes when a virtual node at `upto` appears or disappears.
///
/// When `after > upto` the interval wraps past `MAX_SCORE` and covers
/// `(after, MAX_SCORE] ∪ [0, upto]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreInterval {
    pub after: Score,
    pub upto: Score,
}

/// One contiguous, inclusive piece of a [`ScoreInterval`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreSegment {
    pub start: Score,
    pub end: Score,
}

impl ScoreInterval {
    pub fn new(after: Score, upto: Score) -> Self {
        debug_assert_ne!(after, upto, "empty ring interval");
        Self { after, upto }
    }

    /// True when the interval crosses the `MAX_SCORE -> 0` boundary
    pub fn wraps(&self) -> bool {
        self.after > self.upto
    }

    pub fn contains(&self, score: Score) -> bool {
        if self.wraps() {
            score > self.after || score <= self.upto
        } else {
            score > self.after && score <= self.upto
        }
    }

    /// Inclusive segments covered by the interval, in ascending order of
    /// their position in the wrapped walk. A wrapping interval whose start
    /// is `MAX_SCORE` has nothing above it and yields only the low segment.
    pub fn segments(&self) -> Vec<ScoreSegment> {
        if !self.wraps() {
            return vec![ScoreSegment {
                start: self.after + 1,
                end: self.upto,
            }];
        }

        let mut segments = Vec::with_capacity(2);
        if self.after < MAX_SCORE {
            segments.push(ScoreSegment {
                start: self.after + 1,
                end: MAX_SCORE,
            });
        }
        segments.push(ScoreSegment {
            start: 0,
            end: self.upto,
        });
        segments
    }
}

impl fmt::Display for ScoreInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wraps() {
            write!(f, "({}, {}] ∪ [0, {}]", self.after, MAX_SCORE, self.upto)
        } else {
            write!(f, "({}, {}]", self.after, self.upto)
        }
    }
}
