//! Sliding-window smoothing of inter-frame transforms.
//!
//! [`TransformHistory`] is a bounded ring of the most recent inter-frame
//! motion estimates. Its element-wise [`mean`](TransformHistory::mean) gives
//! the average motion over the window, and
//! [`trajectory_correction`](TransformHistory::trajectory_correction) turns
//! the same window into the warp that re-projects the current frame onto the
//! window-mean camera trajectory.

use crate::transform::Transform;
use std::collections::VecDeque;

/// Bounded history of inter-frame transforms.
///
/// Capacity tracks the active smoothing radius; pushing beyond it evicts the
/// oldest entry, and shrinking the capacity truncates from the oldest end
/// immediately.
#[derive(Debug, Clone)]
pub struct TransformHistory {
    transforms: VecDeque<Transform>,
    capacity: usize,
}

impl TransformHistory {
    /// Creates an empty history bounded to `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        TransformHistory {
            transforms: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// The current capacity bound.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered transforms.
    #[inline]
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    /// Whether the history holds no transforms yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Drops all buffered transforms.
    pub fn clear(&mut self) {
        self.transforms.clear();
    }

    /// Rebounds the history. Shrinking evicts the oldest entries right away.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.transforms.len() > self.capacity {
            self.transforms.pop_front();
        }
    }

    /// Appends a transform, evicting the oldest when over capacity.
    pub fn push(&mut self, t: Transform) {
        if self.transforms.len() == self.capacity {
            self.transforms.pop_front();
        }
        self.transforms.push_back(t);
    }

    /// Iterates the window from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Transform> {
        self.transforms.iter()
    }

    /// The most recently pushed transform.
    pub fn latest(&self) -> Option<&Transform> {
        self.transforms.back()
    }

    /// Element-wise mean of the window; identity when empty.
    pub fn mean(&self) -> Transform {
        if self.transforms.is_empty() {
            return Transform::identity();
        }
        let mut sum = [0.0f64; 6];
        for t in &self.transforms {
            sum[0] += t.a;
            sum[1] += t.b;
            sum[2] += t.tx;
            sum[3] += t.c;
            sum[4] += t.d;
            sum[5] += t.ty;
        }
        let inv = 1.0 / self.transforms.len() as f64;
        Transform::new(
            sum[0] * inv,
            sum[1] * inv,
            sum[2] * inv,
            sum[3] * inv,
            sum[4] * inv,
            sum[5] * inv,
        )
    }

    /// The warp that moves the current frame onto the window-mean trajectory.
    ///
    /// Writing the buffered motions as deltas from the identity, the camera
    /// pose `j` frames ago differs from the current pose by the sum of the
    /// last `j` deltas. Averaging those trailing partial sums over the window
    /// yields the offset from the current pose to the window-mean pose; the
    /// returned transform applies that offset. Identity when the window
    /// holds fewer than two entries.
    pub fn trajectory_correction(&self) -> Transform {
        let w = self.transforms.len();
        if w < 2 {
            return Transform::identity();
        }
        let mut suffix = [0.0f64; 6];
        let mut acc = [0.0f64; 6];
        for t in self.transforms.iter().rev() {
            for (a, s) in acc.iter_mut().zip(suffix.iter()) {
                *a += s;
            }
            suffix[0] += t.a - 1.0;
            suffix[1] += t.b;
            suffix[2] += t.tx;
            suffix[3] += t.c;
            suffix[4] += t.d - 1.0;
            suffix[5] += t.ty;
        }
        let scale = -1.0 / w as f64;
        Transform::new(
            1.0 + acc[0] * scale,
            acc[1] * scale,
            acc[2] * scale,
            acc[3] * scale,
            1.0 + acc[4] * scale,
            acc[5] * scale,
        )
    }
}
