//! Round-robin interleaving over a set of record streams.

use std::collections::VecDeque;

/// Interleaves items from multiple streams, one item per stream per turn.
///
/// At most `cycle_length` streams are open at a time; the rest wait in a
/// queue and take the slot of whichever stream runs dry. With a
/// `cycle_length` of one the streams are simply chained in order.
///
/// # Examples
///
/// ```
/// use recall_data::interleave::Interleave;
///
/// let streams = vec![vec![1, 2, 3].into_iter(), vec![10, 20].into_iter()];
/// let merged: Vec<i32> = Interleave::new(streams, 2).collect();
/// assert_eq!(merged, vec![1, 10, 2, 20, 3]);
/// ```
pub struct Interleave<I> {
    pending: VecDeque<I>,
    active: Vec<I>,
    cycle_length: usize,
    index: usize,
}

impl<I: Iterator> Interleave<I> {
    /// Builds an interleaver over `streams`, opening up to `cycle_length`
    /// of them at once.
    pub fn new(streams: Vec<I>, cycle_length: usize) -> Self {
        let cycle_length = cycle_length.max(1);
        let mut pending: VecDeque<I> = streams.into();
        let mut active = Vec::new();
        for _ in 0..cycle_length.min(pending.len()) {
            if let Some(stream) = pending.pop_front() {
                active.push(stream);
            }
        }
        Self {
            pending,
            active,
            cycle_length,
            index: 0,
        }
    }

    fn refill_if_needed(&mut self) {
        while self.active.len() < self.cycle_length {
            if let Some(next) = self.pending.pop_front() {
                self.active.push(next);
            } else {
                break;
            }
        }
    }
}

impl<I: Iterator> Iterator for Interleave<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.active.is_empty() {
                return None;
            }
            if self.index >= self.active.len() {
                self.index = 0;
            }
            let idx = self.index;
            if let Some(item) = self.active[idx].next() {
                self.index = (self.index + 1) % self.active.len();
                return Some(item);
            } else {
                self.active.remove(idx);
                self.refill_if_needed();
            }
        }
    }
}
