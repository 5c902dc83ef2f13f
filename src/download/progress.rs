//! Hierarchical progress counters
//!
//! A snapshot owns a root counter and every file job a child. Children push
//! their deltas into the parent, so the root always reflects the sum.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicU64,
    completed: AtomicU64,
    parent: Option<Arc<Progress>>,
}

impl Progress {
    pub fn root(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(total),
            ..Self::default()
        })
    }

    /// Child counter whose `total` is added to this one
    pub fn child(self: &Arc<Self>, total: u64) -> Arc<Self> {
        self.add_total(total);
        Arc::new(Self {
            total: AtomicU64::new(total),
            completed: AtomicU64::new(0),
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Completed fraction in `[0, 1]`; an empty total counts as done
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        (self.completed() as f64 / total as f64).min(1.0)
    }

    pub fn advance(&self, bytes: u64) {
        self.completed.fetch_add(bytes, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.advance(bytes);
        }
    }

    /// Overwrite the completed count, e.g. when a transfer restarts from zero
    pub fn set_completed(&self, completed: u64) {
        let previous = self.completed.swap(completed, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.shift_completed(previous, completed);
        }
    }

    /// Replace the total once the real size is known
    pub fn set_total(&self, total: u64) {
        let previous = self.total.swap(total, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.shift_total(previous, total);
        }
    }

    pub fn mark_complete(&self) {
        self.set_completed(self.total());
    }

    fn add_total(&self, delta: u64) {
        self.total.fetch_add(delta, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.add_total(delta);
        }
    }

    fn shift_total(&self, from: u64, to: u64) {
        shift(&self.total, from, to);
        if let Some(parent) = &self.parent {
            parent.shift_total(from, to);
        }
    }

    fn shift_completed(&self, from: u64, to: u64) {
        shift(&self.completed, from, to);
        if let Some(parent) = &self.parent {
            parent.shift_completed(from, to);
        }
    }
}

fn shift(counter: &AtomicU64, from: u64, to: u64) {
    if to >= from {
        counter.fetch_add(to - from, Ordering::Relaxed);
    } else {
        let delta = from - to;
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
            Some(value.saturating_sub(delta))
        });
    }
}
