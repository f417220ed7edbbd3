use std::collections::VecDeque;

use tracing::debug;

use crate::raster::RasterImage;

pub const DEFAULT_CAPACITY: usize = 10;

/// Bounded stack of image snapshots. Pushing onto a full stack drops the
/// bottom entry.
#[derive(Debug)]
pub struct BoundedStack {
    entries: VecDeque<RasterImage>,
    capacity: usize,
}

impl BoundedStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Returns the evicted entry, if any, so the caller can see what was released.
    pub fn push(&mut self, image: RasterImage) -> Option<RasterImage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(image);
        evicted
    }

    pub fn pop(&mut self) -> Option<RasterImage> {
        self.entries.pop_back()
    }

    #[cfg(test)]
    pub fn top(&self) -> Option<&RasterImage> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Undo and redo stacks for the edit session.
#[derive(Debug)]
pub struct History {
    undo: BoundedStack,
    redo: BoundedStack,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            undo: BoundedStack::new(capacity),
            redo: BoundedStack::new(capacity),
        }
    }

    /// Records `current` before a destructive edit. The stored entry is a copy,
    /// and the redo stack is discarded.
    pub fn save(&mut self, current: &RasterImage) {
        if let Some(evicted) = self.undo.push(current.snapshot()) {
            debug!(id = evicted.id(), "history full, evicted oldest entry");
        }
        if !self.redo.is_empty() {
            debug!(count = self.redo.len(), "clearing redo stack");
            self.redo.clear();
        }
        debug!(undo = self.undo.len(), "history saved");
    }

    /// Moves `current` onto the redo stack and returns the previous image.
    /// Returns `Err(current)` unchanged when there is nothing to undo.
    pub fn undo(&mut self, current: RasterImage) -> Result<RasterImage, RasterImage> {
        let Some(previous) = self.undo.pop() else {
            return Err(current);
        };
        self.redo.push(current);
        Ok(previous)
    }

    /// Mirror of [`History::undo`].
    pub fn redo(&mut self, current: RasterImage) -> Result<RasterImage, RasterImage> {
        let Some(next) = self.redo.pop() else {
            return Err(current);
        };
        self.undo.push(current);
        Ok(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    #[cfg(test)]
    pub fn undo_top(&self) -> Option<&RasterImage> {
        self.undo.top()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
