//! Viewport anchoring across content mutations.
//!
//! The controller is driven in three steps: the view reports scroll
//! positions through [`ScrollAnchorController::observe`], the engine calls
//! [`ScrollAnchorController::begin`] right before it mutates the list, and
//! the view reports the rendered height of each mutation through
//! [`ScrollAnchorController::complete`] (or
//! [`ScrollAnchorController::complete_each`] for a batch rendered in one
//! frame), which yields the scroll position to apply.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Scroll geometry of the message list, in pixels.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    pub scroll_top: f32,
    pub scroll_height: f32,
    pub client_height: f32,
}

impl Viewport {
    pub fn distance_from_bottom(&self) -> f32 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    fn bottom_offset(&self) -> f32 {
        (self.scroll_height - self.client_height).max(0.0)
    }
}

/// Kind of content mutation about to happen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScrollTrigger {
    /// First population of a freshly opened conversation.
    InitialLoad,
    /// Older messages inserted above the visible area.
    PrependOlder,
    /// New inbound or outbound message at the bottom.
    AppendNew,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollAction {
    ScrollTo(f32),
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
struct PendingMutation {
    trigger: ScrollTrigger,
    near_bottom: bool,
}

#[derive(Debug, Clone)]
pub struct ScrollAnchorController {
    threshold_px: f32,
    viewport: Viewport,
    pending: VecDeque<PendingMutation>,
}

impl ScrollAnchorController {
    pub fn new(threshold_px: f32) -> Self {
        Self {
            threshold_px: threshold_px.max(0.0),
            viewport: Viewport::default(),
            pending: VecDeque::new(),
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn is_near_bottom(&self) -> bool {
        self.viewport.distance_from_bottom() <= self.threshold_px
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Record the current viewport (user scroll or resize).
    pub fn observe(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Queue a mutation. Must be called before the mutation is rendered.
    pub fn begin(&mut self, trigger: ScrollTrigger) {
        let near_bottom = self.is_near_bottom();
        trace!(?trigger, near_bottom, "scroll mutation queued");
        self.pending.push_back(PendingMutation {
            trigger,
            near_bottom,
        });
    }

    /// Resolve the oldest queued mutation against the height the list has
    /// once that mutation is rendered.
    ///
    /// Later mutations stay queued for the following calls. Without a queued
    /// mutation the height is only recorded.
    pub fn complete(&mut self, new_scroll_height: f32) -> ScrollAction {
        let original_top = self.viewport.scroll_top;
        self.resolve_next(new_scroll_height);
        self.action_since(original_top)
    }

    /// Resolve queued mutations in order, one rendered height per mutation.
    ///
    /// The anchor base after each mutation is the viewport computed for the
    /// previous one, so only a prepend's own height delta shifts the
    /// position. Returns the net action for the whole sequence.
    pub fn complete_each(&mut self, heights: impl IntoIterator<Item = f32>) -> ScrollAction {
        let original_top = self.viewport.scroll_top;
        for height in heights {
            self.resolve_next(height);
        }
        self.action_since(original_top)
    }

    fn resolve_next(&mut self, new_scroll_height: f32) {
        let base = self.viewport;
        let mut next = Viewport {
            scroll_height: new_scroll_height,
            ..base
        };
        if let Some(mutation) = self.pending.pop_front() {
            match mutation.trigger {
                ScrollTrigger::InitialLoad => next.scroll_top = next.bottom_offset(),
                ScrollTrigger::PrependOlder => {
                    let height_delta = new_scroll_height - base.scroll_height;
                    next.scroll_top = (base.scroll_top + height_delta).max(0.0);
                }
                ScrollTrigger::AppendNew if mutation.near_bottom => {
                    next.scroll_top = next.bottom_offset();
                }
                ScrollTrigger::AppendNew => {}
            }
            trace!(trigger = ?mutation.trigger, scroll_top = next.scroll_top, "scroll mutation resolved");
        }
        self.viewport = next;
    }

    fn action_since(&self, original_top: f32) -> ScrollAction {
        if self.viewport.scroll_top == original_top {
            ScrollAction::Unchanged
        } else {
            ScrollAction::ScrollTo(self.viewport.scroll_top)
        }
    }

    /// Forget the viewport and queued mutations (conversation switch).
    pub fn reset(&mut self) {
        self.viewport = Viewport::default();
        self.pending.clear();
    }
}

impl Default for ScrollAnchorController {
    fn default() -> Self {
        Self::new(100.0)
    }
}
