// Copyright 2025 Tidewave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Watermark accounting for one compute actor.
//!
//! A watermark becomes pending once every watermark-aware input channel has
//! reached it; once injected into the task runner, it is popped only after
//! every participating output channel has observed it.

use std::collections::{HashMap, HashSet};

use tidewave_pb::data::Watermark;

#[derive(Debug, Default)]
pub struct WatermarksTracker {
    /// Watermark-aware input channels and the highest watermark seen on each.
    input_channels: HashMap<u64, Option<Watermark>>,
    /// Output channels participating in watermarking.
    output_channels: HashSet<u64>,
    pending_watermark: Option<Watermark>,
    last_injected: Option<Watermark>,
    /// Outputs that have not yet observed the injected watermark.
    awaiting_outputs: HashSet<u64>,
}

impl WatermarksTracker {
    /// Channels with disabled watermark mode are never registered; their
    /// watermarks are dropped silently.
    pub fn register_input_channel(&mut self, channel_id: u64) {
        self.input_channels.insert(channel_id, None);
    }

    pub fn register_output_channel(&mut self, channel_id: u64) {
        self.output_channels.insert(channel_id);
    }

    pub fn has_output_channels(&self) -> bool {
        !self.output_channels.is_empty()
    }

    /// Records a watermark on an input channel; returns whether it advanced
    /// the channel's watermark.
    pub fn notify_in_channel_watermark_received(
        &mut self,
        channel_id: u64,
        watermark: Watermark,
    ) -> bool {
        let Some(current) = self.input_channels.get_mut(&channel_id) else {
            // Unregistered channel: not watermark-aware, drop silently.
            return false;
        };

        let changed = match current {
            Some(existing) => watermark > *existing,
            None => true,
        };
        if changed {
            *current = Some(watermark);
            self.recompute_pending();
        }
        changed
    }

    fn recompute_pending(&mut self) {
        // The pending watermark is the minimum over all inputs, and only
        // once every input has one.
        let mut minimum: Option<Watermark> = None;
        for watermark in self.input_channels.values() {
            let Some(watermark) = watermark else {
                return;
            };
            minimum = Some(match minimum {
                Some(current) => current.min(*watermark),
                None => *watermark,
            });
        }

        if let Some(minimum) = minimum {
            let advanced = match self.last_injected {
                None => true,
                Some(injected) => injected < minimum,
            };
            if advanced {
                self.pending_watermark = Some(minimum);
            }
        }
    }

    pub fn has_pending_watermark(&self) -> bool {
        self.pending_watermark.is_some()
    }

    pub fn pending_watermark(&self) -> Option<Watermark> {
        self.pending_watermark
    }

    /// Marks the pending watermark as injected into the task runner; output
    /// channels now owe an observation each.
    pub fn notify_watermark_injected(&mut self) {
        self.awaiting_outputs = self.output_channels.clone();
    }

    /// Records the watermark's emission on one output channel. Returns true
    /// once every participating output has observed it, at which point
    /// paused inputs may resume.
    pub fn notify_output_channel_watermark_sent(
        &mut self,
        channel_id: u64,
        _watermark: Watermark,
    ) -> bool {
        self.awaiting_outputs.remove(&channel_id);
        self.awaiting_outputs.is_empty() && self.has_output_channels()
    }

    /// Pops the injected watermark; a newer one may become pending.
    pub fn pop_pending_watermark(&mut self) {
        self.last_injected = self.pending_watermark.take();
        self.recompute_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wm(ts: u64) -> Watermark {
        Watermark::new(ts)
    }

    #[test]
    fn test_pending_needs_every_input() {
        let mut tracker = WatermarksTracker::default();
        tracker.register_input_channel(1);
        tracker.register_input_channel(2);

        assert!(tracker.notify_in_channel_watermark_received(1, wm(10)));
        // Channel 2 has not reported yet: nothing pending.
        assert!(!tracker.has_pending_watermark());

        assert!(tracker.notify_in_channel_watermark_received(2, wm(7)));
        assert_eq!(tracker.pending_watermark(), Some(wm(7)));
    }

    #[test]
    fn test_unregistered_channel_watermark_is_dropped() {
        let mut tracker = WatermarksTracker::default();
        tracker.register_input_channel(1);
        assert!(!tracker.notify_in_channel_watermark_received(99, wm(5)));
        assert!(!tracker.has_pending_watermark());
    }

    #[test]
    fn test_pop_advances_past_injected() {
        let mut tracker = WatermarksTracker::default();
        tracker.register_input_channel(1);
        tracker.notify_in_channel_watermark_received(1, wm(5));
        assert_eq!(tracker.pending_watermark(), Some(wm(5)));

        tracker.pop_pending_watermark();
        assert!(!tracker.has_pending_watermark());

        // A stale watermark does not re-arm the tracker.
        assert!(!tracker.notify_in_channel_watermark_received(1, wm(5)));
        assert!(!tracker.has_pending_watermark());

        tracker.notify_in_channel_watermark_received(1, wm(9));
        assert_eq!(tracker.pending_watermark(), Some(wm(9)));
    }

    #[test]
    fn test_output_observation_gate() {
        let mut tracker = WatermarksTracker::default();
        tracker.register_input_channel(1);
        tracker.register_output_channel(10);
        tracker.register_output_channel(11);

        tracker.notify_in_channel_watermark_received(1, wm(3));
        tracker.notify_watermark_injected();

        assert!(!tracker.notify_output_channel_watermark_sent(10, wm(3)));
        assert!(tracker.notify_output_channel_watermark_sent(11, wm(3)));
    }
}
