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

//! Local checkpoint coordination for one compute actor.
//!
//! Checkpoints are totally ordered by `(generation, id)`; a later
//! checkpoint never commits before an earlier one.

use std::collections::HashSet;

use tidewave_pb::data::Checkpoint;
use tokio::sync::mpsc;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceState {
    pub input_index: u32,
    pub state: Vec<u8>,
}

/// The snapshot shipped to the checkpoint storage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComputeActorCheckpointState {
    pub program_state: Vec<u8>,
    pub sources: Vec<SourceState>,
}

#[derive(Debug)]
pub enum CheckpointEvent {
    StateSaved {
        task_id: u64,
        checkpoint: Checkpoint,
        state: ComputeActorCheckpointState,
    },
}

#[derive(Debug)]
pub struct CheckpointCoordinator {
    task_id: u64,
    pending_checkpoint: Option<Checkpoint>,
    last_registered: Option<Checkpoint>,
    /// Input channels paused until the local checkpoint is taken.
    registered_channels: HashSet<u64>,
    state_saved: bool,
    sink: mpsc::UnboundedSender<CheckpointEvent>,
}

impl CheckpointCoordinator {
    pub fn new(task_id: u64, sink: mpsc::UnboundedSender<CheckpointEvent>) -> Self {
        Self {
            task_id,
            pending_checkpoint: None,
            last_registered: None,
            registered_channels: HashSet::new(),
            state_saved: false,
            sink,
        }
    }

    /// Registers a checkpoint barrier seen on an input channel. The channel
    /// stays paused until the local state is saved and the barrier is
    /// forwarded downstream.
    pub fn register_checkpoint(&mut self, checkpoint: Checkpoint, channel_id: u64) {
        if let Some(last) = self.last_registered {
            // Checkpoints are strictly ordered; an equal barrier is the same
            // checkpoint arriving on another channel.
            assert!(
                checkpoint >= last,
                "checkpoint {:?} arrived after {:?}",
                checkpoint,
                last
            );
        }
        self.last_registered = Some(checkpoint);

        if self.pending_checkpoint.is_none() {
            self.pending_checkpoint = Some(checkpoint);
            self.state_saved = false;
        }
        self.registered_channels.insert(channel_id);
    }

    pub fn has_pending_checkpoint(&self) -> bool {
        self.pending_checkpoint.is_some()
    }

    pub fn pending_checkpoint(&self) -> Option<Checkpoint> {
        self.pending_checkpoint
    }

    pub fn compute_actor_state_saved(&self) -> bool {
        self.state_saved
    }

    pub fn paused_channels(&self) -> &HashSet<u64> {
        &self.registered_channels
    }

    /// Ships the saved state out and unblocks the checkpoint pipeline.
    pub fn do_checkpoint(&mut self, state: ComputeActorCheckpointState) {
        let checkpoint = self
            .pending_checkpoint
            .expect("do_checkpoint without a pending checkpoint");
        self.state_saved = true;
        let _ = self.sink.send(CheckpointEvent::StateSaved {
            task_id: self.task_id,
            checkpoint,
            state,
        });
    }

    /// Clears the pending checkpoint once its barrier reached the outputs;
    /// the paused channels are the caller's to resume.
    pub fn complete_pending(&mut self) -> HashSet<u64> {
        self.pending_checkpoint = None;
        self.state_saved = false;
        std::mem::take(&mut self.registered_channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_lifecycle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut coordinator = CheckpointCoordinator::new(7, tx);

        let checkpoint = Checkpoint::new(1, 10);
        coordinator.register_checkpoint(checkpoint, 100);
        coordinator.register_checkpoint(checkpoint, 101);
        assert!(coordinator.has_pending_checkpoint());
        assert_eq!(coordinator.paused_channels().len(), 2);

        coordinator.do_checkpoint(ComputeActorCheckpointState {
            program_state: b"state".to_vec(),
            sources: vec![],
        });
        assert!(coordinator.compute_actor_state_saved());

        match rx.try_recv().unwrap() {
            CheckpointEvent::StateSaved {
                task_id,
                checkpoint: saved,
                state,
            } => {
                assert_eq!(task_id, 7);
                assert_eq!(saved, checkpoint);
                assert_eq!(state.program_state, b"state");
            }
        }

        let resumed = coordinator.complete_pending();
        assert_eq!(resumed.len(), 2);
        assert!(!coordinator.has_pending_checkpoint());
    }

    #[test]
    #[should_panic(expected = "arrived after")]
    fn test_checkpoints_are_totally_ordered() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut coordinator = CheckpointCoordinator::new(1, tx);
        coordinator.register_checkpoint(Checkpoint::new(2, 1), 100);
        coordinator.register_checkpoint(Checkpoint::new(1, 9), 101);
    }
}
