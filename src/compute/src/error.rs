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

use thiserror::Error;
use tidewave_pb::data::StatusIds;

pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

/// Failures inside one compute actor. Every variant is terminal: the actor
/// reports the mapped status to its executer and passes away.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("task {task_id}: unknown input channel {channel_id}")]
    UnknownInputChannel { task_id: u64, channel_id: u64 },
    #[error("task {task_id}: unknown output channel {channel_id}")]
    UnknownOutputChannel { task_id: u64, channel_id: u64 },
    #[error("unknown source {0}")]
    UnknownSource(u32),
    #[error("unknown sink {0}")]
    UnknownSink(u32),
    #[error("unknown input-data cookie {0}")]
    UnknownCookie(u64),
    #[error("data was not sent to the output channel in the previous step, channel: {0}")]
    OutputDataPending(u64),
    #[error("checkpoint on channel {0} with checkpointing disabled")]
    CheckpointingDisabled(u64),
    #[error("checkpoint received without a coordinator")]
    NoCheckpointCoordinator,
    #[error("checkpoint without program state")]
    MissingProgramState,
    #[error("program state without a pending checkpoint")]
    NoPendingCheckpoint,
    #[error("Error getting CPU quota")]
    QuotaDenied,
}

impl ComputeError {
    pub fn status(&self) -> StatusIds {
        // Every failure here is an invariant broken mid-execution.
        StatusIds::InternalError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let error = ComputeError::UnknownInputChannel {
            task_id: 7,
            channel_id: 42,
        };
        assert_eq!(error.to_string(), "task 7: unknown input channel 42");
        assert_eq!(error.status(), StatusIds::InternalError);
    }
}
