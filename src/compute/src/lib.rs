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

//! The asynchronous compute actor: a cooperative single-task executor
//! pumping channel data through the task runner, honoring watermarks,
//! checkpoints, back-pressure and CPU quota.

mod actor;
mod checkpoints;
mod error;
mod metrics;
mod task_runner;
mod watermarks;

pub use actor::{
    AsyncComputeActor, ComputeActorSettings, ComputeEvent, ComputeNotice, QuotaRequest,
};
pub use checkpoints::{CheckpointCoordinator, CheckpointEvent, ComputeActorCheckpointState, SourceState};
pub use error::{ComputeError, ComputeResult};
pub use metrics::ComputeActorMetrics;
pub use task_runner::{
    AsyncInputSource, AsyncOutputSink, ChannelTracker, CheckpointRequest, ContinueRun,
    OutputChannelData, RunFinished, RunStatus, SourcePoll, TaskRunnerEvent, TaskRunnerRequest,
    WatermarkRequest,
};
pub use watermarks::WatermarksTracker;
