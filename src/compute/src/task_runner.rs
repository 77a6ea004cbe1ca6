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

//! The task-runner protocol and the compute actor's collaborator seams.
//!
//! The task runner is the in-process driver that evaluates a task's program;
//! the compute actor talks to it exclusively through these asynchronous
//! messages and never blocks on it.

use std::collections::HashMap;

use tidewave_pb::data::{ChannelData, Checkpoint, SerializedBatch, Watermark};

#[derive(Clone, Debug, PartialEq)]
pub struct WatermarkRequest {
    pub watermark: Watermark,
    /// Output channels the watermark must be forwarded to.
    pub channel_ids: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointRequest {
    pub channel_ids: Vec<u64>,
    pub sink_ids: Vec<u32>,
    pub checkpoint: Checkpoint,
}

/// One cooperative run of the task program.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContinueRun {
    pub sink_ids: Vec<u32>,
    pub input_transform_ids: Vec<u32>,
    pub checkpoint_only: bool,
    pub watermark_request: Option<WatermarkRequest>,
    pub checkpoint_request: Option<CheckpointRequest>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    PendingInput,
    PendingOutput,
    Finished,
}

/// Requests from the compute actor to the task runner.
#[derive(Debug)]
pub enum TaskRunnerRequest {
    ContinueRun(ContinueRun),
    InputChannelData {
        channel_id: u64,
        batch: Option<SerializedBatch>,
        finished: bool,
        pause_after_push: bool,
        cookie: u64,
    },
    SourceData {
        index: u32,
        batch: SerializedBatch,
        space: i64,
        finished: bool,
    },
    OutputChannelDataRequest {
        channel_id: u64,
        was_finished: bool,
        peer_free_memory: i64,
    },
    SinkDataRequest {
        index: u32,
        free_space: i64,
    },
}

#[derive(Clone, Debug, Default)]
pub struct RunFinished {
    pub status: Option<RunStatus>,
    pub input_channel_free_space: HashMap<u64, i64>,
    pub sources_free_space: HashMap<u32, i64>,
    pub watermark_injected_to_outputs: bool,
    /// Present when the runner captured its program state for a checkpoint.
    pub program_state: Option<Vec<u8>>,
    pub checkpoint_requested_from_task_runner: bool,
    pub mkql_memory_limit: u64,
}

#[derive(Clone, Debug, Default)]
pub struct OutputChannelData {
    pub channel_id: u64,
    pub data: Vec<SerializedBatch>,
    pub watermark: Option<Watermark>,
    pub checkpoint: Option<Checkpoint>,
    pub finished: bool,
    pub changed: bool,
}

/// Replies from the task runner.
#[derive(Clone, Debug)]
pub enum TaskRunnerEvent {
    RunFinished(RunFinished),
    InputChannelDataAck { cookie: u64, free_space: i64 },
    SourceDataAck { index: u32, free_space_left: i64 },
    OutputChannelData(OutputChannelData),
    SinkData {
        index: u32,
        batch: Option<SerializedBatch>,
        data_size: i64,
        checkpoint_size: i64,
        checkpoint: Option<Checkpoint>,
        finished: bool,
        changed: bool,
    },
}

/// In-flight state of the peers of this task's output channels, owned by
/// the channel transport.
pub trait ChannelTracker: Send {
    /// The peer has finished early and will not consume more data.
    fn should_skip_data(&self, channel_id: u64) -> bool;
    fn has_free_memory(&self, channel_id: u64) -> bool;
    fn can_send_channel_data(&self, channel_id: u64) -> bool;
    fn peer_free_memory(&self, channel_id: u64) -> i64;
    fn send_channel_data(&mut self, data: ChannelData, need_flush: bool);
    fn send_channel_data_ack(&mut self, channel_id: u64, free_space: i64);
}

#[derive(Debug, PartialEq)]
pub enum SourcePoll {
    Data {
        batch: SerializedBatch,
        space: i64,
        finished: bool,
    },
    /// Data exists but the buffer has no room for it.
    NoSpace,
    Pending,
}

/// An async source feeding one input of the task.
pub trait AsyncInputSource: Send {
    fn poll(&mut self, free_space: i64) -> SourcePoll;
    fn save_state(&mut self, checkpoint: &Checkpoint) -> Vec<u8>;
}

/// An async sink consuming one output of the task.
pub trait AsyncOutputSink: Send {
    fn free_space(&self) -> i64;
    fn send_data(
        &mut self,
        batch: Option<SerializedBatch>,
        size: i64,
        checkpoint: Option<Checkpoint>,
        finished: bool,
    );
}
