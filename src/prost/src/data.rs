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

//! Per-channel payloads and the barriers carried with them.

use std::cmp::Ordering;

/// A consistent snapshot barrier. Totally ordered by `(generation, id)`.
#[derive(Eq, Hash, Copy, Clone, PartialEq, ::prost::Message)]
pub struct Checkpoint {
    #[prost(uint64, tag = "1")]
    pub generation: u64,
    #[prost(uint64, tag = "2")]
    pub id: u64,
}

impl Checkpoint {
    pub fn new(generation: u64, id: u64) -> Self {
        Self { generation, id }
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.generation, self.id).cmp(&(other.generation, other.id))
    }
}

/// Monotonic event-time watermark, microsecond resolution.
#[derive(Eq, Hash, Copy, Clone, PartialEq, PartialOrd, Ord, ::prost::Message)]
pub struct Watermark {
    #[prost(uint64, tag = "1")]
    pub timestamp_us: u64,
}

impl Watermark {
    pub fn new(timestamp_us: u64) -> Self {
        Self { timestamp_us }
    }
}

/// Serialized rows travelling through a channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SerializedBatch {
    #[prost(uint32, tag = "1")]
    pub rows: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub raw: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelData {
    #[prost(uint64, tag = "1")]
    pub channel_id: u64,
    #[prost(message, optional, tag = "2")]
    pub data: Option<SerializedBatch>,
    #[prost(bool, tag = "3")]
    pub finished: bool,
    #[prost(message, optional, tag = "4")]
    pub checkpoint: Option<Checkpoint>,
    #[prost(message, optional, tag = "5")]
    pub watermark: Option<Watermark>,
}

impl ChannelData {
    pub fn row_count(&self) -> u32 {
        self.data.as_ref().map_or(0, |d| d.rows)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum WatermarksMode {
    Disabled = 0,
    Default = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CheckpointingMode {
    Disabled = 0,
    Default = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ComputeState {
    Unspecified = 0,
    Executing = 1,
    Finished = 2,
    Failure = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusIds {
    Unspecified = 0,
    Success = 1,
    InternalError = 2,
    Timeout = 3,
    Aborted = 4,
    BadRequest = 5,
    QuotaExceeded = 6,
    PreconditionFailed = 7,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IssueProto {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(uint32, tag = "2")]
    pub severity: u32,
    #[prost(message, repeated, tag = "3")]
    pub issues: Vec<IssueProto>,
}

/// Snapshot of a compute actor's state, returned on `StateRequest`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComputeActorState {
    #[prost(enumeration = "ComputeState", tag = "1")]
    pub state: i32,
    #[prost(enumeration = "StatusIds", tag = "2")]
    pub status_code: i32,
    #[prost(uint64, tag = "3")]
    pub task_id: u64,
    #[prost(message, repeated, tag = "4")]
    pub issues: Vec<IssueProto>,
    #[prost(uint64, tag = "5")]
    pub mkql_memory_limit: u64,
}
