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

//! Per-execution statistics, joined onto the JSON plan for ANALYZE.

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HistoryPoint {
    #[prost(uint64, tag = "1")]
    pub timestamp_ms: u64,
    #[prost(uint64, tag = "2")]
    pub value: u64,
}

/// Min/max/sum/count aggregate over the tasks of a stage, with an optional
/// time series.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AggrStat {
    #[prost(uint64, tag = "1")]
    pub min: u64,
    #[prost(uint64, tag = "2")]
    pub max: u64,
    #[prost(uint64, tag = "3")]
    pub sum: u64,
    #[prost(uint64, tag = "4")]
    pub cnt: u64,
    #[prost(message, repeated, tag = "5")]
    pub history: Vec<HistoryPoint>,
}

/// Async buffer statistics for one side of a stage's channels.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AsyncBufferStats {
    #[prost(uint32, tag = "1")]
    pub peer_stage_id: u32,
    #[prost(message, optional, tag = "2")]
    pub bytes: Option<AggrStat>,
    #[prost(message, optional, tag = "3")]
    pub rows: Option<AggrStat>,
    #[prost(message, optional, tag = "4")]
    pub wait_time_us: Option<AggrStat>,
    #[prost(message, optional, tag = "5")]
    pub first_message_ms: Option<AggrStat>,
    #[prost(message, optional, tag = "6")]
    pub last_message_ms: Option<AggrStat>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperatorStats {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(message, optional, tag = "3")]
    pub rows: Option<AggrStat>,
    #[prost(message, optional, tag = "4")]
    pub bytes: Option<AggrStat>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableAccessStats {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(message, optional, tag = "2")]
    pub read_rows: Option<AggrStat>,
    #[prost(message, optional, tag = "3")]
    pub read_bytes: Option<AggrStat>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskStats {
    #[prost(uint64, tag = "1")]
    pub task_id: u64,
    #[prost(string, tag = "2")]
    pub host: String,
    #[prost(uint64, tag = "3")]
    pub cpu_time_us: u64,
    #[prost(uint64, tag = "4")]
    pub input_rows: u64,
    #[prost(uint64, tag = "5")]
    pub input_bytes: u64,
    #[prost(uint64, tag = "6")]
    pub output_rows: u64,
    #[prost(uint64, tag = "7")]
    pub output_bytes: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StageStats {
    #[prost(string, tag = "1")]
    pub stage_guid: String,
    #[prost(uint32, tag = "2")]
    pub stage_id: u32,
    #[prost(uint32, tag = "3")]
    pub total_tasks_count: u32,
    #[prost(uint32, tag = "4")]
    pub finished_tasks_count: u32,
    #[prost(message, optional, tag = "5")]
    pub cpu_time_us: Option<AggrStat>,
    #[prost(message, optional, tag = "6")]
    pub output_rows: Option<AggrStat>,
    #[prost(message, optional, tag = "7")]
    pub output_bytes: Option<AggrStat>,
    #[prost(message, optional, tag = "8")]
    pub max_memory_usage: Option<AggrStat>,
    #[prost(message, repeated, tag = "9")]
    pub input: Vec<AsyncBufferStats>,
    #[prost(message, repeated, tag = "10")]
    pub output: Vec<AsyncBufferStats>,
    #[prost(message, repeated, tag = "11")]
    pub operators: Vec<OperatorStats>,
    #[prost(message, repeated, tag = "12")]
    pub tables: Vec<TableAccessStats>,
    #[prost(message, repeated, tag = "13")]
    pub tasks: Vec<TaskStats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionStats {
    #[prost(message, repeated, tag = "1")]
    pub stages: Vec<StageStats>,
    #[prost(uint64, tag = "2")]
    pub duration_us: u64,
    #[prost(uint64, tag = "3")]
    pub cpu_time_us: u64,
    #[prost(uint64, tag = "4")]
    pub result_rows: u64,
    #[prost(uint64, tag = "5")]
    pub result_bytes: u64,
}
