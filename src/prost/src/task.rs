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

//! The dispatch protocol: a task projected onto the wire for a remote
//! compute actor or data shard.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum DataTransportVersion {
    DataTransportVersionUnspecified = 0,
    DataTransportUvPickle10 = 20,
    DataTransportOobPickle10 = 30,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum TableDataFormat {
    FormatUnspecified = 0,
    FormatCellvec = 1,
    FormatArrow = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ScanReadType {
    Rows = 0,
    Blocks = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum DefaultKind {
    DefaultKindUnspecified = 0,
    DefaultKindSequence = 1,
    DefaultKindLiteral = 2,
}

/// Either a compute actor or a data shard terminates a channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Endpoint {
    #[prost(oneof = "endpoint::Type", tags = "1, 2")]
    pub r#type: Option<endpoint::Type>,
}

pub mod endpoint {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(string, tag = "1")]
        ActorId(String),
        #[prost(uint64, tag = "2")]
        TabletId(u64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelDesc {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint32, tag = "2")]
    pub src_stage_id: u32,
    #[prost(uint32, tag = "3")]
    pub dst_stage_id: u32,
    #[prost(uint64, tag = "4")]
    pub src_task_id: u64,
    #[prost(uint64, tag = "5")]
    pub dst_task_id: u64,
    #[prost(message, optional, tag = "6")]
    pub src_endpoint: Option<Endpoint>,
    #[prost(message, optional, tag = "7")]
    pub dst_endpoint: Option<Endpoint>,
    /// Crosses shards, so the payload must survive restarts.
    #[prost(bool, tag = "8")]
    pub is_persistent: bool,
    #[prost(bool, tag = "9")]
    pub in_memory: bool,
    #[prost(bool, tag = "10")]
    pub enable_spilling: bool,
    #[prost(enumeration = "DataTransportVersion", tag = "11")]
    pub transport_version: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnMeta {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int32, tag = "3")]
    pub r#type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnSequencerMeta {
    #[prost(message, optional, tag = "1")]
    pub column: Option<ColumnMeta>,
    #[prost(enumeration = "DefaultKind", optional, tag = "2")]
    pub default_kind: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub default_from_sequence: Option<String>,
    #[prost(uint64, optional, tag = "4")]
    pub default_from_sequence_path_id: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub default_from_literal: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableMeta {
    #[prost(string, tag = "1")]
    pub table_path: String,
    #[prost(uint64, tag = "2")]
    pub owner_id: u64,
    #[prost(uint64, tag = "3")]
    pub table_id: u64,
    #[prost(uint64, tag = "4")]
    pub schema_version: u64,
    #[prost(string, tag = "5")]
    pub sys_view_info: String,
    #[prost(uint32, tag = "6")]
    pub table_kind: u32,
}

/// An inclusive/exclusive range over serialized key tuples.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SerializedRange {
    #[prost(bytes = "vec", tag = "1")]
    pub from: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub to: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub from_inclusive: bool,
    #[prost(bool, tag = "4")]
    pub to_inclusive: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyRanges {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub key_points: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub key_ranges: Vec<SerializedRange>,
}

/// Key-range form used by data-task meta: full range or a mixed list.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyRange {
    #[prost(oneof = "key_range::Kind", tags = "1, 2")]
    pub kind: Option<key_range::Kind>,
}

pub mod key_range {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        FullRange(super::SerializedRange),
        #[prost(message, tag = "2")]
        Ranges(super::KeyRanges),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataReadMeta {
    #[prost(message, optional, tag = "1")]
    pub range: Option<KeyRange>,
    #[prost(message, repeated, tag = "2")]
    pub columns: Vec<ColumnMeta>,
    #[prost(uint64, tag = "3")]
    pub items_limit: u64,
    #[prost(bool, tag = "4")]
    pub reverse: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnWriteMeta {
    #[prost(message, optional, tag = "1")]
    pub column: Option<ColumnMeta>,
    #[prost(uint32, tag = "2")]
    pub max_value_size_bytes: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataWriteMeta {
    #[prost(message, optional, tag = "1")]
    pub range: Option<KeyRange>,
    #[prost(message, repeated, tag = "2")]
    pub columns: Vec<ColumnWriteMeta>,
    #[prost(bool, tag = "3")]
    pub is_pure_erase_op: bool,
}

/// Task meta for a data-shard task with reads and/or writes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataTaskMeta {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableMeta>,
    #[prost(message, repeated, tag = "2")]
    pub reads: Vec<DataReadMeta>,
    #[prost(message, optional, tag = "3")]
    pub writes: Option<DataWriteMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OlapProgram {
    #[prost(bytes = "vec", tag = "1")]
    pub program: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub parameters_schema: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub parameters: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanReadMeta {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(message, repeated, tag = "2")]
    pub key_ranges: Vec<SerializedRange>,
}

/// Task meta for a scan task.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanTaskMeta {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableMeta>,
    #[prost(int32, repeated, tag = "2")]
    pub key_column_types: Vec<i32>,
    #[prost(bool, repeated, tag = "3")]
    pub skip_null_keys: Vec<bool>,
    #[prost(enumeration = "TableDataFormat", tag = "4")]
    pub data_format: i32,
    #[prost(uint64, tag = "5")]
    pub items_limit: u64,
    #[prost(bool, tag = "6")]
    pub reverse: bool,
    #[prost(uint32, tag = "7")]
    pub optional_sorting: u32,
    #[prost(enumeration = "ScanReadType", tag = "8")]
    pub read_type: i32,
    #[prost(string, repeated, tag = "9")]
    pub group_by_column_names: Vec<String>,
    #[prost(message, repeated, tag = "10")]
    pub result_columns: Vec<ColumnMeta>,
    #[prost(message, repeated, tag = "11")]
    pub columns: Vec<ColumnMeta>,
    #[prost(message, optional, tag = "12")]
    pub olap_program: Option<OlapProgram>,
    #[prost(message, repeated, tag = "13")]
    pub reads: Vec<ScanReadMeta>,
    #[prost(bool, optional, tag = "14")]
    pub enable_shards_sequential_scan: Option<bool>,
}

#[derive(Eq, Hash, Copy, Clone, PartialEq, ::prost::Message)]
pub struct Snapshot {
    #[prost(uint64, tag = "1")]
    pub step: u64,
    #[prost(uint64, tag = "2")]
    pub tx_id: u64,
}

/// Read-ranges source settings, packed into a `Source` input.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadRangesSourceSettings {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableMeta>,
    #[prost(message, repeated, tag = "2")]
    pub columns: Vec<ColumnMeta>,
    #[prost(message, optional, tag = "3")]
    pub ranges: Option<KeyRanges>,
    #[prost(message, optional, tag = "4")]
    pub snapshot: Option<Snapshot>,
    #[prost(bool, tag = "5")]
    pub use_followers: bool,
    #[prost(bool, tag = "6")]
    pub allow_inconsistent_reads: bool,
    #[prost(uint64, optional, tag = "7")]
    pub lock_tx_id: Option<u64>,
    #[prost(uint32, tag = "8")]
    pub lock_node_id: u32,
    #[prost(uint32, optional, tag = "9")]
    pub lock_mode: Option<u32>,
    #[prost(uint64, tag = "10")]
    pub items_limit: u64,
    #[prost(bool, tag = "11")]
    pub reverse: bool,
    #[prost(bool, tag = "12")]
    pub is_table_immutable: bool,
}

/// Stream-lookup transform settings.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamLookupSettings {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableMeta>,
    #[prost(message, repeated, tag = "2")]
    pub key_columns: Vec<ColumnMeta>,
    #[prost(string, repeated, tag = "3")]
    pub lookup_key_columns: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub columns: Vec<ColumnMeta>,
    #[prost(enumeration = "super::plan::StreamLookupStrategy", tag = "5")]
    pub lookup_strategy: i32,
    #[prost(bool, tag = "6")]
    pub keep_rows_order: bool,
    #[prost(uint32, tag = "7")]
    pub allow_null_keys_prefix_size: u32,
    #[prost(message, optional, tag = "8")]
    pub snapshot: Option<Snapshot>,
    #[prost(bool, tag = "9")]
    pub allow_inconsistent_reads: bool,
    #[prost(uint64, optional, tag = "10")]
    pub lock_tx_id: Option<u64>,
    #[prost(uint32, tag = "11")]
    pub lock_node_id: u32,
    #[prost(uint32, optional, tag = "12")]
    pub lock_mode: Option<u32>,
    #[prost(bool, tag = "13")]
    pub allow_use_followers: bool,
    #[prost(bool, tag = "14")]
    pub is_table_immutable: bool,
}

/// Sequencer transform settings.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SequencerSettings {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableMeta>,
    #[prost(string, tag = "2")]
    pub database: String,
    #[prost(message, repeated, tag = "3")]
    pub columns: Vec<ColumnSequencerMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskTransform {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub input_type: String,
    #[prost(string, tag = "3")]
    pub output_type: String,
    #[prost(oneof = "task_transform::Settings", tags = "4, 5")]
    pub settings: Option<task_transform::Settings>,
}

pub mod task_transform {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Settings {
        #[prost(message, tag = "4")]
        StreamLookup(super::StreamLookupSettings),
        #[prost(message, tag = "5")]
        Sequencer(super::SequencerSettings),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnionAllInput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MergeInput {
    #[prost(message, repeated, tag = "1")]
    pub sort_columns: Vec<super::plan::SortColumn>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SourceInput {
    #[prost(string, tag = "1")]
    pub source_type: String,
    #[prost(enumeration = "super::data::WatermarksMode", tag = "2")]
    pub watermarks_mode: i32,
    #[prost(oneof = "source_input::Settings", tags = "3, 4")]
    pub settings: Option<source_input::Settings>,
}

pub mod source_input {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Settings {
        #[prost(message, tag = "3")]
        ReadRanges(super::ReadRangesSourceSettings),
        #[prost(bytes, tag = "4")]
        External(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskInputDesc {
    #[prost(oneof = "task_input_desc::Type", tags = "1, 2, 3")]
    pub r#type: Option<task_input_desc::Type>,
    #[prost(message, repeated, tag = "4")]
    pub channels: Vec<ChannelDesc>,
    #[prost(message, optional, tag = "5")]
    pub transform: Option<TaskTransform>,
}

pub mod task_input_desc {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        UnionAll(super::UnionAllInput),
        #[prost(message, tag = "2")]
        Merge(super::MergeInput),
        #[prost(message, tag = "3")]
        Source(super::SourceInput),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MapOutput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BroadcastOutput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EffectsOutput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnShardHashV1Params {
    #[prost(uint64, tag = "1")]
    pub shard_count: u64,
    #[prost(int32, repeated, tag = "2")]
    pub key_column_types: Vec<i32>,
    #[prost(uint64, repeated, tag = "3")]
    pub task_index_by_hash: Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HashPartitionOutput {
    #[prost(string, repeated, tag = "1")]
    pub key_columns: Vec<String>,
    #[prost(uint32, tag = "2")]
    pub partitions_count: u32,
    #[prost(oneof = "hash_partition_output::HashKind", tags = "3, 4, 5")]
    pub hash_kind: Option<hash_partition_output::HashKind>,
}

pub mod hash_partition_output {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum HashKind {
        #[prost(message, tag = "3")]
        HashV1(super::super::plan::HashV1),
        #[prost(message, tag = "4")]
        HashV2(super::super::plan::HashV2),
        #[prost(message, tag = "5")]
        ColumnShardHashV1(super::ColumnShardHashV1Params),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RangePartitionDesc {
    #[prost(bytes = "vec", tag = "1")]
    pub end_key_prefix: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub is_inclusive: bool,
    #[prost(bool, tag = "3")]
    pub is_point: bool,
    #[prost(uint64, tag = "4")]
    pub channel_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RangePartitionOutput {
    #[prost(string, repeated, tag = "1")]
    pub key_columns: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub partitions: Vec<RangePartitionDesc>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SinkOutput {
    #[prost(string, tag = "1")]
    pub sink_type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub settings: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskOutputDesc {
    #[prost(oneof = "task_output_desc::Type", tags = "1, 2, 3, 4, 5, 6")]
    pub r#type: Option<task_output_desc::Type>,
    #[prost(message, repeated, tag = "7")]
    pub channels: Vec<ChannelDesc>,
}

pub mod task_output_desc {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        Map(super::MapOutput),
        #[prost(message, tag = "2")]
        HashPartition(super::HashPartitionOutput),
        #[prost(message, tag = "3")]
        RangePartition(super::RangePartitionOutput),
        #[prost(message, tag = "4")]
        Broadcast(super::BroadcastOutput),
        #[prost(message, tag = "5")]
        Effects(super::EffectsOutput),
        #[prost(message, tag = "6")]
        Sink(super::SinkOutput),
    }
}

/// A task serialized for dispatch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskDesc {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint32, tag = "2")]
    pub stage_id: u32,
    #[prost(string, tag = "3")]
    pub executer_actor_id: String,
    #[prost(message, repeated, tag = "4")]
    pub inputs: Vec<TaskInputDesc>,
    #[prost(message, repeated, tag = "5")]
    pub outputs: Vec<TaskOutputDesc>,
    #[prost(bytes = "vec", tag = "6")]
    pub program: Vec<u8>,
    #[prost(map = "string, bytes", tag = "7")]
    pub parameters: HashMap<String, Vec<u8>>,
    #[prost(map = "string, string", tag = "8")]
    pub task_params: HashMap<String, String>,
    #[prost(string, repeated, tag = "9")]
    pub read_ranges: Vec<String>,
    #[prost(map = "string, string", tag = "10")]
    pub secure_params: HashMap<String, String>,
    #[prost(bool, tag = "11")]
    pub use_llvm: bool,
    #[prost(bool, tag = "12")]
    pub enable_spilling: bool,
    #[prost(bool, tag = "13")]
    pub disable_metering: bool,
    #[prost(string, tag = "14")]
    pub rate_limiter: String,
    #[prost(string, tag = "15")]
    pub rate_limiter_resource: String,
    #[prost(oneof = "task_desc::Meta", tags = "16, 17")]
    pub meta: Option<task_desc::Meta>,
}

pub mod task_desc {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Meta {
        #[prost(message, tag = "16")]
        Data(super::DataTaskMeta),
        #[prost(message, tag = "17")]
        Scan(super::ScanTaskMeta),
    }
}
