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

//! The physical-plan protocol: what the compile host emits and the task
//! graph builder consumes.

/// Reference to a table by path and identity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableRef {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(uint64, tag = "2")]
    pub owner_id: u64,
    #[prost(uint64, tag = "3")]
    pub table_id: u64,
    #[prost(uint64, tag = "4")]
    pub schema_version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SortColumn {
    #[prost(string, tag = "1")]
    pub column: String,
    #[prost(bool, tag = "2")]
    pub ascending: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnUnionAll {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnBroadcast {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnMap {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnParallelUnionAll {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnMerge {
    #[prost(message, repeated, tag = "1")]
    pub sort_columns: Vec<SortColumn>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HashV1 {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HashV2 {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnShardHashV1 {
    #[prost(int32, repeated, tag = "1")]
    pub key_column_types: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnHashShuffle {
    #[prost(string, repeated, tag = "1")]
    pub key_columns: Vec<String>,
    #[prost(bool, tag = "2")]
    pub use_spilling: bool,
    #[prost(oneof = "phy_cn_hash_shuffle::HashKind", tags = "3, 4, 5")]
    pub hash_kind: Option<phy_cn_hash_shuffle::HashKind>,
}

pub mod phy_cn_hash_shuffle {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum HashKind {
        #[prost(message, tag = "3")]
        HashV1(super::HashV1),
        #[prost(message, tag = "4")]
        HashV2(super::HashV2),
        #[prost(message, tag = "5")]
        ColumnShardHashV1(super::ColumnShardHashV1),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnSequencer {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableRef>,
    #[prost(string, repeated, tag = "2")]
    pub columns: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub auto_increment_columns: Vec<String>,
    #[prost(string, tag = "4")]
    pub input_type: String,
    #[prost(string, tag = "5")]
    pub output_type: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum StreamLookupStrategy {
    Unspecified = 0,
    Lookup = 1,
    Join = 2,
    SemiJoin = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyCnStreamLookup {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableRef>,
    #[prost(string, repeated, tag = "2")]
    pub columns: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub key_columns: Vec<String>,
    #[prost(string, tag = "4")]
    pub lookup_keys_type: String,
    #[prost(string, tag = "5")]
    pub result_type: String,
    #[prost(enumeration = "StreamLookupStrategy", tag = "6")]
    pub lookup_strategy: i32,
    #[prost(bool, tag = "7")]
    pub keep_rows_order: bool,
    #[prost(uint32, tag = "8")]
    pub allow_null_keys_prefix_size: u32,
    #[prost(bool, tag = "9")]
    pub is_table_immutable: bool,
}

/// A stage input: where it comes from and how rows are distributed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyConnection {
    #[prost(uint32, tag = "1")]
    pub input_index: u32,
    #[prost(uint32, tag = "2")]
    pub stage_index: u32,
    #[prost(uint32, tag = "3")]
    pub output_index: u32,
    #[prost(oneof = "phy_connection::Type", tags = "4, 5, 6, 7, 8, 9, 10, 11")]
    pub r#type: Option<phy_connection::Type>,
}

pub mod phy_connection {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "4")]
        UnionAll(super::PhyCnUnionAll),
        #[prost(message, tag = "5")]
        HashShuffle(super::PhyCnHashShuffle),
        #[prost(message, tag = "6")]
        Broadcast(super::PhyCnBroadcast),
        #[prost(message, tag = "7")]
        Map(super::PhyCnMap),
        #[prost(message, tag = "8")]
        Merge(super::PhyCnMerge),
        #[prost(message, tag = "9")]
        Sequencer(super::PhyCnSequencer),
        #[prost(message, tag = "10")]
        StreamLookup(super::PhyCnStreamLookup),
        #[prost(message, tag = "11")]
        ParallelUnionAll(super::PhyCnParallelUnionAll),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyReadRangesSource {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableRef>,
    #[prost(string, repeated, tag = "2")]
    pub columns: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyExternalSource {
    #[prost(string, tag = "1")]
    pub source_type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub settings: Vec<u8>,
    /// Embedded sources are evaluated inside the program and do not occupy
    /// an input slot.
    #[prost(bool, tag = "3")]
    pub embedded: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhySource {
    #[prost(uint32, tag = "1")]
    pub input_index: u32,
    #[prost(oneof = "phy_source::Type", tags = "2, 3")]
    pub r#type: Option<phy_source::Type>,
}

pub mod phy_source {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "2")]
        ReadRangesSource(super::PhyReadRangesSource),
        #[prost(message, tag = "3")]
        ExternalSource(super::PhyExternalSource),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum TableSinkMode {
    Unspecified = 0,
    Replace = 1,
    Upsert = 2,
    Insert = 3,
    Delete = 4,
    Update = 5,
    Fill = 6,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableSinkIndex {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableRef>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableSinkSettings {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableRef>,
    #[prost(enumeration = "TableSinkMode", tag = "2")]
    pub mode: i32,
    #[prost(message, repeated, tag = "3")]
    pub indexes: Vec<TableSinkIndex>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyInternalSink {
    #[prost(message, optional, tag = "1")]
    pub settings: Option<TableSinkSettings>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyExternalSink {
    #[prost(string, tag = "1")]
    pub sink_type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub settings: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhySink {
    #[prost(uint32, tag = "1")]
    pub output_index: u32,
    #[prost(oneof = "phy_sink::Type", tags = "2, 3")]
    pub r#type: Option<phy_sink::Type>,
}

pub mod phy_sink {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "2")]
        InternalSink(super::PhyInternalSink),
        #[prost(message, tag = "3")]
        ExternalSink(super::PhyExternalSink),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyOpReadRange {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyOpReadRanges {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyOpReadOlapRanges {
    #[prost(bytes = "vec", tag = "1")]
    pub olap_program: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub parameter_names: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyOpUpsertRows {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyOpDeleteRows {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyTableOperation {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableRef>,
    #[prost(oneof = "phy_table_operation::Type", tags = "2, 3, 4, 5, 6")]
    pub r#type: Option<phy_table_operation::Type>,
}

pub mod phy_table_operation {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "2")]
        ReadRange(super::PhyOpReadRange),
        #[prost(message, tag = "3")]
        ReadRanges(super::PhyOpReadRanges),
        #[prost(message, tag = "4")]
        ReadOlapRange(super::PhyOpReadOlapRanges),
        #[prost(message, tag = "5")]
        UpsertRows(super::PhyOpUpsertRows),
        #[prost(message, tag = "6")]
        DeleteRows(super::PhyOpDeleteRows),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyStage {
    #[prost(message, repeated, tag = "1")]
    pub inputs: Vec<PhyConnection>,
    #[prost(message, repeated, tag = "2")]
    pub sources: Vec<PhySource>,
    #[prost(message, repeated, tag = "3")]
    pub sinks: Vec<PhySink>,
    #[prost(uint32, tag = "4")]
    pub outputs_count: u32,
    #[prost(message, repeated, tag = "5")]
    pub table_ops: Vec<PhyTableOperation>,
    #[prost(string, repeated, tag = "6")]
    pub program_parameters: Vec<String>,
    /// Opaque serialized program executed by the task runner.
    #[prost(bytes = "vec", tag = "7")]
    pub program: Vec<u8>,
    #[prost(string, tag = "8")]
    pub stage_guid: String,
    #[prost(bool, tag = "9")]
    pub is_effects_stage: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyResultConnection {
    #[prost(uint32, tag = "1")]
    pub stage_index: u32,
    #[prost(uint32, tag = "2")]
    pub output_index: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyResult {
    #[prost(message, optional, tag = "1")]
    pub connection: Option<PhyResultConnection>,
    #[prost(uint64, tag = "2")]
    pub rows_limit: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PhyTx {
    #[prost(message, repeated, tag = "1")]
    pub stages: Vec<PhyStage>,
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<PhyResult>,
    #[prost(bool, tag = "3")]
    pub has_effects: bool,
}
