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

//! The tasks graph: an arena owning every stage, task and channel of one
//! transaction set. Entities refer to each other by id only; the graph hands
//! out `id <-> &T` lookups. Built once, mutated only during build, then
//! frozen before dispatch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use tidewave_common::catalog::{ShardOperation, TableConstInfoRef, TableId, TableKind};
use tidewave_common::config::ChannelTransportVersion;
use tidewave_common::types::{Datum, TypeId};
use tidewave_pb::data::WatermarksMode;
use tidewave_pb::plan::{PhyStage, PhyTx, SortColumn};
use tidewave_pb::task::{
    ReadRangesSourceSettings, SequencerSettings, Snapshot, StreamLookupSettings,
};

use crate::key_range::ShardKeyRanges;

/// Identifies a stage across the transaction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId {
    pub tx_idx: u32,
    pub stage_idx: u32,
}

impl StageId {
    pub fn new(tx_idx: u32, stage_idx: u32) -> Self {
        Self { tx_idx, stage_idx }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.tx_idx, self.stage_idx)
    }
}

pub type TaskId = u64;
pub type ChannelId = u64;

/// Query parameter values, resolved by the executer per transaction.
pub trait QueryParamsProvider: Send + Sync {
    /// Parameter serialized for shipping inside a task.
    fn serialized_value(&self, name: &str) -> Option<Vec<u8>>;

    /// Parameter restricted to one shard, for data-shard tasks.
    fn shard_param(&self, shard_id: u64, name: &str) -> Option<Vec<u8>> {
        let _ = shard_id;
        self.serialized_value(name)
    }

    /// Typed value for OLAP parameter batches.
    fn typed_value(&self, name: &str) -> Option<(TypeId, Datum)>;
}

/// One transaction of the physical plan plus its resolved context.
#[derive(Clone)]
pub struct TxData {
    pub body: Arc<PhyTx>,
    pub params: Arc<dyn QueryParamsProvider>,
    pub tables: Arc<HashMap<TableId, TableConstInfoRef>>,
}

impl fmt::Debug for TxData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxData")
            .field("stages", &self.body.stages.len())
            .field("results", &self.body.results.len())
            .finish()
    }
}

/// Column-shard hash parameters that must survive across stages for shuffle
/// elimination to stay correct.
#[derive(Clone, Debug, Default)]
pub struct ColumnShardHashV1Params {
    pub source_shard_count: u64,
    pub task_index_by_hash: Option<Arc<Vec<u64>>>,
    pub source_table_key_column_types: Option<Arc<Vec<TypeId>>>,
}

impl ColumnShardHashV1Params {
    pub fn key_types_to_string(&self) -> String {
        match &self.source_table_key_column_types {
            Some(types) => format!("[{}]", types.iter().map(|t| t.to_string()).join(",")),
            None => "[]".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IndexMeta {
    pub table_id: TableId,
    pub table_path: String,
    pub table_const_info: Option<TableConstInfoRef>,
}

/// Stage facts accumulated while filling the graph.
#[derive(Clone)]
pub struct StageInfoMeta {
    pub tx: TxData,
    pub table_id: Option<TableId>,
    pub table_path: Option<String>,
    pub table_kind: TableKind,
    pub table_const_info: Option<TableConstInfoRef>,
    pub shard_operations: HashSet<ShardOperation>,
    pub index_metas: Vec<IndexMeta>,
    pub skip_null_keys: Vec<bool>,
    pub column_shard_hash_v1_params: ColumnShardHashV1Params,
    pub hash_params_by_output: HashMap<u32, ColumnShardHashV1Params>,
}

impl StageInfoMeta {
    pub fn new(tx: TxData) -> Self {
        Self {
            tx,
            table_id: None,
            table_path: None,
            table_kind: TableKind::Unknown,
            table_const_info: None,
            shard_operations: HashSet::new(),
            index_metas: Vec::new(),
            skip_null_keys: Vec::new(),
            column_shard_hash_v1_params: ColumnShardHashV1Params::default(),
            hash_params_by_output: HashMap::new(),
        }
    }

    pub fn stage(&self, id: StageId) -> &PhyStage {
        &self.tx.body.stages[id.stage_idx as usize]
    }

    pub fn has_reads(&self) -> bool {
        self.shard_operations.contains(&ShardOperation::Read)
    }

    pub fn has_writes(&self) -> bool {
        self.shard_operations.contains(&ShardOperation::Update)
            || self.shard_operations.contains(&ShardOperation::Erase)
    }

    pub fn is_sys_view(&self) -> bool {
        self.table_const_info
            .as_ref()
            .is_some_and(|info| info.sys_view_info.is_some())
    }

    /// Hash parameters a downstream stage inherits through this output.
    pub fn column_shard_hash_v1_params(&self, output_idx: u32) -> &ColumnShardHashV1Params {
        self.hash_params_by_output
            .get(&output_idx)
            .unwrap_or(&self.column_shard_hash_v1_params)
    }
}

/// A parallel class of tasks sharing a program and a schema.
pub struct StageInfo {
    pub id: StageId,
    pub input_count: usize,
    pub output_count: usize,
    pub tasks: Vec<TaskId>,
    pub meta: StageInfoMeta,
}

impl StageInfo {
    pub fn new(id: StageId, input_count: usize, output_count: usize, meta: StageInfoMeta) -> Self {
        Self {
            id,
            input_count,
            output_count,
            tasks: Vec::new(),
            meta,
        }
    }

    pub fn debug_string(&self) -> String {
        format!(
            "StageInfo: id: {}, tasks: {:?}, table: {:?}, reads: {}, writes: {}",
            self.id,
            self.tasks,
            self.meta.table_path,
            self.meta.has_reads(),
            self.meta.has_writes(),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskInputType {
    UnionAll,
    Merge { sort_columns: Vec<SortColumn> },
    Source,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transform {
    pub type_name: String,
    pub input_type: String,
    pub output_type: String,
}

/// Per-input settings shared by every task of a stage.
#[derive(Clone, Debug, Default)]
pub struct TaskInputMeta {
    pub source_settings: Option<Arc<ReadRangesSourceSettings>>,
    pub stream_lookup_settings: Option<Arc<StreamLookupSettings>>,
    pub sequencer_settings: Option<Arc<SequencerSettings>>,
    pub external_source_settings: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct TaskInput {
    pub input_type: TaskInputType,
    pub channels: Vec<ChannelId>,
    pub transform: Option<Transform>,
    pub source_type: Option<String>,
    pub watermarks_mode: WatermarksMode,
    pub meta: TaskInputMeta,
}

impl Default for TaskInput {
    fn default() -> Self {
        Self {
            input_type: TaskInputType::UnionAll,
            channels: Vec::new(),
            transform: None,
            source_type: None,
            watermarks_mode: WatermarksMode::Disabled,
            meta: TaskInputMeta::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashFunc {
    HashV1,
    HashV2,
    ColumnShardHashV1,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum TaskOutputType {
    #[default]
    Undefined,
    Map,
    HashPartition {
        key_columns: Vec<String>,
        partitions_count: u32,
        hash_kind: HashFunc,
    },
    RangePartition {
        key_columns: Vec<String>,
    },
    Broadcast,
    Effects,
    Sink {
        sink_type: String,
        settings: Vec<u8>,
    },
}

/// Range-partition boundary addressed to one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardPartitionRange {
    pub end_key_prefix: Vec<u8>,
    pub is_inclusive: bool,
    pub is_point: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TaskOutput {
    pub output_type: TaskOutputType,
    pub channels: Vec<ChannelId>,
    /// Channel id -> partition boundary, for range-partition outputs.
    pub shard_partitions: BTreeMap<ChannelId, ShardPartitionRange>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanReadKind {
    #[default]
    Rows,
    Blocks,
}

#[derive(Clone, Debug, Default)]
pub struct OlapProgramInfo {
    pub program: Vec<u8>,
    pub parameter_names: HashSet<String>,
}

/// Flags shared by every read of a task.
#[derive(Clone, Debug, Default)]
pub struct ReadFlags {
    pub items_limit: u64,
    pub reverse: bool,
    pub sorting: u32,
    pub read_kind: ScanReadKind,
    pub group_by_column_names: Vec<String>,
    pub result_column_types: Vec<TypeId>,
    pub olap_program: Option<OlapProgramInfo>,
}

#[derive(Clone, Debug)]
pub struct ReadInfo {
    pub shard_id: u64,
    pub ranges: ShardKeyRanges,
    pub columns: Vec<tidewave_common::catalog::ColumnMetadata>,
}

#[derive(Clone, Debug, Default)]
pub struct ColumnWrite {
    pub column: Option<tidewave_common::catalog::ColumnMetadata>,
    pub max_value_size_bytes: u32,
}

#[derive(Clone, Debug, Default)]
pub struct WriteInfo {
    pub ranges: ShardKeyRanges,
    /// Keyed by column id.
    pub column_writes: BTreeMap<u32, ColumnWrite>,
    pub is_pure_erase_op: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TaskMeta {
    pub shard_id: Option<u64>,
    pub scan_task: bool,
    pub reads: Option<Vec<ReadInfo>>,
    pub writes: Option<WriteInfo>,
    pub read_flags: ReadFlags,
    pub task_params: BTreeMap<String, String>,
    pub read_ranges: Vec<String>,
    pub secure_params: BTreeMap<String, String>,
    pub enable_shards_sequential_scan: Option<bool>,
}

impl TaskMeta {
    pub fn display_text(&self) -> String {
        let reads = match &self.reads {
            None => "none".to_owned(),
            Some(reads) => reads
                .iter()
                .map(|r| format!("{{ shard: {}, ranges: {} }}", r.shard_id, r.ranges.display_text()))
                .join(", "),
        };
        let writes = match &self.writes {
            None => "none".to_owned(),
            Some(w) => w.ranges.display_text(),
        };
        format!(
            "TaskMeta {{ shard: {:?}, reads: {{ {} }}, writes: {{ {} }} }}",
            self.shard_id, reads, writes
        )
    }
}

/// The unit of scheduling: one compute actor's worth of work.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub stage_id: StageId,
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<TaskOutput>,
    pub meta: TaskMeta,
    pub compute_actor_id: Option<String>,
}

/// A one-way pipe between two tasks, referenced by id from both endpoints.
#[derive(Clone, Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub src_stage_id: StageId,
    pub dst_stage_id: StageId,
    pub src_task: TaskId,
    /// Zero addresses the executer itself (result channels).
    pub dst_task: TaskId,
    pub src_output_index: u32,
    pub dst_input_index: u32,
    pub in_memory: bool,
}

/// Graph-wide context shared with the serializer. Modelled explicitly
/// instead of through process globals.
#[derive(Clone, Debug, Default)]
pub struct GraphMeta {
    pub database: String,
    pub executer_actor_id: String,
    pub snapshot: Option<Snapshot>,
    pub lock_tx_id: Option<u64>,
    pub lock_node_id: u32,
    pub lock_mode: Option<u32>,
    pub use_followers: bool,
    pub allow_inconsistent_reads: bool,
    pub channel_transport_version: ChannelTransportVersion,
    pub allow_with_spilling: bool,
    pub enable_arrow_format_at_datashard: bool,
    pub rate_limiter: Option<(String, String)>,
    /// Channel id -> proxy actor id for streamed results.
    pub result_channel_proxies: HashMap<ChannelId, String>,
}

impl GraphMeta {
    pub fn snapshot_valid(&self) -> bool {
        self.snapshot.is_some_and(|s| s.step != 0 || s.tx_id != 0)
    }
}

pub struct TasksGraph {
    stages: BTreeMap<StageId, StageInfo>,
    tasks: Vec<Task>,
    channels: Vec<Channel>,
    meta: GraphMeta,
}

impl TasksGraph {
    pub fn new(meta: GraphMeta) -> Self {
        Self {
            stages: BTreeMap::new(),
            tasks: Vec::new(),
            channels: Vec::new(),
            meta,
        }
    }

    pub fn meta(&self) -> &GraphMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut GraphMeta {
        &mut self.meta
    }

    /// Registers a stage; returns false when the id is already taken.
    pub fn add_stage_info(&mut self, stage: StageInfo) -> bool {
        use std::collections::btree_map::Entry;
        match self.stages.entry(stage.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(stage);
                true
            }
        }
    }

    pub fn stage_info(&self, id: StageId) -> &StageInfo {
        self.stages
            .get(&id)
            .unwrap_or_else(|| panic!("unknown stage {}", id))
    }

    pub fn stage_info_mut(&mut self, id: StageId) -> &mut StageInfo {
        self.stages
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown stage {}", id))
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageInfo> {
        self.stages.values()
    }

    /// Adds a task to a stage, sized to the stage's input/output counts.
    /// Task ids start at one; id zero addresses the executer.
    pub fn add_task(&mut self, stage_id: StageId) -> TaskId {
        let id = self.tasks.len() as TaskId + 1;
        let stage = self
            .stages
            .get_mut(&stage_id)
            .unwrap_or_else(|| panic!("unknown stage {}", stage_id));
        self.tasks.push(Task {
            id,
            stage_id,
            inputs: vec![TaskInput::default(); stage.input_count],
            outputs: vec![TaskOutput::default(); stage.output_count],
            meta: TaskMeta::default(),
            compute_actor_id: None,
        });
        stage.tasks.push(id);
        id
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[(id - 1) as usize]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[(id - 1) as usize]
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn add_channel(&mut self) -> &mut Channel {
        let id = self.channels.len() as ChannelId + 1;
        self.channels.push(Channel {
            id,
            src_stage_id: StageId::new(0, 0),
            dst_stage_id: StageId::new(0, 0),
            src_task: 0,
            dst_task: 0,
            src_output_index: 0,
            dst_input_index: 0,
            in_memory: false,
        });
        self.channels.last_mut().unwrap()
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[(id - 1) as usize]
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::HashMap;

    use tidewave_common::types::{Datum, TypeId};

    use super::*;

    #[derive(Default)]
    pub struct MapParams {
        pub serialized: HashMap<String, Vec<u8>>,
        pub typed: HashMap<String, (TypeId, Datum)>,
    }

    impl QueryParamsProvider for MapParams {
        fn serialized_value(&self, name: &str) -> Option<Vec<u8>> {
            self.serialized.get(name).cloned()
        }

        fn typed_value(&self, name: &str) -> Option<(TypeId, Datum)> {
            self.typed.get(name).cloned()
        }
    }

    pub fn tx_data(body: PhyTx) -> TxData {
        TxData {
            body: Arc::new(body),
            params: Arc::new(MapParams::default()),
            tables: Arc::new(HashMap::new()),
        }
    }
}
