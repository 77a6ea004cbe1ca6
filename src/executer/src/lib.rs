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

//! Distributed-execution planning: turns a physical plan into a frozen
//! graph of stages, tasks and channels, then projects each task onto the
//! dispatch wire.

mod builder;
mod channels;
mod error;
mod graph;
mod key_range;
mod olap;
mod serialize;

pub use builder::{build_result_channels, fill_source_inputs, fill_stages};
pub use channels::build_stage_channels;
pub use error::{BuildError, BuildResult};
pub use graph::{
    Channel, ChannelId, ColumnShardHashV1Params, ColumnWrite, GraphMeta, HashFunc, IndexMeta,
    OlapProgramInfo, QueryParamsProvider, ReadFlags, ReadInfo, ScanReadKind,
    ShardPartitionRange, StageId, StageInfo, StageInfoMeta, Task, TaskId, TaskInput,
    TaskInputMeta, TaskInputType, TaskMeta, TaskOutput, TaskOutputType, TasksGraph, Transform,
    TxData, WriteInfo,
};
pub use key_range::{PointOrRange, SerializedTableRange, ShardKeyRanges};
pub use olap::serialize_olap_parameters;
pub use serialize::{is_cross_shard_channel, serialize_task_to_proto};
