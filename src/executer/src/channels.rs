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

//! Channel wiring between the tasks of adjacent stages.

use std::sync::Arc;

use tidewave_common::catalog::TableKind;
use tidewave_common::types::TypeId;
use tidewave_pb::plan::{
    phy_cn_hash_shuffle, phy_connection, PhyCnSequencer, PhyCnStreamLookup, SortColumn, TableRef,
};
use tidewave_pb::task::{
    ColumnMeta, ColumnSequencerMeta, DefaultKind, SequencerSettings, StreamLookupSettings,
    TableMeta,
};

use crate::error::{ensure_graph, ensure_plan, BuildError, BuildResult};
use crate::graph::{HashFunc, StageId, TaskInputType, TaskOutputType, TasksGraph, Transform};

fn log_channel(channel: u64, from: u64, to: u64, kind: &str, spilling: bool) {
    tracing::debug!(
        channel,
        from,
        to,
        kind,
        spilling,
        "created channel between tasks"
    );
}

fn table_meta_from_ref(table: &TableRef, kind: TableKind) -> TableMeta {
    TableMeta {
        table_path: table.path.clone(),
        owner_id: table.owner_id,
        table_id: table.table_id,
        schema_version: table.schema_version,
        sys_view_info: String::new(),
        table_kind: kind as u32,
    }
}

/// Builds one channel and registers it on both endpoints. The origin output
/// becomes a `Map` output; callers with other output semantics stamp the
/// type themselves.
#[allow(clippy::too_many_arguments)]
fn build_channel_between_tasks(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_stage_id: StageId,
    origin_task_id: u64,
    target_task_id: u64,
    input_index: u32,
    output_index: u32,
    enable_spilling: bool,
    kind: &str,
) {
    let input_stage_output_count = graph.stage_info(input_stage_id).output_count;
    let in_memory = !enable_spilling || input_stage_output_count == 1;

    let channel_id = {
        let channel = graph.add_channel();
        channel.src_stage_id = input_stage_id;
        channel.dst_stage_id = stage_id;
        channel.src_task = origin_task_id;
        channel.src_output_index = output_index;
        channel.dst_task = target_task_id;
        channel.dst_input_index = input_index;
        channel.in_memory = in_memory;
        channel.id
    };

    {
        let target = graph.task_mut(target_task_id);
        target.inputs[input_index as usize].channels.push(channel_id);
    }
    {
        let origin = graph.task_mut(origin_task_id);
        let output = &mut origin.outputs[output_index as usize];
        output.output_type = TaskOutputType::Map;
        output.channels.push(channel_id);
    }

    log_channel(channel_id, origin_task_id, target_task_id, kind, !in_memory);
}

fn build_union_all_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    enable_spilling: bool,
) {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    let input_stage_output_count = graph.stage_info(input_stage_id).output_count;
    let in_memory = !enable_spilling || input_stage_output_count == 1;

    for &origin_task_id in &origin_tasks {
        for &target_task_id in &target_tasks {
            let channel_id = {
                let channel = graph.add_channel();
                channel.src_stage_id = input_stage_id;
                channel.dst_stage_id = stage_id;
                channel.src_task = origin_task_id;
                channel.src_output_index = output_index;
                channel.dst_task = target_task_id;
                channel.dst_input_index = input_index;
                channel.in_memory = in_memory;
                channel.id
            };

            graph.task_mut(target_task_id).inputs[input_index as usize]
                .channels
                .push(channel_id);
            let origin = graph.task_mut(origin_task_id);
            let output = &mut origin.outputs[output_index as usize];
            output.output_type = TaskOutputType::Map;
            output.channels.push(channel_id);

            log_channel(channel_id, origin_task_id, target_task_id, "UnionAll", !in_memory);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_hash_shuffle_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    key_columns: &[String],
    enable_spilling: bool,
    hash_kind: HashFunc,
) {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    let input_stage_output_count = graph.stage_info(input_stage_id).output_count;
    let in_memory = !enable_spilling || input_stage_output_count == 1;

    for &origin_task_id in &origin_tasks {
        {
            let origin = graph.task_mut(origin_task_id);
            origin.outputs[output_index as usize].output_type = TaskOutputType::HashPartition {
                key_columns: key_columns.to_vec(),
                partitions_count: target_tasks.len() as u32,
                hash_kind,
            };
        }

        for &target_task_id in &target_tasks {
            let channel_id = {
                let channel = graph.add_channel();
                channel.src_stage_id = input_stage_id;
                channel.dst_stage_id = stage_id;
                channel.src_task = origin_task_id;
                channel.src_output_index = output_index;
                channel.dst_task = target_task_id;
                channel.dst_input_index = input_index;
                channel.in_memory = in_memory;
                channel.id
            };

            graph.task_mut(target_task_id).inputs[input_index as usize]
                .channels
                .push(channel_id);
            graph.task_mut(origin_task_id).outputs[output_index as usize]
                .channels
                .push(channel_id);

            log_channel(channel_id, origin_task_id, target_task_id, "HashShuffle", !in_memory);
        }
    }
}

fn build_broadcast_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    enable_spilling: bool,
) {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    let input_stage_output_count = graph.stage_info(input_stage_id).output_count;
    let in_memory = !enable_spilling || input_stage_output_count == 1;

    for &origin_task_id in &origin_tasks {
        graph.task_mut(origin_task_id).outputs[output_index as usize].output_type =
            TaskOutputType::Broadcast;

        for &target_task_id in &target_tasks {
            let channel_id = {
                let channel = graph.add_channel();
                channel.src_stage_id = input_stage_id;
                channel.dst_stage_id = stage_id;
                channel.src_task = origin_task_id;
                channel.src_output_index = output_index;
                channel.dst_task = target_task_id;
                channel.dst_input_index = input_index;
                channel.in_memory = in_memory;
                channel.id
            };

            graph.task_mut(target_task_id).inputs[input_index as usize]
                .channels
                .push(channel_id);
            graph.task_mut(origin_task_id).outputs[output_index as usize]
                .channels
                .push(channel_id);

            log_channel(channel_id, origin_task_id, target_task_id, "Broadcast", !in_memory);
        }
    }
}

fn build_map_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    enable_spilling: bool,
) -> BuildResult<()> {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    ensure_graph!(
        origin_tasks.len() == target_tasks.len(),
        "map connection between stages {} and {} with unequal task counts ({} vs {})",
        input_stage_id,
        stage_id,
        origin_tasks.len(),
        target_tasks.len()
    );

    for (&origin_task_id, &target_task_id) in origin_tasks.iter().zip(target_tasks.iter()) {
        build_channel_between_tasks(
            graph,
            stage_id,
            input_stage_id,
            origin_task_id,
            target_task_id,
            input_index,
            output_index,
            enable_spilling,
            "Map",
        );
    }
    Ok(())
}

fn build_merge_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    sort_columns: Vec<SortColumn>,
) -> BuildResult<()> {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    ensure_graph!(
        origin_tasks.len() == target_tasks.len(),
        "merge connection between stages {} and {} with unequal task counts ({} vs {})",
        input_stage_id,
        stage_id,
        origin_tasks.len(),
        target_tasks.len()
    );

    for (&origin_task_id, &target_task_id) in origin_tasks.iter().zip(target_tasks.iter()) {
        // Merges never spill.
        build_channel_between_tasks(
            graph,
            stage_id,
            input_stage_id,
            origin_task_id,
            target_task_id,
            input_index,
            output_index,
            false,
            "Merge",
        );
        graph.task_mut(target_task_id).inputs[input_index as usize].input_type =
            TaskInputType::Merge {
                sort_columns: sort_columns.clone(),
            };
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_sequencer_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    sequencer: &PhyCnSequencer,
    enable_spilling: bool,
) -> BuildResult<()> {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    ensure_graph!(
        origin_tasks.len() == target_tasks.len(),
        "sequencer connection between stages {} and {} with unequal task counts",
        input_stage_id,
        stage_id
    );

    let table = sequencer
        .table
        .as_ref()
        .ok_or_else(|| BuildError::BadRequest("sequencer names no table".into()))?;

    let settings = {
        let stage_info = graph.stage_info(stage_id);
        let table_info = stage_info.meta.table_const_info.clone().ok_or_else(|| {
            BuildError::BadRequest(format!("no table metadata for sequencer over `{}`", table.path))
        })?;

        let auto_increment: std::collections::HashSet<_> =
            sequencer.auto_increment_columns.iter().cloned().collect();

        let mut columns = Vec::with_capacity(sequencer.columns.len());
        for column in &sequencer.columns {
            let column_info = table_info
                .column(column)
                .ok_or_else(|| BuildError::BadRequest(format!("unknown column: {}", column)))?;
            let mut column_proto = ColumnSequencerMeta {
                column: Some(ColumnMeta {
                    id: column_info.id,
                    name: column.clone(),
                    r#type: column_info.type_id.to_wire(),
                }),
                ..Default::default()
            };

            if auto_increment.contains(column) {
                if let Some((sequence_path, sequence_path_id)) = table_info.sequences.get(column) {
                    column_proto.default_from_sequence = Some(sequence_path.clone());
                    column_proto.default_from_sequence_path_id = Some(*sequence_path_id);
                    column_proto.default_kind = Some(DefaultKind::DefaultKindSequence as i32);
                } else {
                    let literal = table_info.default_from_literal.get(column).ok_or_else(|| {
                        BuildError::BadRequest(format!(
                            "auto-increment column `{}` has neither sequence nor literal default",
                            column
                        ))
                    })?;
                    column_proto.default_from_literal = Some(literal.clone());
                    column_proto.default_kind = Some(DefaultKind::DefaultKindLiteral as i32);
                }
            }
            columns.push(column_proto);
        }

        Arc::new(SequencerSettings {
            table: Some(table_meta_from_ref(table, stage_info.meta.table_kind)),
            database: graph.meta().database.clone(),
            columns,
        })
    };

    let transform = Transform {
        type_name: "SequencerInputTransformer".to_owned(),
        input_type: sequencer.input_type.clone(),
        output_type: sequencer.output_type.clone(),
    };

    for (&origin_task_id, &target_task_id) in origin_tasks.iter().zip(target_tasks.iter()) {
        build_channel_between_tasks(
            graph,
            stage_id,
            input_stage_id,
            origin_task_id,
            target_task_id,
            input_index,
            output_index,
            enable_spilling,
            "Sequencer/Map",
        );
        let input = &mut graph.task_mut(target_task_id).inputs[input_index as usize];
        input.meta.sequencer_settings = Some(settings.clone());
        input.transform = Some(transform.clone());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_stream_lookup_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    stream_lookup: &PhyCnStreamLookup,
    enable_spilling: bool,
) -> BuildResult<()> {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    ensure_graph!(
        origin_tasks.len() == target_tasks.len(),
        "stream-lookup connection between stages {} and {} with unequal task counts",
        input_stage_id,
        stage_id
    );

    let table = stream_lookup
        .table
        .as_ref()
        .ok_or_else(|| BuildError::BadRequest("stream lookup names no table".into()))?;

    let settings = {
        let stage_info = graph.stage_info(stage_id);
        let table_info = stage_info.meta.table_const_info.clone().ok_or_else(|| {
            BuildError::BadRequest(format!(
                "no table metadata for stream lookup over `{}`",
                table.path
            ))
        })?;

        let column_to_proto = |name: &str| -> BuildResult<ColumnMeta> {
            let column_info = table_info
                .column(name)
                .ok_or_else(|| BuildError::BadRequest(format!("unknown column: {}", name)))?;
            Ok(ColumnMeta {
                id: column_info.id,
                name: name.to_owned(),
                r#type: column_info.type_id.to_wire(),
            })
        };

        let mut key_columns = Vec::with_capacity(table_info.key_columns.len());
        for key_column in &table_info.key_columns {
            key_columns.push(column_to_proto(key_column)?);
        }

        let mut lookup_key_columns = Vec::with_capacity(stream_lookup.key_columns.len());
        for key_column in &stream_lookup.key_columns {
            column_to_proto(key_column)?;
            lookup_key_columns.push(key_column.clone());
        }

        let mut columns = Vec::with_capacity(stream_lookup.columns.len());
        for column in &stream_lookup.columns {
            columns.push(column_to_proto(column)?);
        }

        Arc::new(StreamLookupSettings {
            table: Some(table_meta_from_ref(table, stage_info.meta.table_kind)),
            key_columns,
            lookup_key_columns,
            columns,
            lookup_strategy: stream_lookup.lookup_strategy,
            keep_rows_order: stream_lookup.keep_rows_order,
            allow_null_keys_prefix_size: stream_lookup.allow_null_keys_prefix_size,
            allow_use_followers: stream_lookup.is_table_immutable,
            is_table_immutable: stream_lookup.is_table_immutable,
            ..Default::default()
        })
    };

    let transform = Transform {
        type_name: "StreamLookupInputTransformer".to_owned(),
        input_type: stream_lookup.lookup_keys_type.clone(),
        output_type: stream_lookup.result_type.clone(),
    };

    for (&origin_task_id, &target_task_id) in origin_tasks.iter().zip(target_tasks.iter()) {
        build_channel_between_tasks(
            graph,
            stage_id,
            input_stage_id,
            origin_task_id,
            target_task_id,
            input_index,
            output_index,
            enable_spilling,
            "StreamLookup/Map",
        );
        let input = &mut graph.task_mut(target_task_id).inputs[input_index as usize];
        input.meta.stream_lookup_settings = Some(settings.clone());
        input.transform = Some(transform.clone());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_parallel_union_all_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    input_index: u32,
    input_stage_id: StageId,
    output_index: u32,
    enable_spilling: bool,
    next_target_cursor: &mut usize,
) -> BuildResult<()> {
    let origin_tasks = graph.stage_info(input_stage_id).tasks.clone();
    let target_tasks = graph.stage_info(stage_id).tasks.clone();
    ensure_graph!(!target_tasks.is_empty(), "parallel-union-all into an empty stage {}", stage_id);
    ensure_graph!(
        *next_target_cursor < target_tasks.len(),
        "parallel-union-all cursor out of range for stage {}",
        stage_id
    );

    for &origin_task_id in &origin_tasks {
        let target_task_id = target_tasks[*next_target_cursor];
        build_channel_between_tasks(
            graph,
            stage_id,
            input_stage_id,
            origin_task_id,
            target_task_id,
            input_index,
            output_index,
            enable_spilling,
            "ParallelUnionAll/Map",
        );
        *next_target_cursor = (*next_target_cursor + 1) % target_tasks.len();
    }
    Ok(())
}

/// Wires all inputs of one stage, after its tasks (and the tasks of every
/// upstream stage) exist.
pub fn build_stage_channels(
    graph: &mut TasksGraph,
    stage_id: StageId,
    enable_spilling: bool,
    enable_shuffle_elimination: bool,
) -> BuildResult<()> {
    let tx_body = graph.stage_info(stage_id).meta.tx.body.clone();
    let stage = &tx_body.stages[stage_id.stage_idx as usize];

    if stage.is_effects_stage && stage.sinks.is_empty() {
        ensure_graph!(
            graph.stage_info(stage_id).output_count == 1,
            "effects stage {} with {} outputs",
            stage_id,
            graph.stage_info(stage_id).output_count
        );
        let tasks = graph.stage_info(stage_id).tasks.clone();
        for task_id in tasks {
            graph.task_mut(task_id).outputs[0].output_type = TaskOutputType::Effects;
        }
    }

    let mut has_map = false;
    let is_fused_with_scan_stage = graph.stage_info(stage_id).meta.table_const_info.is_some();
    let mut hash_params = graph
        .stage_info(stage_id)
        .meta
        .column_shard_hash_v1_params
        .clone();

    // The task-index mapping can already be set for a stage fused with a
    // scan; hash partitioning derives the column-shard parameters from there.
    if enable_shuffle_elimination && !is_fused_with_scan_stage {
        for (input_index, input) in stage.inputs.iter().enumerate() {
            let origin_stage_id = StageId::new(stage_id.tx_idx, input.stage_index);
            let output_idx = input.output_index;
            hash_params = graph
                .stage_info(origin_stage_id)
                .meta
                .column_shard_hash_v1_params(output_idx)
                .clone();
            let is_map = matches!(input.r#type, Some(phy_connection::Type::Map(_)));
            if is_map || input_index == stage.inputs.len() - 1 {
                tracing::debug!(
                    origin = %origin_stage_id,
                    output_idx,
                    stage = %stage_id,
                    key_types = %hash_params.key_types_to_string(),
                    "chose output to propagate through input stages"
                );
            }
            if is_map {
                // A stage has at most one map connection, and column-shard
                // hash partitioning must shuffle on exactly that mapping.
                has_map = true;
                break;
            }
        }
    }

    // A stage that doesn't inherit parallelism gets the trivial mapping.
    let stage_task_count = graph.stage_info(stage_id).tasks.len();
    if enable_shuffle_elimination
        && !has_map
        && !is_fused_with_scan_stage
        && stage_task_count > 0
        && !stage.inputs.is_empty()
    {
        hash_params.source_shard_count = stage_task_count as u64;
        hash_params.task_index_by_hash =
            Some(Arc::new((0..stage_task_count as u64).collect::<Vec<_>>()));

        for input in &stage.inputs {
            let Some(phy_connection::Type::HashShuffle(hash_shuffle)) = &input.r#type else {
                continue;
            };
            let Some(phy_cn_hash_shuffle::HashKind::ColumnShardHashV1(column_shard)) =
                &hash_shuffle.hash_kind
            else {
                continue;
            };

            let mut key_types = Vec::with_capacity(column_shard.key_column_types.len());
            for type_id in &column_shard.key_column_types {
                let ty = TypeId::from_wire(*type_id).ok_or_else(|| {
                    BuildError::BadRequest(format!("unknown key column type id {}", type_id))
                })?;
                key_types.push(ty);
            }
            hash_params.source_table_key_column_types = Some(Arc::new(key_types));
            break;
        }
    }

    graph
        .stage_info_mut(stage_id)
        .meta
        .column_shard_hash_v1_params = hash_params.clone();

    let mut next_target_cursor = 0usize;
    for input in &stage.inputs {
        let input_idx = input.input_index;
        let input_stage_id = StageId::new(stage_id.tx_idx, input.stage_index);
        let output_idx = input.output_index;

        match &input.r#type {
            Some(phy_connection::Type::UnionAll(_)) => {
                build_union_all_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    enable_spilling,
                );
            }
            Some(phy_connection::Type::HashShuffle(hash_shuffle)) => {
                let force_spilling = hash_shuffle.use_spilling;
                let hash_kind = match &hash_shuffle.hash_kind {
                    Some(phy_cn_hash_shuffle::HashKind::HashV1(_)) => HashFunc::HashV1,
                    Some(phy_cn_hash_shuffle::HashKind::HashV2(_)) => HashFunc::HashV2,
                    Some(phy_cn_hash_shuffle::HashKind::ColumnShardHashV1(_)) => {
                        ensure_plan!(
                            enable_shuffle_elimination,
                            "shuffle elimination is off, but ColumnShardHashV1 detected"
                        );
                        let types_len = hash_params
                            .source_table_key_column_types
                            .as_ref()
                            .map_or(0, |t| t.len());
                        ensure_plan!(
                            types_len == hash_shuffle.key_columns.len(),
                            "hash-shuffle key columns and key types arity mismatch: types {} for columns [{}]",
                            hash_params.key_types_to_string(),
                            hash_shuffle.key_columns.join(",")
                        );
                        tracing::debug!(
                            origin = %input_stage_id,
                            stage = %stage_id,
                            key_types = %hash_params.key_types_to_string(),
                            "propagating column-shard hash params to input stage"
                        );
                        graph
                            .stage_info_mut(input_stage_id)
                            .meta
                            .hash_params_by_output
                            .insert(output_idx, hash_params.clone());
                        HashFunc::ColumnShardHashV1
                    }
                    None => {
                        return Err(BuildError::BadRequest(
                            "undefined type of hash for shuffle".into(),
                        ))
                    }
                };

                build_hash_shuffle_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    &hash_shuffle.key_columns,
                    enable_spilling || force_spilling,
                    hash_kind,
                );
            }
            Some(phy_connection::Type::Broadcast(_)) => {
                build_broadcast_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    enable_spilling,
                );
            }
            Some(phy_connection::Type::Map(_)) => {
                build_map_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    enable_spilling,
                )?;
            }
            Some(phy_connection::Type::Merge(merge)) => {
                build_merge_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    merge.sort_columns.clone(),
                )?;
            }
            Some(phy_connection::Type::Sequencer(sequencer)) => {
                build_sequencer_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    sequencer,
                    enable_spilling,
                )?;
            }
            Some(phy_connection::Type::StreamLookup(stream_lookup)) => {
                build_stream_lookup_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    stream_lookup,
                    enable_spilling,
                )?;
            }
            Some(phy_connection::Type::ParallelUnionAll(_)) => {
                build_parallel_union_all_channels(
                    graph,
                    stage_id,
                    input_idx,
                    input_stage_id,
                    output_idx,
                    enable_spilling,
                    &mut next_target_cursor,
                )?;
            }
            None => {
                return Err(BuildError::BadRequest(format!(
                    "unexpected stage input type in stage {}",
                    stage_id
                )))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tidewave_pb::plan::{PhyConnection, PhyStage, PhyTx};

    use super::*;
    use crate::graph::test_utils::tx_data;
    use crate::graph::{GraphMeta, StageInfo, StageInfoMeta};

    fn stage_with_inputs(inputs: Vec<PhyConnection>, outputs_count: u32) -> PhyStage {
        PhyStage {
            inputs,
            outputs_count,
            stage_guid: "test-stage".to_owned(),
            ..Default::default()
        }
    }

    fn hash_shuffle_input(
        stage_index: u32,
        key_columns: &[&str],
        hash_kind: phy_cn_hash_shuffle::HashKind,
    ) -> PhyConnection {
        PhyConnection {
            input_index: 0,
            stage_index,
            output_index: 0,
            r#type: Some(phy_connection::Type::HashShuffle(
                tidewave_pb::plan::PhyCnHashShuffle {
                    key_columns: key_columns.iter().map(|s| s.to_string()).collect(),
                    use_spilling: false,
                    hash_kind: Some(hash_kind),
                },
            )),
        }
    }

    fn build_two_stage_graph(
        input: PhyConnection,
        upstream_tasks: usize,
        downstream_tasks: usize,
        upstream_outputs: u32,
    ) -> (TasksGraph, StageId, StageId) {
        let tx = tx_data(PhyTx {
            stages: vec![
                stage_with_inputs(vec![], upstream_outputs),
                stage_with_inputs(vec![input], 1),
            ],
            ..Default::default()
        });

        let mut graph = TasksGraph::new(GraphMeta::default());
        let s0 = StageId::new(0, 0);
        let s1 = StageId::new(0, 1);
        assert!(graph.add_stage_info(StageInfo::new(s0, 0, upstream_outputs as usize, StageInfoMeta::new(tx.clone()))));
        assert!(graph.add_stage_info(StageInfo::new(s1, 1, 1, StageInfoMeta::new(tx))));
        for _ in 0..upstream_tasks {
            graph.add_task(s0);
        }
        for _ in 0..downstream_tasks {
            graph.add_task(s1);
        }
        (graph, s0, s1)
    }

    #[test]
    fn test_hash_shuffle_builds_full_mesh() {
        let input = hash_shuffle_input(0, &["k"], phy_cn_hash_shuffle::HashKind::HashV1(Default::default()));
        let (mut graph, s0, s1) = build_two_stage_graph(input, 3, 2, 1);

        build_stage_channels(&mut graph, s1, false, false).unwrap();

        assert_eq!(graph.channels().len(), 6);
        for channel in graph.channels() {
            assert_eq!(channel.src_stage_id, s0);
            assert_eq!(channel.dst_stage_id, s1);
            assert_eq!(graph.task(channel.src_task).stage_id, channel.src_stage_id);
            assert_eq!(graph.task(channel.dst_task).stage_id, channel.dst_stage_id);
            assert!(channel.in_memory);
        }

        for &task_id in &graph.stage_info(s1).tasks {
            assert_eq!(graph.task(task_id).inputs[0].channels.len(), 3);
        }
        for &task_id in &graph.stage_info(s0).tasks {
            let output = &graph.task(task_id).outputs[0];
            assert_eq!(output.channels.len(), 2);
            assert_eq!(
                output.output_type,
                TaskOutputType::HashPartition {
                    key_columns: vec!["k".to_owned()],
                    partitions_count: 2,
                    hash_kind: HashFunc::HashV1,
                }
            );
        }
    }

    #[test]
    fn test_single_output_upstream_is_always_in_memory() {
        let input = PhyConnection {
            input_index: 0,
            stage_index: 0,
            output_index: 0,
            r#type: Some(phy_connection::Type::UnionAll(Default::default())),
        };
        let (mut graph, _, s1) = build_two_stage_graph(input, 2, 1, 1);

        // Spilling is enabled, but a single-output upstream stays in memory.
        build_stage_channels(&mut graph, s1, true, false).unwrap();
        assert!(graph.channels().iter().all(|c| c.in_memory));
    }

    #[test]
    fn test_multi_output_upstream_spills() {
        let input = PhyConnection {
            input_index: 0,
            stage_index: 0,
            output_index: 0,
            r#type: Some(phy_connection::Type::UnionAll(Default::default())),
        };
        let (mut graph, _, s1) = build_two_stage_graph(input, 2, 1, 2);

        build_stage_channels(&mut graph, s1, true, false).unwrap();
        assert!(graph.channels().iter().all(|c| !c.in_memory));
    }

    #[test]
    fn test_column_shard_hash_arity_mismatch_fails() {
        let input = hash_shuffle_input(
            0,
            &["a", "b"],
            phy_cn_hash_shuffle::HashKind::ColumnShardHashV1(
                tidewave_pb::plan::ColumnShardHashV1 {
                    key_column_types: vec![TypeId::Int64.to_wire()],
                },
            ),
        );
        let (mut graph, _, s1) = build_two_stage_graph(input, 2, 2, 1);

        let err = build_stage_channels(&mut graph, s1, false, true).unwrap_err();
        assert!(matches!(err, BuildError::BadRequest(_)), "got: {err}");
    }

    #[test]
    fn test_column_shard_hash_params_propagate_upstream() {
        let input = hash_shuffle_input(
            0,
            &["a"],
            phy_cn_hash_shuffle::HashKind::ColumnShardHashV1(
                tidewave_pb::plan::ColumnShardHashV1 {
                    key_column_types: vec![TypeId::Int64.to_wire()],
                },
            ),
        );
        let (mut graph, s0, s1) = build_two_stage_graph(input, 2, 3, 1);

        build_stage_channels(&mut graph, s1, false, true).unwrap();

        // The consuming stage got the trivial task-index mapping sized to
        // its own parallelism, and pushed it to the producer's output.
        let params = graph.stage_info(s0).meta.column_shard_hash_v1_params(0);
        assert_eq!(params.source_shard_count, 3);
        assert_eq!(
            params.task_index_by_hash.as_ref().unwrap().as_ref(),
            &vec![0, 1, 2]
        );
        assert_eq!(
            params.source_table_key_column_types.as_ref().unwrap().as_ref(),
            &vec![TypeId::Int64]
        );
    }

    #[test]
    fn test_parallel_union_all_round_robin() {
        let input = PhyConnection {
            input_index: 0,
            stage_index: 0,
            output_index: 0,
            r#type: Some(phy_connection::Type::ParallelUnionAll(Default::default())),
        };
        let (mut graph, s0, s1) = build_two_stage_graph(input, 4, 3, 1);

        build_stage_channels(&mut graph, s1, false, false).unwrap();

        let targets: Vec<_> = graph
            .stage_info(s0)
            .tasks
            .iter()
            .map(|&origin| {
                let output = &graph.task(origin).outputs[0];
                assert_eq!(output.channels.len(), 1);
                graph.channel(output.channels[0]).dst_task
            })
            .collect();
        let downstream = graph.stage_info(s1).tasks.clone();
        assert_eq!(
            targets,
            vec![downstream[0], downstream[1], downstream[2], downstream[0]]
        );
    }

    #[test]
    fn test_map_requires_equal_task_counts() {
        let input = PhyConnection {
            input_index: 0,
            stage_index: 0,
            output_index: 0,
            r#type: Some(phy_connection::Type::Map(Default::default())),
        };
        let (mut graph, _, s1) = build_two_stage_graph(input, 3, 2, 1);
        build_stage_channels(&mut graph, s1, false, false).unwrap_err();
    }

    #[test]
    fn test_merge_never_spills() {
        let input = PhyConnection {
            input_index: 0,
            stage_index: 0,
            output_index: 0,
            r#type: Some(phy_connection::Type::Merge(tidewave_pb::plan::PhyCnMerge {
                sort_columns: vec![SortColumn {
                    column: "ts".to_owned(),
                    ascending: true,
                }],
            })),
        };
        let (mut graph, _, s1) = build_two_stage_graph(input, 2, 2, 2);

        // Even with spilling enabled and a multi-output upstream.
        build_stage_channels(&mut graph, s1, true, false).unwrap();
        assert!(graph.channels().iter().all(|c| c.in_memory));
        for &task_id in &graph.stage_info(s1).tasks {
            assert!(matches!(
                graph.task(task_id).inputs[0].input_type,
                TaskInputType::Merge { .. }
            ));
        }
    }
}
