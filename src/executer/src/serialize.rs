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

//! Projecting a frozen task onto the dispatch wire.

use tidewave_common::catalog::TableKind;
use tidewave_common::config::ChannelTransportVersion;
use tidewave_pb::task::{
    task_desc, task_input_desc, task_output_desc, task_transform, ChannelDesc, ColumnMeta,
    ColumnShardHashV1Params, ColumnWriteMeta, DataReadMeta, DataTaskMeta, DataTransportVersion,
    DataWriteMeta, Endpoint, HashPartitionOutput, MergeInput, OlapProgram, RangePartitionDesc,
    RangePartitionOutput, ScanReadMeta, ScanTaskMeta, SinkOutput, SourceInput, TableDataFormat,
    TableMeta, TaskDesc, TaskInputDesc, TaskOutputDesc, TaskTransform, UnionAllInput,
};

use crate::error::{ensure_graph, BuildError, BuildResult};
use crate::graph::{
    Channel, HashFunc, ScanReadKind, StageInfo, Task, TaskInput, TaskInputType, TaskOutput,
    TaskOutputType, TasksGraph,
};
use crate::olap::serialize_olap_parameters;

/// A channel is persistent when it connects two different shards.
pub fn is_cross_shard_channel(graph: &TasksGraph, channel: &Channel) -> bool {
    assert!(channel.src_task != 0);

    if channel.dst_task == 0 {
        return false;
    }

    let target_shard = graph.task(channel.dst_task).meta.shard_id.unwrap_or(0);
    if target_shard == 0 {
        return false;
    }
    let src_shard = graph.task(channel.src_task).meta.shard_id.unwrap_or(0);
    src_shard != 0 && target_shard != src_shard
}

fn fill_endpoint(task: &Task) -> Option<Endpoint> {
    use tidewave_pb::task::endpoint::Type;

    if let Some(actor_id) = &task.compute_actor_id {
        Some(Endpoint {
            r#type: Some(Type::ActorId(actor_id.clone())),
        })
    } else {
        task.meta.shard_id.map(|shard_id| Endpoint {
            r#type: Some(Type::TabletId(shard_id)),
        })
    }
}

fn transport_version(version: ChannelTransportVersion) -> DataTransportVersion {
    match version {
        ChannelTransportVersion::UvPickle1_0 => DataTransportVersion::DataTransportUvPickle10,
        ChannelTransportVersion::OobPickle1_0 => DataTransportVersion::DataTransportOobPickle10,
    }
}

fn fill_channel_desc(
    graph: &TasksGraph,
    channel: &Channel,
    enable_spilling: bool,
) -> BuildResult<ChannelDesc> {
    use tidewave_pb::task::endpoint::Type;

    ensure_graph!(channel.src_task != 0, "channel {} without a source task", channel.id);
    let src_task = graph.task(channel.src_task);

    let dst_endpoint = if channel.dst_task != 0 {
        fill_endpoint(graph.task(channel.dst_task))
    } else if !graph.meta().result_channel_proxies.is_empty() {
        let proxy = graph
            .meta()
            .result_channel_proxies
            .get(&channel.id)
            .ok_or_else(|| {
                BuildError::Internal(format!("no result proxy for channel {}", channel.id))
            })?;
        Some(Endpoint {
            r#type: Some(Type::ActorId(proxy.clone())),
        })
    } else {
        // For non-stream execution, collect results in the executer and
        // forward with the response.
        Some(Endpoint {
            r#type: Some(Type::ActorId(graph.meta().executer_actor_id.clone())),
        })
    };

    Ok(ChannelDesc {
        id: channel.id,
        src_stage_id: channel.src_stage_id.stage_idx,
        dst_stage_id: channel.dst_stage_id.stage_idx,
        src_task_id: channel.src_task,
        dst_task_id: channel.dst_task,
        src_endpoint: fill_endpoint(src_task),
        dst_endpoint,
        is_persistent: is_cross_shard_channel(graph, channel),
        in_memory: channel.in_memory,
        enable_spilling,
        transport_version: transport_version(graph.meta().channel_transport_version) as i32,
    })
}

fn fill_table_meta(stage_info: &StageInfo) -> TableMeta {
    let meta = &stage_info.meta;
    let table_id = meta.table_id.unwrap_or_default();
    TableMeta {
        table_path: meta.table_path.clone().unwrap_or_default(),
        owner_id: table_id.owner_id,
        table_id: table_id.local_id,
        schema_version: table_id.schema_version,
        sys_view_info: meta
            .table_const_info
            .as_ref()
            .and_then(|info| info.sys_view_info.clone())
            .unwrap_or_default(),
        table_kind: meta.table_kind as u32,
    }
}

fn fill_data_task_meta(stage_info: &StageInfo, task: &Task) -> DataTaskMeta {
    let mut proto = DataTaskMeta {
        table: Some(fill_table_meta(stage_info)),
        ..Default::default()
    };

    if let Some(reads) = &task.meta.reads {
        for read in reads {
            proto.reads.push(DataReadMeta {
                range: Some(read.ranges.serialize_to_data_task()),
                columns: read
                    .columns
                    .iter()
                    .map(|column| ColumnMeta {
                        id: column.id,
                        name: column.name.clone(),
                        r#type: column.type_id.to_wire(),
                    })
                    .collect(),
                items_limit: task.meta.read_flags.items_limit,
                reverse: task.meta.read_flags.reverse,
            });
        }
    }

    if let Some(writes) = &task.meta.writes {
        proto.writes = Some(DataWriteMeta {
            range: Some(writes.ranges.serialize_to_data_task()),
            columns: writes
                .column_writes
                .values()
                .map(|write| ColumnWriteMeta {
                    column: write.column.as_ref().map(|column| ColumnMeta {
                        id: column.id,
                        name: column.name.clone(),
                        r#type: column.type_id.to_wire(),
                    }),
                    max_value_size_bytes: write.max_value_size_bytes,
                })
                .collect(),
            is_pure_erase_op: writes.is_pure_erase_op,
        });
    }

    proto
}

fn fill_scan_task_meta(
    graph: &TasksGraph,
    stage_info: &StageInfo,
    task: &Task,
) -> BuildResult<ScanTaskMeta> {
    let meta = &stage_info.meta;
    let table_info = meta.table_const_info.as_ref().ok_or_else(|| {
        BuildError::Internal(format!("scan task of stage {} without table info", stage_info.id))
    })?;

    let mut proto = ScanTaskMeta {
        table: Some(fill_table_meta(stage_info)),
        ..Default::default()
    };

    for key_column in &table_info.key_columns {
        let column = table_info.column(key_column).ok_or_else(|| {
            BuildError::Internal(format!("unknown key column `{}`", key_column))
        })?;
        proto.key_column_types.push(column.type_id.to_wire());
    }
    proto.skip_null_keys = meta.skip_null_keys.clone();

    proto.data_format = match meta.table_kind {
        TableKind::Unknown | TableKind::External | TableKind::SysView => {
            TableDataFormat::FormatCellvec as i32
        }
        TableKind::Datashard => {
            if graph.meta().enable_arrow_format_at_datashard {
                TableDataFormat::FormatArrow as i32
            } else {
                TableDataFormat::FormatCellvec as i32
            }
        }
        TableKind::Olap => TableDataFormat::FormatArrow as i32,
    };

    ensure_graph!(
        task.meta.writes.is_none(),
        "scan task {} of stage {} carries writes",
        task.id,
        stage_info.id
    );

    let reads = task.meta.reads.as_deref().unwrap_or(&[]);
    if !reads.is_empty() {
        let flags = &task.meta.read_flags;
        proto.reverse = flags.reverse;
        proto.optional_sorting = flags.sorting;
        proto.items_limit = flags.items_limit;
        proto.enable_shards_sequential_scan = task.meta.enable_shards_sequential_scan;
        proto.read_type = match flags.read_kind {
            ScanReadKind::Rows => tidewave_pb::task::ScanReadType::Rows as i32,
            ScanReadKind::Blocks => tidewave_pb::task::ScanReadType::Blocks as i32,
        };
        proto.group_by_column_names = flags.group_by_column_names.clone();

        for column_type in &flags.result_column_types {
            proto.result_columns.push(ColumnMeta {
                id: 0,
                name: String::new(),
                r#type: column_type.to_wire(),
            });
        }

        if meta.table_kind == TableKind::Olap {
            let olap = flags.olap_program.as_ref().ok_or_else(|| {
                BuildError::Internal(format!("olap stage {} without a program", stage_info.id))
            })?;
            let stage = meta.stage(stage_info.id);
            let (schema, parameters) = serialize_olap_parameters(
                &stage.program_parameters,
                &olap.parameter_names,
                meta.tx.params.as_ref(),
            )?;
            proto.olap_program = Some(OlapProgram {
                program: olap.program.clone(),
                parameters_schema: schema,
                parameters,
            });
        } else {
            ensure_graph!(
                flags.olap_program.is_none(),
                "non-olap stage {} carries an olap program",
                stage_info.id
            );
        }

        for column in &reads[0].columns {
            proto.columns.push(ColumnMeta {
                id: column.id,
                name: column.name.clone(),
                r#type: column.type_id.to_wire(),
            });
        }
    }

    for read in reads {
        ensure_graph!(
            read.columns.len() == proto.columns.len(),
            "reads of task {} differ in column sets",
            task.id
        );
        for (column, proto_column) in read.columns.iter().zip(proto.columns.iter()) {
            ensure_graph!(
                column.id == proto_column.id && column.type_id.to_wire() == proto_column.r#type,
                "reads of task {} differ in column `{}`",
                task.id,
                column.name
            );
        }
        proto.reads.push(ScanReadMeta {
            shard_id: read.shard_id,
            key_ranges: read.ranges.serialize_to_scan_task(),
        });
    }

    Ok(proto)
}

fn fill_task_meta(
    graph: &TasksGraph,
    stage_info: &StageInfo,
    task: &Task,
) -> BuildResult<Option<task_desc::Meta>> {
    if task.meta.shard_id.is_some() && (task.meta.reads.is_some() || task.meta.writes.is_some()) {
        Ok(Some(task_desc::Meta::Data(fill_data_task_meta(
            stage_info, task,
        ))))
    } else if task.meta.scan_task || stage_info.meta.is_sys_view() {
        Ok(Some(task_desc::Meta::Scan(fill_scan_task_meta(
            graph, stage_info, task,
        )?)))
    } else {
        Ok(None)
    }
}

fn fill_output_desc(
    graph: &TasksGraph,
    output: &TaskOutput,
    output_idx: u32,
    enable_spilling: bool,
    stage_info: &StageInfo,
) -> BuildResult<TaskOutputDesc> {
    let output_type = match &output.output_type {
        TaskOutputType::Map => {
            ensure_graph!(
                output.channels.len() == 1,
                "map output with {} channels",
                output.channels.len()
            );
            task_output_desc::Type::Map(Default::default())
        }
        TaskOutputType::HashPartition {
            key_columns,
            partitions_count,
            hash_kind,
        } => {
            use tidewave_pb::task::hash_partition_output::HashKind;

            let hash_kind = match hash_kind {
                HashFunc::HashV1 => HashKind::HashV1(Default::default()),
                HashFunc::HashV2 => HashKind::HashV2(Default::default()),
                HashFunc::ColumnShardHashV1 => {
                    let params = stage_info.meta.column_shard_hash_v1_params(output_idx);
                    tracing::debug!(
                        stage = %stage_info.id,
                        key_types = %params.key_types_to_string(),
                        key_columns = %key_columns.join(","),
                        "filling column-shard hash params for runtime"
                    );
                    ensure_graph!(
                        params.source_shard_count != 0,
                        "shard count for ColumnShardHashV1 shuffle can't be zero"
                    );
                    let task_index_by_hash =
                        params.task_index_by_hash.as_ref().ok_or_else(|| {
                            BuildError::Internal(
                                "task index mapping for ColumnShardHashV1 wasn't propagated"
                                    .into(),
                            )
                        })?;
                    let key_types =
                        params.source_table_key_column_types.as_ref().ok_or_else(|| {
                            BuildError::Internal(
                                "key column types for ColumnShardHashV1 weren't propagated".into(),
                            )
                        })?;
                    ensure_graph!(
                        key_types.len() == key_columns.len(),
                        "hash-shuffle key columns and key types arity mismatch at output {}: types {} for columns [{}]",
                        output_idx,
                        params.key_types_to_string(),
                        key_columns.join(",")
                    );

                    HashKind::ColumnShardHashV1(ColumnShardHashV1Params {
                        shard_count: params.source_shard_count,
                        key_column_types: key_types.iter().map(|t| t.to_wire()).collect(),
                        task_index_by_hash: task_index_by_hash.as_ref().clone(),
                    })
                }
            };

            task_output_desc::Type::HashPartition(HashPartitionOutput {
                key_columns: key_columns.clone(),
                partitions_count: *partitions_count,
                hash_kind: Some(hash_kind),
            })
        }
        TaskOutputType::RangePartition { key_columns } => {
            let partitions = output
                .shard_partitions
                .iter()
                .map(|(channel_id, range)| RangePartitionDesc {
                    end_key_prefix: range.end_key_prefix.clone(),
                    is_inclusive: range.is_inclusive,
                    is_point: range.is_point,
                    channel_id: *channel_id,
                })
                .collect();
            task_output_desc::Type::RangePartition(RangePartitionOutput {
                key_columns: key_columns.clone(),
                partitions,
            })
        }
        TaskOutputType::Broadcast => task_output_desc::Type::Broadcast(Default::default()),
        TaskOutputType::Effects => task_output_desc::Type::Effects(Default::default()),
        TaskOutputType::Sink {
            sink_type,
            settings,
        } => task_output_desc::Type::Sink(SinkOutput {
            sink_type: sink_type.clone(),
            settings: settings.clone(),
        }),
        TaskOutputType::Undefined => {
            return Err(BuildError::Internal(format!(
                "unexpected undefined output type in stage {}",
                stage_info.id
            )))
        }
    };

    let mut desc = TaskOutputDesc {
        r#type: Some(output_type),
        channels: Vec::with_capacity(output.channels.len()),
    };
    for channel_id in &output.channels {
        desc.channels
            .push(fill_channel_desc(graph, graph.channel(*channel_id), enable_spilling)?);
    }
    Ok(desc)
}

fn fill_input_desc(
    graph: &TasksGraph,
    input: &TaskInput,
    serialize_async_io_settings: bool,
    enable_metering: &mut bool,
) -> BuildResult<TaskInputDesc> {
    let meta = graph.meta();

    let input_type = match &input.input_type {
        TaskInputType::Source => {
            let mut source = SourceInput {
                source_type: input.source_type.clone().unwrap_or_default(),
                watermarks_mode: input.watermarks_mode as i32,
                settings: None,
            };

            if let Some(settings) = &input.meta.source_settings {
                *enable_metering = true;
                ensure_graph!(settings.table.is_some(), "source settings without a table");
                let is_table_immutable = settings.is_table_immutable;

                let mut settings = settings.as_ref().clone();
                if meta.snapshot_valid() && !is_table_immutable {
                    settings.snapshot = meta.snapshot;
                }
                if meta.use_followers || is_table_immutable {
                    settings.use_followers = true;
                }
                if is_table_immutable {
                    settings.allow_inconsistent_reads = true;
                }
                // Read-your-writes: a pending lock travels with the source.
                if let Some(lock_tx_id) = meta.lock_tx_id {
                    if !is_table_immutable {
                        settings.lock_tx_id = Some(lock_tx_id);
                        settings.lock_node_id = meta.lock_node_id;
                        settings.lock_mode = meta.lock_mode;
                    }
                }

                if serialize_async_io_settings {
                    source.settings = Some(tidewave_pb::task::source_input::Settings::ReadRanges(
                        settings,
                    ));
                }
            } else if let Some(external) = &input.meta.external_source_settings {
                source.settings = Some(tidewave_pb::task::source_input::Settings::External(
                    external.clone(),
                ));
            } else {
                return Err(BuildError::Internal("source input without settings".into()));
            }

            task_input_desc::Type::Source(source)
        }
        TaskInputType::UnionAll => task_input_desc::Type::UnionAll(UnionAllInput::default()),
        TaskInputType::Merge { sort_columns } => task_input_desc::Type::Merge(MergeInput {
            sort_columns: sort_columns.clone(),
        }),
    };

    let mut desc = TaskInputDesc {
        r#type: Some(input_type),
        channels: Vec::with_capacity(input.channels.len()),
        transform: None,
    };
    for channel_id in &input.channels {
        desc.channels
            .push(fill_channel_desc(graph, graph.channel(*channel_id), false)?);
    }

    if let Some(transform) = &input.transform {
        let mut transform_proto = TaskTransform {
            r#type: transform.type_name.clone(),
            input_type: transform.input_type.clone(),
            output_type: transform.output_type.clone(),
            settings: None,
        };

        if let Some(settings) = &input.meta.stream_lookup_settings {
            *enable_metering = true;
            let is_table_immutable = settings.is_table_immutable;

            let mut settings = settings.as_ref().clone();
            if meta.snapshot_valid() && !is_table_immutable {
                settings.snapshot = meta.snapshot;
            } else if meta.allow_inconsistent_reads || is_table_immutable {
                settings.allow_inconsistent_reads = true;
            } else {
                return Err(BuildError::Precondition(
                    "expected valid snapshot or enabled inconsistent read mode".into(),
                ));
            }

            if let Some(lock_tx_id) = meta.lock_tx_id {
                if !is_table_immutable {
                    settings.lock_tx_id = Some(lock_tx_id);
                    settings.lock_node_id = meta.lock_node_id;
                }
            }
            if meta.lock_mode.is_some() && !is_table_immutable {
                settings.lock_mode = meta.lock_mode;
            }

            transform_proto.settings = Some(task_transform::Settings::StreamLookup(settings));
        } else if let Some(settings) = &input.meta.sequencer_settings {
            transform_proto.settings = Some(task_transform::Settings::Sequencer(
                settings.as_ref().clone(),
            ));
        }

        desc.transform = Some(transform_proto);
    }

    Ok(desc)
}

/// Projects one task into its wire form for dispatch.
pub fn serialize_task_to_proto(
    graph: &TasksGraph,
    task: &Task,
    serialize_async_io_settings: bool,
) -> BuildResult<TaskDesc> {
    let stage_info = graph.stage_info(task.stage_id);
    let mut result = TaskDesc {
        id: task.id,
        stage_id: stage_info.id.stage_idx,
        executer_actor_id: graph.meta().executer_actor_id.clone(),
        enable_spilling: false,
        ..Default::default()
    };

    let mut enable_metering = false;

    for (name, value) in &task.meta.task_params {
        result.task_params.insert(name.clone(), value.clone());
    }
    for read_range in &task.meta.read_ranges {
        result.read_ranges.push(read_range.clone());
    }
    for (name, value) in &task.meta.secure_params {
        result.secure_params.insert(name.clone(), value.clone());
    }

    for input in &task.inputs {
        result.inputs.push(fill_input_desc(
            graph,
            input,
            serialize_async_io_settings,
            &mut enable_metering,
        )?);
    }

    let enable_spilling = task.outputs.len() > 1 && graph.meta().allow_with_spilling;
    for (output_idx, output) in task.outputs.iter().enumerate() {
        result.outputs.push(fill_output_desc(
            graph,
            output,
            output_idx as u32,
            enable_spilling,
            stage_info,
        )?);
    }

    let stage = stage_info.meta.stage(stage_info.id);
    result.program = stage.program.clone();

    for param_name in &stage.program_parameters {
        let value = match task.meta.shard_id {
            Some(shard_id) => stage_info.meta.tx.params.shard_param(shard_id, param_name),
            None => stage_info.meta.tx.params.serialized_value(param_name),
        };
        let value = value.ok_or_else(|| {
            BuildError::Internal(format!("missing value for parameter `{}`", param_name))
        })?;
        result.parameters.insert(param_name.clone(), value);
    }

    if let Some((rate_limiter, resource)) = &graph.meta().rate_limiter {
        result.rate_limiter = rate_limiter.clone();
        result.rate_limiter_resource = resource.clone();
    }

    result.disable_metering = !enable_metering;
    result.meta = fill_task_meta(graph, stage_info, task)?;

    Ok(result)
}
