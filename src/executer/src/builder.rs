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

//! Filling the graph's stages from the physical plan.

use std::collections::HashSet;

use tidewave_common::catalog::{ShardOperation, TableId, TableKind};
use tidewave_pb::plan::{
    phy_connection, phy_sink, phy_source, phy_table_operation, TableRef, TableSinkMode,
};

use crate::error::{ensure_graph, ensure_plan, BuildResult};
use crate::graph::{StageId, StageInfo, StageInfoMeta, TaskOutputType, TasksGraph, TxData};

fn make_table_id(table: &TableRef) -> TableId {
    TableId::new(table.owner_id, table.table_id, table.schema_version)
}

/// Classifies every stage of every transaction and registers it in the
/// graph: source/sink slots, table identity, shard operations.
pub fn fill_stages(graph: &mut TasksGraph, txs: &[TxData]) -> BuildResult<()> {
    for (tx_idx, tx) in txs.iter().enumerate() {
        for (stage_idx, stage) in tx.body.stages.iter().enumerate() {
            let stage_id = StageId::new(tx_idx as u32, stage_idx as u32);
            let mut meta = StageInfoMeta::new(tx.clone());

            let mut stage_sources_count = 0usize;
            for source in &stage.sources {
                match &source.r#type {
                    Some(phy_source::Type::ReadRangesSource(read_source)) => {
                        ensure_plan!(
                            source.input_index == 0,
                            "read-ranges source of stage {} is not at input 0",
                            stage_id
                        );
                        ensure_plan!(
                            stage.sources.len() == 1,
                            "stage {} has a read-ranges source among {} sources",
                            stage_id,
                            stage.sources.len()
                        );
                        let table = read_source
                            .table
                            .as_ref()
                            .ok_or_else(|| plan_err(format!("source of stage {} names no table", stage_id)))?;
                        meta.table_id = Some(make_table_id(table));
                        meta.table_path = Some(table.path.clone());
                        meta.shard_operations.insert(ShardOperation::Read);
                        meta.table_const_info =
                            tx.tables.get(&make_table_id(table)).cloned();
                        if let Some(info) = &meta.table_const_info {
                            meta.table_kind = info.table_kind;
                        }
                        stage_sources_count += 1;
                    }
                    Some(phy_source::Type::ExternalSource(external)) => {
                        if !external.embedded {
                            stage_sources_count += 1;
                        }
                    }
                    None => {
                        return Err(plan_err(format!("stage {} has an untyped source", stage_id)))
                    }
                }
            }

            for input in &stage.inputs {
                if let Some(phy_connection::Type::StreamLookup(stream_lookup)) = &input.r#type {
                    let table = stream_lookup
                        .table
                        .as_ref()
                        .ok_or_else(|| plan_err(format!("stream lookup of stage {} names no table", stage_id)))?;
                    meta.table_id = Some(make_table_id(table));
                    meta.table_path = Some(table.path.clone());
                    meta.table_const_info = tx.tables.get(&make_table_id(table)).cloned();
                    let info = meta.table_const_info.as_ref().ok_or_else(|| {
                        plan_err(format!("no metadata for stream-lookup table `{}`", table.path))
                    })?;
                    meta.table_kind = info.table_kind;
                }

                if let Some(phy_connection::Type::Sequencer(sequencer)) = &input.r#type {
                    let table = sequencer
                        .table
                        .as_ref()
                        .ok_or_else(|| plan_err(format!("sequencer of stage {} names no table", stage_id)))?;
                    meta.table_id = Some(make_table_id(table));
                    meta.table_path = Some(table.path.clone());
                    meta.table_const_info = tx.tables.get(&make_table_id(table)).cloned();
                }
            }

            for sink in &stage.sinks {
                let Some(phy_sink::Type::InternalSink(internal)) = &sink.r#type else {
                    continue;
                };
                let Some(settings) = &internal.settings else {
                    continue;
                };
                ensure_plan!(
                    sink.output_index == 0,
                    "table sink of stage {} is not at output 0",
                    stage_id
                );
                ensure_plan!(
                    stage.sinks.len() == 1,
                    "stage {} has a table sink among {} sinks",
                    stage_id,
                    stage.sinks.len()
                );
                let table = settings
                    .table
                    .as_ref()
                    .ok_or_else(|| plan_err(format!("table sink of stage {} names no table", stage_id)))?;
                meta.table_path = Some(table.path.clone());
                if settings.mode == TableSinkMode::Delete as i32 {
                    meta.shard_operations.insert(ShardOperation::Erase);
                } else {
                    meta.shard_operations.insert(ShardOperation::Update);
                }

                if settings.mode != TableSinkMode::Fill as i32 {
                    meta.table_id = Some(make_table_id(table));
                    meta.table_const_info = tx.tables.get(&make_table_id(table)).cloned();

                    for index in &settings.indexes {
                        let Some(index_table) = &index.table else {
                            continue;
                        };
                        meta.index_metas.push(crate::graph::IndexMeta {
                            table_id: make_table_id(index_table),
                            table_path: index_table.path.clone(),
                            table_const_info: tx.tables.get(&make_table_id(index_table)).cloned(),
                        });
                    }
                }
            }

            let stage_added = graph.add_stage_info(StageInfo::new(
                stage_id,
                stage.inputs.len() + stage_sources_count,
                stage.outputs_count as usize,
                meta,
            ));
            ensure_graph!(stage_added, "duplicate stage {}", stage_id);

            let stage_info = graph.stage_info_mut(stage_id);
            tracing::debug!(stage = %stage_info.debug_string(), "filled stage");

            let mut tables = HashSet::new();
            for op in &stage.table_ops {
                let table = op
                    .table
                    .as_ref()
                    .ok_or_else(|| plan_err(format!("table op of stage {} names no table", stage_id)))?;
                let op_table_id = make_table_id(table);
                match (&stage_info.meta.table_id, &stage_info.meta.table_path) {
                    (None, path) => {
                        ensure_plan!(
                            path.is_none(),
                            "stage {} has a table path without a table id",
                            stage_id
                        );
                        stage_info.meta.table_id = Some(op_table_id);
                        stage_info.meta.table_path = Some(table.path.clone());
                        stage_info.meta.table_kind = TableKind::Unknown;
                        stage_info.meta.table_const_info = tx.tables.get(&op_table_id).cloned();
                        if let Some(info) = &stage_info.meta.table_const_info {
                            stage_info.meta.table_kind = info.table_kind;
                        }
                        tables.insert(op_table_id);
                    }
                    (Some(table_id), path) => {
                        ensure_plan!(
                            *table_id == op_table_id,
                            "table ops of stage {} address different tables",
                            stage_id
                        );
                        ensure_plan!(
                            path.as_deref() == Some(table.path.as_str()),
                            "table ops of stage {} address different paths",
                            stage_id
                        );
                    }
                }

                match &op.r#type {
                    Some(
                        phy_table_operation::Type::ReadRange(_)
                        | phy_table_operation::Type::ReadRanges(_)
                        | phy_table_operation::Type::ReadOlapRange(_),
                    ) => {
                        stage_info.meta.shard_operations.insert(ShardOperation::Read);
                    }
                    Some(phy_table_operation::Type::UpsertRows(_)) => {
                        stage_info.meta.shard_operations.insert(ShardOperation::Update);
                    }
                    Some(phy_table_operation::Type::DeleteRows(_)) => {
                        stage_info.meta.shard_operations.insert(ShardOperation::Erase);
                    }
                    None => {
                        return Err(plan_err(format!(
                            "unexpected table operation in stage {}",
                            stage_id
                        )))
                    }
                }
            }

            ensure_plan!(
                tables.len() <= 1,
                "stage {} addresses {} tables",
                stage_id,
                tables.len()
            );
            // A transactional stage either reads or writes, never both.
            ensure_plan!(
                !stage_info.meta.has_reads() || !stage_info.meta.has_writes(),
                "stage {} has both reads and writes",
                stage_id
            );
        }
    }

    Ok(())
}

/// Wires each transaction result to the executer: the producing stage's
/// single task gets a `Map` output addressed to task id zero.
pub fn build_result_channels(
    graph: &mut TasksGraph,
    tx_idx: u32,
    tx: &TxData,
) -> BuildResult<()> {
    for (result_idx, result) in tx.body.results.iter().enumerate() {
        let Some(connection) = &result.connection else {
            continue;
        };
        let input_stage_id = StageId::new(tx_idx, connection.stage_index);
        let output_idx = connection.output_index;
        let origin_task_id = {
            let input_stage = graph.stage_info(input_stage_id);
            if input_stage.tasks.is_empty() {
                // Empty result from a single-partition stage.
                tracing::debug!(stage = %input_stage_id, "skipping result channel for empty stage");
                continue;
            }
            ensure_graph!(
                input_stage.tasks.len() == 1,
                "result stage {} has {} tasks",
                input_stage_id,
                input_stage.tasks.len()
            );
            input_stage.tasks[0]
        };

        let channel_id = {
            let channel = graph.add_channel();
            channel.src_stage_id = input_stage_id;
            channel.dst_stage_id = input_stage_id;
            channel.src_task = origin_task_id;
            channel.src_output_index = output_idx;
            channel.dst_task = 0;
            channel.dst_input_index = result_idx as u32;
            channel.in_memory = true;
            channel.id
        };

        let origin_task = graph.task_mut(origin_task_id);
        let output = &mut origin_task.outputs[output_idx as usize];
        output.output_type = TaskOutputType::Map;
        output.channels.push(channel_id);

        tracing::debug!(
            channel = channel_id,
            task = origin_task_id,
            output = output_idx,
            "created result channel"
        );
    }
    Ok(())
}

/// Stamps source inputs onto every task of a stage: read-ranges sources get
/// their settings prototype (ranges and snapshot are filled later), external
/// sources carry their packed settings.
pub fn fill_source_inputs(graph: &mut TasksGraph, stage_id: StageId) -> BuildResult<()> {
    use tidewave_pb::task::{ColumnMeta, ReadRangesSourceSettings, TableMeta};

    let tx_body = graph.stage_info(stage_id).meta.tx.body.clone();
    let stage = &tx_body.stages[stage_id.stage_idx as usize];

    for source in &stage.sources {
        match &source.r#type {
            Some(phy_source::Type::ReadRangesSource(read_source)) => {
                let settings = {
                    let stage_info = graph.stage_info(stage_id);
                    let meta = &stage_info.meta;
                    let table_id = meta.table_id.unwrap_or_default();
                    let mut columns = Vec::with_capacity(read_source.columns.len());
                    if let Some(info) = &meta.table_const_info {
                        for name in &read_source.columns {
                            let column = info.column(name).ok_or_else(|| {
                                plan_err(format!("unknown source column: {}", name))
                            })?;
                            columns.push(ColumnMeta {
                                id: column.id,
                                name: name.clone(),
                                r#type: column.type_id.to_wire(),
                            });
                        }
                    }
                    std::sync::Arc::new(ReadRangesSourceSettings {
                        table: Some(TableMeta {
                            table_path: meta.table_path.clone().unwrap_or_default(),
                            owner_id: table_id.owner_id,
                            table_id: table_id.local_id,
                            schema_version: table_id.schema_version,
                            sys_view_info: meta
                                .table_const_info
                                .as_ref()
                                .and_then(|i| i.sys_view_info.clone())
                                .unwrap_or_default(),
                            table_kind: meta.table_kind as u32,
                        }),
                        columns,
                        ..Default::default()
                    })
                };

                let tasks = graph.stage_info(stage_id).tasks.clone();
                for task_id in tasks {
                    let input =
                        &mut graph.task_mut(task_id).inputs[source.input_index as usize];
                    input.input_type = crate::graph::TaskInputType::Source;
                    input.source_type = Some("ReadRangesSource".to_owned());
                    input.meta.source_settings = Some(settings.clone());
                }
            }
            Some(phy_source::Type::ExternalSource(external)) if !external.embedded => {
                let tasks = graph.stage_info(stage_id).tasks.clone();
                for task_id in tasks {
                    let input =
                        &mut graph.task_mut(task_id).inputs[source.input_index as usize];
                    input.input_type = crate::graph::TaskInputType::Source;
                    input.source_type = Some(external.source_type.clone());
                    input.meta.external_source_settings = Some(external.settings.clone());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn plan_err(message: String) -> crate::error::BuildError {
    crate::error::BuildError::BadRequest(message)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tidewave_common::catalog::{ColumnMetadata, TableConstInfo};
    use tidewave_common::types::TypeId;
    use tidewave_pb::plan::{
        phy_source, PhyReadRangesSource, PhyResult, PhyResultConnection, PhySource, PhyStage,
        PhyTx, TableRef,
    };

    use super::*;
    use crate::error::BuildError;
    use crate::graph::{GraphMeta, QueryParamsProvider, TaskInputType, TasksGraph, TxData};
    use crate::key_range::{SerializedTableRange, ShardKeyRanges};
    use crate::serialize::serialize_task_to_proto;

    struct NoParams;

    impl QueryParamsProvider for NoParams {
        fn serialized_value(&self, _name: &str) -> Option<Vec<u8>> {
            None
        }

        fn typed_value(&self, _name: &str) -> Option<(TypeId, tidewave_common::types::Datum)> {
            None
        }
    }

    fn table_ref() -> TableRef {
        TableRef {
            path: "/Root/T".to_owned(),
            owner_id: 1,
            table_id: 42,
            schema_version: 1,
        }
    }

    fn table_info() -> TableConstInfo {
        let mut columns = std::collections::BTreeMap::new();
        columns.insert(
            "id".to_owned(),
            ColumnMetadata {
                id: 1,
                name: "id".to_owned(),
                type_id: TypeId::Int64,
            },
        );
        columns.insert(
            "value".to_owned(),
            ColumnMetadata {
                id: 2,
                name: "value".to_owned(),
                type_id: TypeId::Utf8,
            },
        );
        TableConstInfo {
            path: "/Root/T".to_owned(),
            key_columns: vec!["id".to_owned()],
            columns,
            table_kind: tidewave_common::catalog::TableKind::Datashard,
            ..Default::default()
        }
    }

    fn scan_tx() -> TxData {
        let stage = PhyStage {
            sources: vec![PhySource {
                input_index: 0,
                r#type: Some(phy_source::Type::ReadRangesSource(PhyReadRangesSource {
                    table: Some(table_ref()),
                    columns: vec!["id".to_owned(), "value".to_owned()],
                })),
            }],
            outputs_count: 1,
            stage_guid: "scan-stage".to_owned(),
            ..Default::default()
        };
        let body = PhyTx {
            stages: vec![stage],
            results: vec![PhyResult {
                connection: Some(PhyResultConnection {
                    stage_index: 0,
                    output_index: 0,
                }),
                rows_limit: 0,
            }],
            ..Default::default()
        };

        let table_id = make_table_id(&table_ref());
        let mut tables = HashMap::new();
        tables.insert(table_id, Arc::new(table_info()));
        TxData {
            body: Arc::new(body),
            params: Arc::new(NoParams),
            tables: Arc::new(tables),
        }
    }

    #[test]
    fn test_single_stage_scan_graph() {
        let tx = scan_tx();
        let mut graph = TasksGraph::new(GraphMeta {
            executer_actor_id: "executer-1".to_owned(),
            ..Default::default()
        });

        fill_stages(&mut graph, std::slice::from_ref(&tx)).unwrap();
        let stage_id = StageId::new(0, 0);
        assert_eq!(graph.stage_info(stage_id).input_count, 1);
        assert!(graph.stage_info(stage_id).meta.has_reads());
        assert!(!graph.stage_info(stage_id).meta.has_writes());

        let task_id = graph.add_task(stage_id);
        fill_source_inputs(&mut graph, stage_id).unwrap();
        build_result_channels(&mut graph, 0, &tx).unwrap();

        let task = graph.task(task_id);
        assert_eq!(task.inputs.len(), 1);
        assert_eq!(task.inputs[0].input_type, TaskInputType::Source);
        assert_eq!(task.outputs.len(), 1);
        assert_eq!(task.outputs[0].channels.len(), 1);
        assert_eq!(graph.channel(task.outputs[0].channels[0]).dst_task, 0);

        // Stamp a full-range read onto the source and serialize.
        {
            let mut ranges = ShardKeyRanges::default();
            ranges.make_full_range(SerializedTableRange::new(
                Default::default(),
                Default::default(),
                true,
                false,
            ));
            let task = graph.task_mut(task_id);
            let settings = task.inputs[0].meta.source_settings.as_ref().unwrap();
            let mut settings = settings.as_ref().clone();
            settings.ranges = Some(ranges.serialize_to_source(true));
            task.inputs[0].meta.source_settings = Some(Arc::new(settings));
        }

        let proto = serialize_task_to_proto(&graph, graph.task(task_id), true).unwrap();
        assert_eq!(proto.id, task_id);
        assert_eq!(proto.inputs.len(), 1);
        assert_eq!(proto.outputs.len(), 1);
        assert!(matches!(
            proto.inputs[0].r#type,
            Some(tidewave_pb::task::task_input_desc::Type::Source(_))
        ));
        assert!(matches!(
            proto.outputs[0].r#type,
            Some(tidewave_pb::task::task_output_desc::Type::Map(_))
        ));
        // Result channel terminates at the executer.
        let channel = &proto.outputs[0].channels[0];
        assert_eq!(channel.dst_task_id, 0);
        assert!(channel.in_memory);
        assert!(!channel.is_persistent);
    }

    #[test]
    fn test_stage_with_reads_and_writes_is_rejected() {
        use tidewave_pb::plan::{
            phy_table_operation, PhyOpReadRanges, PhyOpUpsertRows, PhyTableOperation,
        };

        let stage = PhyStage {
            outputs_count: 1,
            table_ops: vec![
                PhyTableOperation {
                    table: Some(table_ref()),
                    r#type: Some(phy_table_operation::Type::ReadRanges(PhyOpReadRanges {})),
                },
                PhyTableOperation {
                    table: Some(table_ref()),
                    r#type: Some(phy_table_operation::Type::UpsertRows(PhyOpUpsertRows {})),
                },
            ],
            ..Default::default()
        };
        let tx = TxData {
            body: Arc::new(PhyTx {
                stages: vec![stage],
                ..Default::default()
            }),
            params: Arc::new(NoParams),
            tables: Arc::new(HashMap::new()),
        };

        let mut graph = TasksGraph::new(GraphMeta::default());
        let err = fill_stages(&mut graph, &[tx]).unwrap_err();
        assert!(matches!(err, BuildError::BadRequest(_)), "got: {err}");
    }

    #[test]
    fn test_table_ops_must_address_one_table() {
        use tidewave_pb::plan::{phy_table_operation, PhyOpReadRanges, PhyTableOperation};

        let other_table = TableRef {
            path: "/Root/Other".to_owned(),
            owner_id: 1,
            table_id: 43,
            schema_version: 1,
        };
        let stage = PhyStage {
            outputs_count: 1,
            table_ops: vec![
                PhyTableOperation {
                    table: Some(table_ref()),
                    r#type: Some(phy_table_operation::Type::ReadRanges(PhyOpReadRanges {})),
                },
                PhyTableOperation {
                    table: Some(other_table),
                    r#type: Some(phy_table_operation::Type::ReadRanges(PhyOpReadRanges {})),
                },
            ],
            ..Default::default()
        };
        let tx = TxData {
            body: Arc::new(PhyTx {
                stages: vec![stage],
                ..Default::default()
            }),
            params: Arc::new(NoParams),
            tables: Arc::new(HashMap::new()),
        };

        let mut graph = TasksGraph::new(GraphMeta::default());
        fill_stages(&mut graph, &[tx]).unwrap_err();
    }
}
