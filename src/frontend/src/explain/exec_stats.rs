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

//! Joins a `DqExecutionStats` protobuf onto the JSON plan by stage guid,
//! for ANALYZE output.

use std::collections::HashMap;

use serde_json::{json, Value};
use tidewave_pb::stats::{AggrStat, AsyncBufferStats, ExecutionStats, StageStats};

fn aggr_to_json(aggr: &AggrStat) -> Value {
    let mut out = json!({
        "Min": aggr.min,
        "Max": aggr.max,
        "Sum": aggr.sum,
        "Count": aggr.cnt,
    });
    if !aggr.history.is_empty() {
        let history: Vec<Value> = aggr
            .history
            .iter()
            .map(|point| json!([point.timestamp_ms, point.value]))
            .collect();
        out["History"] = Value::Array(history);
    }
    out
}

fn async_buffer_to_json(stats: &AsyncBufferStats) -> Value {
    let mut out = serde_json::Map::new();
    out.insert("PeerStageId".to_owned(), json!(stats.peer_stage_id));
    if let Some(bytes) = &stats.bytes {
        out.insert("Bytes".to_owned(), aggr_to_json(bytes));
    }
    if let Some(rows) = &stats.rows {
        out.insert("Rows".to_owned(), aggr_to_json(rows));
    }
    if let Some(wait_time) = &stats.wait_time_us {
        out.insert("WaitTimeUs".to_owned(), aggr_to_json(wait_time));
    }
    if let Some(first_message) = &stats.first_message_ms {
        out.insert("FirstMessageMs".to_owned(), aggr_to_json(first_message));
    }
    if let Some(last_message) = &stats.last_message_ms {
        out.insert("LastMessageMs".to_owned(), aggr_to_json(last_message));
    }
    Value::Object(out)
}

fn stage_stats_to_json(stage: &StageStats) -> Value {
    let mut out = serde_json::Map::new();
    out.insert("TotalTasks".to_owned(), json!(stage.total_tasks_count));
    out.insert(
        "FinishedTasks".to_owned(),
        json!(stage.finished_tasks_count),
    );
    out.insert("StageId".to_owned(), json!(stage.stage_id));

    if let Some(cpu_time) = &stage.cpu_time_us {
        out.insert("CpuTimeUs".to_owned(), aggr_to_json(cpu_time));
    }
    if let Some(output_rows) = &stage.output_rows {
        out.insert("OutputRows".to_owned(), aggr_to_json(output_rows));
    }
    if let Some(output_bytes) = &stage.output_bytes {
        out.insert("OutputBytes".to_owned(), aggr_to_json(output_bytes));
    }
    if let Some(max_memory) = &stage.max_memory_usage {
        out.insert("MaxMemoryUsage".to_owned(), aggr_to_json(max_memory));
    }

    if !stage.input.is_empty() {
        out.insert(
            "Input".to_owned(),
            Value::Array(stage.input.iter().map(async_buffer_to_json).collect()),
        );
    }
    if !stage.output.is_empty() {
        out.insert(
            "Output".to_owned(),
            Value::Array(stage.output.iter().map(async_buffer_to_json).collect()),
        );
    }

    if !stage.operators.is_empty() {
        let operators: Vec<Value> = stage
            .operators
            .iter()
            .map(|operator| {
                let mut op = serde_json::Map::new();
                op.insert("Type".to_owned(), json!(operator.r#type));
                op.insert("Id".to_owned(), json!(operator.id));
                if let Some(rows) = &operator.rows {
                    op.insert("Rows".to_owned(), aggr_to_json(rows));
                }
                if let Some(bytes) = &operator.bytes {
                    op.insert("Bytes".to_owned(), aggr_to_json(bytes));
                }
                Value::Object(op)
            })
            .collect();
        out.insert("Operator".to_owned(), Value::Array(operators));
    }

    if !stage.tables.is_empty() {
        let tables: Vec<Value> = stage
            .tables
            .iter()
            .map(|table| {
                let mut entry = serde_json::Map::new();
                entry.insert("Path".to_owned(), json!(table.path));
                if let Some(read_rows) = &table.read_rows {
                    entry.insert("ReadRows".to_owned(), aggr_to_json(read_rows));
                }
                if let Some(read_bytes) = &table.read_bytes {
                    entry.insert("ReadBytes".to_owned(), aggr_to_json(read_bytes));
                }
                Value::Object(entry)
            })
            .collect();
        out.insert("Table".to_owned(), Value::Array(tables));
    }

    if !stage.tasks.is_empty() {
        let tasks: Vec<Value> = stage
            .tasks
            .iter()
            .map(|task| {
                json!({
                    "TaskId": task.task_id,
                    "Host": task.host,
                    "CpuTimeUs": task.cpu_time_us,
                    "InputRows": task.input_rows,
                    "InputBytes": task.input_bytes,
                    "OutputRows": task.output_rows,
                    "OutputBytes": task.output_bytes,
                })
            })
            .collect();
        out.insert("Tasks".to_owned(), Value::Array(tasks));
    }

    Value::Object(out)
}

/// Applies a function to every node of a plan tree, parents first.
pub fn modify_plan<F>(plan: &mut Value, modify: &F)
where
    F: Fn(&mut serde_json::Map<String, Value>),
{
    let Some(map) = plan.as_object_mut() else {
        return;
    };
    modify(map);

    if let Some(plans) = map.get_mut("Plans").and_then(Value::as_array_mut) {
        for subplan in plans.iter_mut() {
            modify_plan(subplan, modify);
        }
    }
}

/// Attaches per-stage execution statistics to a transaction plan, keyed by
/// `StageGuid`.
pub fn add_exec_stats_to_tx_plan(tx_plan: &str, stats: &ExecutionStats) -> String {
    if tx_plan.is_empty() {
        return String::new();
    }
    let Ok(mut plan) = serde_json::from_str::<Value>(tx_plan) else {
        return tx_plan.to_owned();
    };

    let by_guid: HashMap<&str, &StageStats> = stats
        .stages
        .iter()
        .map(|stage| (stage.stage_guid.as_str(), stage))
        .collect();

    modify_plan(&mut plan, &|node| {
        let Some(guid) = node.get("StageGuid").and_then(Value::as_str) else {
            return;
        };
        if let Some(stage_stats) = by_guid.get(guid) {
            node.insert("Stats".to_owned(), stage_stats_to_json(stage_stats));
        }
    });

    plan.to_string()
}

#[cfg(test)]
mod tests {
    use tidewave_pb::stats::OperatorStats;

    use super::*;

    fn aggr(min: u64, max: u64, sum: u64, cnt: u64) -> Option<AggrStat> {
        Some(AggrStat {
            min,
            max,
            sum,
            cnt,
            history: vec![],
        })
    }

    #[test]
    fn test_stats_joined_by_stage_guid() {
        let plan = json!({
            "Node Type": "Query",
            "Plans": [{
                "PlanNodeId": 1,
                "Node Type": "Filter-TableFullScan",
                "StageGuid": "stage-1",
                "Operators": [
                    {"Name": "Filter", "Predicate": "x > 1", "Inputs": [{"InternalOperatorId": 1}]},
                    {"Name": "TableFullScan", "Table": "T", "Inputs": []}
                ]
            }]
        });

        let stats = ExecutionStats {
            stages: vec![StageStats {
                stage_guid: "stage-1".to_owned(),
                stage_id: 3,
                total_tasks_count: 2,
                finished_tasks_count: 2,
                cpu_time_us: aggr(10, 30, 40, 2),
                output_rows: aggr(5, 15, 20, 2),
                output_bytes: aggr(50, 150, 200, 2),
                operators: vec![OperatorStats {
                    r#type: "Filter".to_owned(),
                    id: "0".to_owned(),
                    rows: aggr(1, 3, 4, 2),
                    bytes: None,
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let overlaid = add_exec_stats_to_tx_plan(&plan.to_string(), &stats);
        let value: Value = serde_json::from_str(&overlaid).unwrap();
        let stage = &value["Plans"][0];
        assert_eq!(stage["Stats"]["TotalTasks"], json!(2));
        assert_eq!(stage["Stats"]["CpuTimeUs"]["Max"], json!(30));
        assert_eq!(stage["Stats"]["OutputRows"]["Sum"], json!(20));
        assert_eq!(stage["Stats"]["Operator"][0]["Type"], json!("Filter"));

        // The simplifier picks the actuals up into A-Rows / A-Cpu.
        let mut plan_value = value.clone();
        let simplified = crate::explain::simplify_query_plan(&mut plan_value);
        let text = simplified.to_string();
        assert!(text.contains("A-SelfCpu"), "got: {text}");
        assert!(text.contains("A-Rows"), "got: {text}");
    }

    #[test]
    fn test_unknown_guid_leaves_plan_untouched() {
        let plan = json!({"Node Type": "Query", "StageGuid": "other"});
        let overlaid = add_exec_stats_to_tx_plan(&plan.to_string(), &ExecutionStats::default());
        let value: Value = serde_json::from_str(&overlaid).unwrap();
        assert!(value.get("Stats").is_none());
    }
}
