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

//! Plan simplification: reconstructs the operator DAG from the full plan,
//! removes plumbing nodes, and rolls up CPU usage.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

/// Guards against pathologically deep plans.
const RECONSTRUCTION_BUDGET: i32 = 10_000;

fn redundant_nodes() -> &'static [&'static str] {
    &[
        "UnionAll",
        "Broadcast",
        "Map",
        "Merge",
        "Collect",
        "Stage",
        "Iterator",
        "PartitionByKey",
        "ToFlow",
        "Member",
        "AssumeSorted",
        "CombineByKey",
    ]
}

fn build_plan_index(
    plan: &Value,
    plan_index: &mut HashMap<i64, Value>,
    precomputes: &mut HashMap<String, Value>,
) {
    let Some(map) = plan.as_object() else {
        return;
    };

    if let Some(id) = map.get("PlanNodeId").and_then(Value::as_i64) {
        plan_index.insert(id, plan.clone());
    }

    if let Some(subplan_name) = map.get("Subplan Name").and_then(Value::as_str) {
        if let Some(pos) = subplan_name.find("precompute") {
            precomputes.insert(subplan_name[pos..].to_owned(), plan.clone());
        } else if subplan_name.len() >= 4 && subplan_name.contains("CTE ") {
            precomputes.insert(subplan_name[4..].to_owned(), plan.clone());
        }
    }

    if let Some(plans) = map.get("Plans").and_then(Value::as_array) {
        for subplan in plans {
            build_plan_index(subplan, plan_index, precomputes);
        }
    }
}

/// Removes plumbing nodes, reattaching their children to the grandparent.
/// Returns the replacement list for the caller.
fn remove_redundant_nodes(plan: &mut Value, redundant: &HashSet<&str>) -> Vec<Value> {
    let map = plan
        .as_object_mut()
        .expect("plan nodes are JSON objects");

    let mut children = Vec::new();
    if let Some(plans) = map.get_mut("Plans").and_then(Value::as_array_mut) {
        for child in plans.iter_mut() {
            children.extend(remove_redundant_nodes(child, redundant));
        }
    }

    map.remove("Plans");
    if !children.is_empty() {
        map.insert("Plans".to_owned(), Value::Array(children));
    }

    let Some(type_name) = map.get("Node Type").and_then(Value::as_str) else {
        return vec![];
    };
    if redundant.contains(type_name) || type_name.contains("Precompute") {
        return match map.remove("Plans") {
            Some(Value::Array(children)) => children,
            _ => vec![],
        };
    }

    vec![plan.clone()]
}

struct QueryPlanReconstructor<'a> {
    plan_index: &'a HashMap<i64, Value>,
    precomputes: &'a HashMap<String, Value>,
    node_id_counter: i64,
    budget: i32,
}

impl<'a> QueryPlanReconstructor<'a> {
    fn new(plan_index: &'a HashMap<i64, Value>, precomputes: &'a HashMap<String, Value>) -> Self {
        Self {
            plan_index,
            precomputes,
            node_id_counter: 0,
            budget: RECONSTRUCTION_BUDGET,
        }
    }

    fn reconstruct(&mut self, plan: &Value) -> Value {
        self.reconstruct_impl(plan, 0)
    }

    fn reconstruct_impl(&mut self, plan: &Value, operator_index: usize) -> Value {
        let current_node_id = self.node_id_counter;
        self.node_id_counter += 1;

        let mut result = serde_json::Map::new();
        result.insert("PlanNodeId".to_owned(), json!(current_node_id));

        self.budget -= 1;
        if self.budget <= 0 {
            tracing::debug!("can't build the plan: recursion depth has been exceeded");
            return Value::Object(result);
        }

        let map = plan.as_object().expect("plan nodes are JSON objects");

        if let Some(node_type) = map.get("PlanNodeType") {
            result.insert("PlanNodeType".to_owned(), node_type.clone());
        }

        // A lookup join splits into a LookupJoin node feeding from the
        // lookup table.
        if map.get("Node Type") == Some(&json!("TableLookupJoin")) && map.contains_key("Table") {
            result.insert("Node Type".to_owned(), json!("LookupJoin"));

            let mut op = serde_json::Map::new();
            op.insert("Name".to_owned(), json!("LookupJoin"));
            op.insert(
                "LookupKeyColumns".to_owned(),
                map["LookupKeyColumns"].clone(),
            );
            result.insert("Operators".to_owned(), json!([Value::Object(op)]));

            let mut lookup_op = serde_json::Map::new();
            lookup_op.insert("Name".to_owned(), json!("TableLookup"));
            lookup_op.insert("Columns".to_owned(), map["Columns"].clone());
            lookup_op.insert(
                "LookupKeyColumns".to_owned(),
                map["LookupKeyColumns"].clone(),
            );
            lookup_op.insert("Table".to_owned(), map["Table"].clone());
            for key in ["E-Cost", "E-Rows", "E-Size"] {
                if let Some(value) = map.get(key) {
                    lookup_op.insert(key.to_owned(), value.clone());
                }
            }

            let lookup_plan = json!({
                "Node Type": "TableLookup",
                "PlanNodeType": "TableLookup",
                "Operators": [Value::Object(lookup_op)],
            });

            let mut new_plans = Vec::new();
            if let Some(plans) = map.get("Plans").and_then(Value::as_array) {
                if let Some(first) = plans.first() {
                    new_plans.push(self.reconstruct_impl(first, 0));
                }
            }
            new_plans.push(lookup_plan);
            result.insert("Plans".to_owned(), Value::Array(new_plans));

            return Value::Object(result);
        }

        if !map.contains_key("Operators") {
            let mut plan_inputs = Vec::new();

            result.insert("Node Type".to_owned(), map["Node Type"].clone());

            // A shuffle keeps its keys visible in the simplified node name.
            if map.get("Node Type") == Some(&json!("HashShuffle")) {
                result.insert(
                    "Node Type".to_owned(),
                    json!(format!(
                        "HashShuffle (KeyColumns: {}, HashFunc: {})",
                        map.get("KeyColumns").unwrap_or(&json!([])),
                        map.get("HashFunc").unwrap_or(&json!("HashV1")),
                    )),
                );
            }

            if let Some(cte_name) = map.get("CTE Name").and_then(Value::as_str) {
                if let Some(precompute) = self.precomputes.get(cte_name) {
                    plan_inputs.push(self.reconstruct_impl(&precompute.clone(), 0));
                }
            }

            let Some(plans) = map.get("Plans").and_then(Value::as_array) else {
                result.insert("Plans".to_owned(), Value::Array(plan_inputs));
                return Value::Object(result);
            };

            if map.get("Node Type") == Some(&json!("TableLookup")) {
                let mut op = serde_json::Map::new();
                op.insert("Name".to_owned(), json!("TableLookup"));
                op.insert("Columns".to_owned(), map["Columns"].clone());
                op.insert(
                    "LookupKeyColumns".to_owned(),
                    map["LookupKeyColumns"].clone(),
                );
                op.insert("Table".to_owned(), map["Table"].clone());
                for key in ["E-Cost", "E-Rows", "E-Size"] {
                    if let Some(value) = map.get(key) {
                        op.insert(key.to_owned(), value.clone());
                    }
                }
                result.insert("Operators".to_owned(), json!([Value::Object(op)]));
                return Value::Object(result);
            }

            for subplan in plans {
                let sub_map = subplan.as_object().expect("plan nodes are JSON objects");
                if !sub_map.contains_key("Operators") && sub_map.contains_key("CTE Name") {
                    let cte_name = sub_map["CTE Name"].as_str().unwrap_or_default();
                    if let Some(precompute) = self.precomputes.get(cte_name) {
                        plan_inputs.push(self.reconstruct_impl(&precompute.clone(), 0));
                    }
                } else if !sub_map
                    .get("Node Type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .contains("Precompute")
                {
                    plan_inputs.push(self.reconstruct_impl(subplan, 0));
                }
            }
            result.insert("Plans".to_owned(), Value::Array(plan_inputs));
            return Value::Object(result);
        }

        if map.contains_key("CTE Name")
            && map.get("Node Type") == Some(&json!("ConstantExpr"))
        {
            let cte_name = map["CTE Name"].as_str().unwrap_or_default();
            let Some(precompute) = self.precomputes.get(cte_name) else {
                result.insert("Node Type".to_owned(), map["Node Type"].clone());
                return Value::Object(result);
            };
            return self.reconstruct_impl(&precompute.clone(), 0);
        }

        let ops = map["Operators"].as_array().expect("Operators is a list");
        let mut op = ops[operator_index].clone();

        let mut plan_inputs = Vec::new();
        let op_name = op["Name"].as_str().unwrap_or_default().to_owned();

        let mut processed_external = HashSet::new();
        let mut processed_internal = HashSet::new();
        let had_inputs = op.get("Inputs").is_some();
        if let Some(inputs) = op.get("Inputs").and_then(Value::as_array).cloned() {
            for op_input in &inputs {
                let input_map = op_input.as_object().expect("operator inputs are objects");
                if let Some(plan_key) = input_map.get("ExternalPlanNodeId").and_then(Value::as_i64)
                {
                    if !processed_external.insert(plan_key) {
                        continue;
                    }
                    if let Some(input_plan) = self.plan_index.get(&plan_key) {
                        plan_inputs.push(self.reconstruct_impl(&input_plan.clone(), 0));
                    }
                } else if let Some(op_id) =
                    input_map.get("InternalOperatorId").and_then(Value::as_i64)
                {
                    if !processed_internal.insert(op_id) {
                        continue;
                    }
                    plan_inputs.push(self.reconstruct_impl(plan, op_id as usize));
                }
            }
        }

        if let Some(op_map) = op.as_object_mut() {
            op_map.remove("Inputs");
        }

        // An already-simplified node carries its inputs as child plans.
        if !had_inputs {
            if let Some(plans) = map.get("Plans").and_then(Value::as_array) {
                for subplan in plans {
                    plan_inputs.push(self.reconstruct_impl(subplan, 0));
                }
            }
        }

        // Plumbing operators may hold a precompute reference instead of an
        // input edge.
        for key in [
            "Input",
            "ToFlow",
            "Member",
            "AssumeSorted",
            "Iterator",
            "CombineByKey",
        ] {
            if let Some(maybe_precompute) = op.get(key).and_then(Value::as_str) {
                if plan_inputs.is_empty() {
                    if let Some(precompute) = self.precomputes.get(maybe_precompute) {
                        plan_inputs.push(self.reconstruct_impl(&precompute.clone(), 0));
                    }
                }
                break;
            }
        }

        result.insert("Node Type".to_owned(), json!(op_name));

        if let Some(stats) = map.get("Stats").and_then(Value::as_object) {
            attach_operator_stats(&mut op, ops, operator_index, &op_name, stats);
        }

        // Trim redundant table-scan info.
        if let Some(op_map) = op.as_object_mut() {
            if op_map.contains_key("Table") && op_map.contains_key("Path") {
                let path = op_map["Path"].as_str().unwrap_or_default();
                let name = path.rsplit('/').next().unwrap_or(path).to_owned();
                op_map.insert("Table".to_owned(), json!(name));
                op_map.remove("Path");
            }
            op_map.remove("Scan");
            op_map.remove("ReadRangesPointPrefixLen");
        }

        result.insert("Operators".to_owned(), json!([op]));

        if !plan_inputs.is_empty() {
            result.insert("Plans".to_owned(), Value::Array(plan_inputs));
        }

        Value::Object(result)
    }
}

/// Per-operator actuals: `A-Rows`/`A-Size` joined by operator type and id,
/// with collision detection; the stage's top operator also inherits the
/// stage output totals and CPU.
fn attach_operator_stats(
    op: &mut Value,
    ops: &[Value],
    operator_index: usize,
    op_name: &str,
    stats: &serde_json::Map<String, Value>,
) {
    fn operator_type(name: &str, op: &Value) -> Option<&'static str> {
        if name.contains("Join (") {
            Some("Join")
        } else if name == "Filter" {
            if op.get("Pushdown") == Some(&json!("True")) {
                None
            } else {
                Some("Filter")
            }
        } else if name == "Aggregate" {
            Some("Aggregation")
        } else {
            None
        }
    }

    let mut operator_rows = false;
    let mut operator_size = false;

    let mut op_type = operator_type(op_name, op);
    let op_id = op
        .get("Id")
        .and_then(Value::as_str)
        .unwrap_or("0")
        .to_owned();

    if op_type.is_some() {
        for (i, other) in ops.iter().enumerate() {
            if i == operator_index {
                continue;
            }
            let other_name = other["Name"].as_str().unwrap_or_default();
            let other_type = operator_type(other_name, other);
            if other_type == op_type {
                let other_id = other
                    .get("Id")
                    .and_then(Value::as_str)
                    .unwrap_or("0");
                if other_id == op_id {
                    // Collision detected, do not apply stats.
                    op_type = None;
                    break;
                }
            }
        }
    }

    fn aggregate_sum(value: &Value) -> Option<f64> {
        if let Some(map) = value.as_object() {
            map.get("Sum").and_then(Value::as_f64)
        } else {
            value.as_f64()
        }
    }

    if op_name == "TableFullScan" {
        if let Some(tables) = stats.get("Table").and_then(Value::as_array) {
            let table_path = op
                .get("Path")
                .or_else(|| op.get("Table"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            for table_stat in tables {
                let Some(table_map) = table_stat.as_object() else {
                    continue;
                };
                if table_map.get("Path").and_then(Value::as_str) == Some(table_path.as_str()) {
                    if let Some(rows) = table_map.get("ReadRows").and_then(aggregate_sum) {
                        op["A-Rows"] = json!(rows);
                        operator_rows = true;
                    }
                    if let Some(bytes) = table_map.get("ReadBytes").and_then(aggregate_sum) {
                        op["A-Size"] = json!(bytes);
                    }
                    break;
                }
            }
        }
    }

    if let Some(op_type) = op_type {
        if let Some(operators) = stats.get("Operator").and_then(Value::as_array) {
            for op_stat in operators {
                let Some(op_map) = op_stat.as_object() else {
                    continue;
                };
                if op_map.get("Type").and_then(Value::as_str) == Some(op_type)
                    && op_map.get("Id").and_then(Value::as_str) == Some(op_id.as_str())
                {
                    if let Some(rows) = op_map.get("Rows").and_then(aggregate_sum) {
                        op["A-Rows"] = json!(rows);
                        operator_rows = true;
                    }
                    if let Some(bytes) = op_map.get("Bytes").and_then(aggregate_sum) {
                        op["A-Size"] = json!(bytes);
                        operator_size = true;
                    }
                    break;
                }
            }
        }
    }

    if operator_index == 0 {
        // Top-level rows and size have to match the stage output.
        if !operator_rows {
            if let Some(rows) = stats.get("OutputRows").and_then(aggregate_sum) {
                op["A-Rows"] = json!(rows);
            }
        }
        if !operator_size {
            if let Some(bytes) = stats.get("OutputBytes").and_then(aggregate_sum) {
                op["A-Size"] = json!(bytes);
            }
        }

        // CPU usage is per stage; assign it to the top operator.
        if let Some(cpu_time) = stats.get("CpuTimeUs") {
            let op_cpu_time = if let Some(map) = cpu_time.as_object() {
                map.get("Max").and_then(Value::as_f64)
            } else {
                cpu_time.as_f64()
            };
            if let Some(op_cpu_time) = op_cpu_time {
                op["A-SelfCpu"] = json!(op_cpu_time / 1000.0);
            }
        }
    }
}

/// Rolls CPU up the simplified plan: each node's `A-Cpu` is its own
/// `A-SelfCpu` plus the children's total.
fn compute_cpu_times(plan: &mut Value) -> f64 {
    let mut current_cpu_time = 0.0;

    if let Some(plans) = plan
        .as_object_mut()
        .and_then(|m| m.get_mut("Plans"))
        .and_then(Value::as_array_mut)
    {
        for subplan in plans.iter_mut() {
            current_cpu_time += compute_cpu_times(subplan);
        }
    }

    if let Some(ops) = plan
        .as_object_mut()
        .and_then(|m| m.get_mut("Operators"))
        .and_then(Value::as_array_mut)
    {
        if let Some(op) = ops.first_mut().and_then(Value::as_object_mut) {
            if let Some(self_cpu) = op.get("A-SelfCpu").and_then(Value::as_f64) {
                current_cpu_time += self_cpu;
                op.insert("A-Cpu".to_owned(), json!(current_cpu_time));
            }
        }
    }

    current_cpu_time
}

/// Produces the simplified view of one plan tree.
pub fn simplify_query_plan(plan: &mut Value) -> Value {
    let redundant: HashSet<&str> = redundant_nodes().iter().copied().collect();

    let mut plan_index = HashMap::new();
    let mut precomputes = HashMap::new();
    build_plan_index(plan, &mut plan_index, &mut precomputes);

    *plan = QueryPlanReconstructor::new(&plan_index, &precomputes).reconstruct(plan);

    remove_redundant_nodes(plan, &redundant);
    compute_cpu_times(plan);

    plan.clone()
}

/// Attaches `SimplifiedPlan` to a serialized plan document.
pub fn add_simplified_plan(plan_text: &str) -> String {
    let Ok(mut plan_json) = serde_json::from_str::<Value>(plan_text) else {
        return plan_text.to_owned();
    };
    if !plan_json
        .as_object()
        .is_some_and(|m| m.contains_key("Plan"))
    {
        return plan_text.to_owned();
    }

    let mut plan_copy = plan_json["Plan"].clone();
    let simplified = simplify_query_plan(&mut plan_copy);
    plan_json["SimplifiedPlan"] = simplified;

    plan_json.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> Value {
        json!({
            "Node Type": "Query",
            "PlanNodeType": "Query",
            "Plans": [{
                "PlanNodeId": 5,
                "Node Type": "ResultSet",
                "PlanNodeType": "ResultSet",
                "Plans": [{
                    "PlanNodeId": 4,
                    "Node Type": "Limit",
                    "Operators": [
                        {"Name": "Limit", "Limit": "10", "Inputs": [{"ExternalPlanNodeId": 3}]}
                    ],
                    "Plans": [{
                        "PlanNodeId": 3,
                        "Node Type": "UnionAll",
                        "PlanNodeType": "Connection",
                        "Plans": [{
                            "PlanNodeId": 2,
                            "Node Type": "Limit-TableFullScan",
                            "Operators": [
                                {"Name": "Limit", "Limit": "10", "Inputs": [{"InternalOperatorId": 1}]},
                                {"Name": "TableFullScan", "Table": "T", "Path": "/Root/T",
                                 "ReadColumns": ["id"], "Inputs": []}
                            ]
                        }]
                    }]
                }]
            }]
        })
    }

    #[test]
    fn test_simplify_removes_plumbing_nodes() {
        let mut plan = sample_plan();
        let simplified = simplify_query_plan(&mut plan);

        let text = simplified.to_string();
        assert!(!text.contains("UnionAll"));
        assert!(text.contains("TableFullScan"));

        // The scan's Path collapses into the table name.
        assert!(!text.contains("/Root/T"));
        assert!(text.contains(r#""Table":"T""#));
    }

    #[test]
    fn test_simplify_is_idempotent() {
        let mut plan = sample_plan();
        let once = simplify_query_plan(&mut plan);
        let mut once_copy = once.clone();
        let twice = simplify_query_plan(&mut once_copy);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_cpu_rollup() {
        let mut plan = json!({
            "Node Type": "A",
            "Operators": [{"Name": "A", "A-SelfCpu": 1.5}],
            "Plans": [{
                "Node Type": "B",
                "Operators": [{"Name": "B", "A-SelfCpu": 2.0}]
            }]
        });
        compute_cpu_times(&mut plan);
        assert_eq!(plan["Operators"][0]["A-Cpu"], json!(3.5));
        assert_eq!(plan["Plans"][0]["Operators"][0]["A-Cpu"], json!(2.0));
    }

    #[test]
    fn test_add_simplified_plan_round_trips() {
        let document = json!({
            "meta": {"version": "0.2", "type": "query"},
            "Plan": sample_plan(),
        });
        let text = add_simplified_plan(&document.to_string());
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert!(parsed.as_object().unwrap().contains_key("SimplifiedPlan"));
        // The full plan is untouched.
        assert_eq!(parsed["Plan"], document["Plan"]);
    }
}
