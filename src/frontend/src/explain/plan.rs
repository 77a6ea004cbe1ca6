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

//! Walks the optimized expression tree and emits the JSON query plan.
//!
//! Field names (`Node Type`, `PlanNodeId`, `Operators`, `StageGuid`, ...)
//! are part of the plan contract consumed by EXPLAIN, ANALYZE and the UI.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use serde_json::{json, Value};

use super::expr::{
    Connection, ConnectionKind, CostEstimates, ExplainQueryType, ExprNode, ExprRef, QueryExpr,
    RangeBoundsExpr, Source, Stage, StageInput, TableReadExpr, TxExpr,
};
use super::simplify::add_simplified_plan;

/// How deep the serializer is willing to recurse into a plan.
const PLAN_RECURSION_BUDGET: i32 = 10_000;

#[derive(Clone, Debug, Default)]
pub struct ExplainSettings {
    pub cost_based_optimization_level: u32,
}

impl ExplainSettings {
    fn with_estimates(&self) -> bool {
        self.cost_based_optimization_level != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlanNodeType {
    Stage,
    Connection,
    Materialize,
    ResultSet,
}

impl PlanNodeType {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            PlanNodeType::Stage => None,
            PlanNodeType::Connection => Some("Connection"),
            PlanNodeType::Materialize => Some("Materialize"),
            PlanNodeType::ResultSet => Some("ResultSet"),
        }
    }
}

#[derive(Clone, Debug)]
enum OperatorInput {
    Internal(u32),
    External(u32),
    Constant,
}

#[derive(Clone, Debug, Default)]
struct Operator {
    properties: BTreeMap<String, Value>,
    inputs: Vec<OperatorInput>,
}

#[derive(Debug)]
struct QueryPlanNode {
    node_id: u32,
    guid: String,
    type_name: String,
    node_type: PlanNodeType,
    cte_name: Option<String>,
    cte_ref_name: Option<String>,
    node_info: BTreeMap<String, Value>,
    operators: Vec<Operator>,
    plans: BTreeSet<u32>,
    opt_estimates: BTreeMap<String, Value>,
}

impl QueryPlanNode {
    fn new() -> Self {
        Self {
            node_id: 0,
            guid: String::new(),
            type_name: String::new(),
            node_type: PlanNodeType::Stage,
            cte_name: None,
            cte_ref_name: None,
            node_info: BTreeMap::new(),
            operators: Vec::new(),
            plans: BTreeSet::new(),
            opt_estimates: BTreeMap::new(),
        }
    }
}

/// Collected table access facts, emitted in the document's `tables` section.
#[derive(Debug, Default)]
pub(crate) struct TableAccessInfo {
    pub reads: Vec<Value>,
    pub writes: Vec<Value>,
}

pub(crate) struct SerializerCtx {
    pub tables: BTreeMap<String, TableAccessInfo>,
    pub precompute_phases: HashSet<u32>,
    pub plan_node_id: u32,
    pub tx_count: u32,
    pub settings: ExplainSettings,
}

/// Classification of one table read, by the shape of its key ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlanTableReadType {
    FullScan,
    Scan,
    Lookup,
    MultiLookup,
}

impl PlanTableReadType {
    fn node_name(&self) -> &'static str {
        match self {
            PlanTableReadType::FullScan => "TableFullScan",
            PlanTableReadType::Scan => "TableRangeScan",
            PlanTableReadType::Lookup => "TablePointLookup",
            PlanTableReadType::MultiLookup => "TableMultiLookup",
        }
    }

    fn access_name(&self) -> &'static str {
        match self {
            PlanTableReadType::FullScan => "FullScan",
            PlanTableReadType::Scan => "Scan",
            PlanTableReadType::Lookup => "Lookup",
            PlanTableReadType::MultiLookup => "MultiLookup",
        }
    }
}

fn classify_read(read: &TableReadExpr) -> PlanTableReadType {
    match &read.ranges {
        RangeBoundsExpr::FullRange | RangeBoundsExpr::Void => PlanTableReadType::FullScan,
        RangeBoundsExpr::ResultBinding { .. } => PlanTableReadType::Scan,
        RangeBoundsExpr::Ranges(ranges) => {
            if ranges.is_empty()
                || ranges
                    .iter()
                    .all(|r| r.bounds.iter().all(|b| b.is_unbounded()))
            {
                return PlanTableReadType::FullScan;
            }
            let all_points = ranges.iter().all(|r| {
                r.bounds.len() == read.key_columns.len() && r.bounds.iter().all(|b| b.is_point())
            });
            if all_points {
                if ranges.len() == 1 {
                    PlanTableReadType::Lookup
                } else {
                    PlanTableReadType::MultiLookup
                }
            } else {
                PlanTableReadType::Scan
            }
        }
    }
}

fn describe_ranges(read: &TableReadExpr) -> Value {
    match &read.ranges {
        RangeBoundsExpr::FullRange | RangeBoundsExpr::Void => Value::Array(
            read.key_columns
                .iter()
                .map(|c| Value::String(format!("{} (-∞, +∞)", c)))
                .collect(),
        ),
        RangeBoundsExpr::ResultBinding { tx_id, result_id } => {
            Value::String(format!("precompute_{}_{}", tx_id, result_id))
        }
        RangeBoundsExpr::Ranges(ranges) => Value::Array(
            ranges
                .iter()
                .map(|range| {
                    Value::String(range.bounds.iter().map(|b| b.describe()).join(", "))
                })
                .collect(),
        ),
    }
}

fn estimates_json(stats: Option<&CostEstimates>) -> [(&'static str, Value); 3] {
    match stats {
        Some(stats) => [
            ("E-Rows", json!(stats.rows.to_string())),
            ("E-Cost", json!(stats.cost.to_string())),
            ("E-Size", json!(stats.byte_size.to_string())),
        ],
        None => [
            ("E-Rows", json!("No estimate")),
            ("E-Cost", json!("No estimate")),
            ("E-Size", json!("No estimate")),
        ],
    }
}

struct TxPlanSerializer<'a> {
    ctx: &'a mut SerializerCtx,
    tx_id: u32,
    tx: &'a TxExpr,
    nodes: BTreeMap<u32, QueryPlanNode>,
    stage_guid_to_node: HashMap<String, u32>,
    /// Lambda-argument identity -> the plan input that feeds it.
    arg_bindings: HashMap<usize, OperatorInput>,
    budget: i32,
}

impl<'a> TxPlanSerializer<'a> {
    fn new(ctx: &'a mut SerializerCtx, tx_id: u32, tx: &'a TxExpr) -> Self {
        Self {
            ctx,
            tx_id,
            tx,
            nodes: BTreeMap::new(),
            stage_guid_to_node: HashMap::new(),
            arg_bindings: HashMap::new(),
            budget: PLAN_RECURSION_BUDGET,
        }
    }

    fn alloc_node(&mut self) -> u32 {
        self.ctx.plan_node_id += 1;
        let id = self.ctx.plan_node_id;
        self.nodes.insert(id, QueryPlanNode::new());
        id
    }

    fn add_plan_node(&mut self, parent: u32) -> u32 {
        let id = self.alloc_node();
        self.nodes
            .get_mut(&parent)
            .expect("parent node exists")
            .plans
            .insert(id);
        id
    }

    /// Appends an operator, extending the node's dashed type name, and
    /// returns its index. Inputs are filled by the caller once children have
    /// been visited.
    fn add_operator(&mut self, node_id: u32, name: &str, operator: Operator) -> u32 {
        let node = self.nodes.get_mut(&node_id).expect("node exists");
        if node.type_name.is_empty() {
            node.type_name = name.to_owned();
        } else {
            node.type_name = format!("{}-{}", node.type_name, name);
        }
        node.operators.push(operator);
        (node.operators.len() - 1) as u32
    }

    fn set_operator_inputs(&mut self, node_id: u32, operator: u32, inputs: Vec<OperatorInput>) {
        let node = self.nodes.get_mut(&node_id).expect("node exists");
        node.operators[operator as usize].inputs = inputs;
    }

    fn serialize(mut self) -> Option<Value> {
        let phase_id = self.alloc_node();
        self.nodes.get_mut(&phase_id).unwrap().type_name = "Phase".to_owned();

        for (res_id, result) in self.tx.results.iter().enumerate() {
            let node_id = self.add_plan_node(phase_id);
            let mut type_name = String::new();
            if self.ctx.precompute_phases.contains(&self.tx_id) {
                type_name.push_str("Precompute");
                let node = self.nodes.get_mut(&node_id).unwrap();
                node.cte_name = Some(format!("precompute_{}_{}", self.tx_id, res_id));
                node.node_type = PlanNodeType::Materialize;
            } else {
                type_name.push_str("ResultSet");
                self.nodes.get_mut(&node_id).unwrap().node_type = PlanNodeType::ResultSet;
            }
            if self.ctx.tx_count > 1 {
                type_name.push_str(&format!("_{}", self.tx_id));
            }
            if self.tx.results.len() > 1 {
                type_name.push_str(&format!("_{}", res_id));
            }
            self.nodes.get_mut(&node_id).unwrap().type_name = type_name;

            self.visit_stage(&result.connection.stage, node_id);
        }

        for stage in &self.tx.stages {
            if matches!(stage.body.as_ref(), ExprNode::Effects { .. }) {
                let node_id = self.add_plan_node(phase_id);
                self.nodes.get_mut(&node_id).unwrap().type_name = "Effect".to_owned();
                self.visit_stage(stage, node_id);
            } else if !stage.sinks.is_empty() {
                self.visit_stage(stage, phase_id);
            }
        }

        // Node ids are assigned in reverse allocation order, so the root of
        // the phase carries the highest id.
        let last = self.ctx.plan_node_id;
        let first = last + 1 - self.nodes.len() as u32;
        for (&alloc_id, node) in self.nodes.iter_mut() {
            node.node_id = first + last - alloc_id;
        }

        if self.nodes.is_empty() {
            return None;
        }
        Some(self.write_plan_node(phase_id))
    }

    fn visit_stage(&mut self, stage: &Arc<Stage>, parent: u32) -> u32 {
        if let Some(&seen) = self.stage_guid_to_node.get(&stage.guid) {
            // Deduplicate: a revisited stage becomes a CTE reference.
            let (cte_name, type_name) = {
                let node = self.nodes.get_mut(&seen).expect("seen node exists");
                if node.cte_name.is_none() {
                    node.cte_name = Some(format!("{}_{}", node.type_name, seen));
                }
                (node.cte_name.clone().unwrap(), node.type_name.clone())
            };
            let ref_id = self.add_plan_node(parent);
            let node = self.nodes.get_mut(&ref_id).unwrap();
            node.type_name = type_name;
            node.cte_ref_name = Some(cte_name);
            return ref_id;
        }

        let node_id = self.add_plan_node(parent);
        self.nodes.get_mut(&node_id).unwrap().guid = stage.guid.clone();
        self.stage_guid_to_node.insert(stage.guid.clone(), node_id);

        for (arg, input) in stage.args.iter().zip(stage.inputs.iter()) {
            let binding = match input {
                StageInput::Connection(connection) => {
                    OperatorInput::External(self.visit_connection(connection, node_id))
                }
                StageInput::Source(source) => self.visit_source(source, node_id),
            };
            self.arg_bindings
                .insert(Arc::as_ptr(arg) as usize, binding);
        }

        for sink in &stage.sinks {
            let mut operator = Operator::default();
            operator
                .properties
                .insert("Name".to_owned(), json!("Sink"));
            operator
                .properties
                .insert("SinkType".to_owned(), json!(sink.sink_type));
            if let Some(table) = &sink.table {
                operator
                    .properties
                    .insert("Table".to_owned(), json!(table.display_name()));
            }
            if let Some(mode) = &sink.mode {
                operator
                    .properties
                    .insert("Mode".to_owned(), json!(mode));
            }
            if let Some(external) = &sink.external_data_sink {
                operator
                    .properties
                    .insert("ExternalDataSink".to_owned(), json!(external));
            }
            self.add_operator(node_id, "Sink", operator);
        }

        let body = stage.body.clone();
        self.visit_expr(&body, node_id);

        let node = self.nodes.get_mut(&node_id).unwrap();
        if node.type_name.is_empty() {
            node.type_name = "Stage".to_owned();
        }
        node_id
    }

    fn visit_connection(&mut self, connection: &Arc<Connection>, parent: u32) -> u32 {
        let node_id = self.add_plan_node(parent);
        {
            let with_estimates = self.ctx.settings.with_estimates();
            let node = self.nodes.get_mut(&node_id).unwrap();
            node.node_type = PlanNodeType::Connection;

            match &connection.kind {
                ConnectionKind::UnionAll => node.type_name = "UnionAll".to_owned(),
                ConnectionKind::Broadcast => node.type_name = "Broadcast".to_owned(),
                ConnectionKind::Map => node.type_name = "Map".to_owned(),
                ConnectionKind::ParallelUnionAll => {
                    node.type_name = "ParallelUnionAll".to_owned()
                }
                ConnectionKind::Sequencer => node.type_name = "Sequencer".to_owned(),
                ConnectionKind::Result => node.type_name = "Result".to_owned(),
                ConnectionKind::Value => node.type_name = "Value".to_owned(),
                ConnectionKind::HashShuffle {
                    key_columns,
                    hash_func,
                } => {
                    node.type_name = "HashShuffle".to_owned();
                    node.node_info
                        .insert("KeyColumns".to_owned(), json!(key_columns));
                    node.node_info.insert(
                        "HashFunc".to_owned(),
                        json!(hash_func.clone().unwrap_or_else(|| "HashV1".to_owned())),
                    );
                }
                ConnectionKind::Merge { sort_columns } => {
                    node.type_name = "Merge".to_owned();
                    let columns: Vec<String> = sort_columns
                        .iter()
                        .map(|c| format!("{} ({})", c.column, c.direction))
                        .collect();
                    node.node_info
                        .insert("SortColumns".to_owned(), json!(columns));
                }
                ConnectionKind::StreamLookup {
                    table,
                    columns,
                    lookup_keys,
                    is_join,
                } => {
                    node.type_name = if *is_join {
                        "TableLookupJoin".to_owned()
                    } else {
                        "TableLookup".to_owned()
                    };
                    node.node_info
                        .insert("Table".to_owned(), json!(table.display_name()));
                    node.node_info
                        .insert("Path".to_owned(), json!(table.path));
                    node.node_info
                        .insert("Columns".to_owned(), json!(columns));
                    node.node_info
                        .insert("LookupKeyColumns".to_owned(), json!(lookup_keys));

                    if with_estimates {
                        for (key, value) in estimates_json(connection.stats.as_ref()) {
                            node.opt_estimates.insert(key.to_owned(), value);
                        }
                    }
                }
            }
        }

        if let ConnectionKind::StreamLookup {
            table,
            columns,
            lookup_keys,
            ..
        } = &connection.kind
        {
            self.ctx
                .tables
                .entry(table.display_name().to_owned())
                .or_default()
                .reads
                .push(json!({
                    "type": "Lookup",
                    "columns": columns,
                    "lookup_by": lookup_keys,
                }));
        }

        self.visit_stage(&connection.stage, node_id);
        node_id
    }

    fn visit_source(&mut self, source: &Source, stage_node: u32) -> OperatorInput {
        if let Some(read) = &source.read {
            let operator = self.add_read_operator(stage_node, read, None);
            return OperatorInput::Internal(operator);
        }

        let mut operator = Operator::default();
        operator
            .properties
            .insert("Name".to_owned(), json!("Source"));
        operator
            .properties
            .insert("SourceType".to_owned(), json!(source.source_type));
        if let Some(external) = &source.external_data_source {
            operator
                .properties
                .insert("ExternalDataSource".to_owned(), json!(external));
        }
        if self.ctx.settings.with_estimates() {
            for (key, value) in estimates_json(source.stats.as_ref()) {
                operator.properties.insert(key.to_owned(), value);
            }
        }
        OperatorInput::Internal(self.add_operator(stage_node, "Source", operator))
    }

    /// Classifies and emits one table-read operator, and records the access
    /// in the `tables` section.
    fn add_read_operator(
        &mut self,
        node_id: u32,
        read: &TableReadExpr,
        olap: Option<(&super::expr::OlapFilterExpr, &[String], &[String])>,
    ) -> u32 {
        let read_type = classify_read(read);
        let mut operator = Operator::default();
        operator
            .properties
            .insert("Name".to_owned(), json!(read_type.node_name()));
        operator
            .properties
            .insert("Table".to_owned(), json!(read.table.display_name()));
        operator
            .properties
            .insert("Path".to_owned(), json!(read.table.path));
        operator
            .properties
            .insert("ReadColumns".to_owned(), json!(read.columns));

        let ranges_desc = describe_ranges(read);
        match read_type {
            PlanTableReadType::FullScan | PlanTableReadType::Scan => {
                operator
                    .properties
                    .insert("ReadRanges".to_owned(), ranges_desc.clone());
            }
            PlanTableReadType::Lookup | PlanTableReadType::MultiLookup => {
                operator
                    .properties
                    .insert("ReadRange".to_owned(), ranges_desc.clone());
            }
        }

        if let Some(limit) = &read.limit {
            operator
                .properties
                .insert("ReadLimit".to_owned(), json!(limit));
        }
        if read.reverse {
            operator
                .properties
                .insert("Reverse".to_owned(), json!(true));
        }
        if self.ctx.settings.with_estimates() {
            for (key, value) in estimates_json(read.stats.as_ref()) {
                operator.properties.insert(key.to_owned(), value);
            }
        }

        if let Some((filter, group_by, aggregations)) = olap {
            operator
                .properties
                .insert("SsaProgram".to_owned(), json!(filter.render()));
            if !group_by.is_empty() {
                operator
                    .properties
                    .insert("GroupBy".to_owned(), json!(group_by));
            }
            if !aggregations.is_empty() {
                operator
                    .properties
                    .insert("Aggregation".to_owned(), json!(aggregations));
            }
        }

        self.ctx
            .tables
            .entry(read.table.display_name().to_owned())
            .or_default()
            .reads
            .push(json!({
                "type": read_type.access_name(),
                "columns": read.columns,
                "scan_by": ranges_desc,
                "limit": read.limit,
                "reverse": read.reverse,
            }));

        self.add_operator(node_id, read_type.node_name(), operator)
    }

    /// Operators whose single payload may be a precompute reference; the
    /// reference is kept as a property so plan simplification can substitute
    /// the precompute's subplan.
    fn visit_unary_plumbing(
        &mut self,
        node_id: u32,
        name: &str,
        input: &ExprRef,
        extra: Option<(&str, Value)>,
    ) -> OperatorInput {
        let mut operator = Operator::default();
        operator
            .properties
            .insert("Name".to_owned(), json!(name));
        if let Some((key, value)) = extra {
            operator.properties.insert(key.to_owned(), value);
        }

        if let ExprNode::ResultBinding { tx_id, result_id } = input.as_ref() {
            operator.properties.insert(
                name.to_owned(),
                json!(format!("precompute_{}_{}", tx_id, result_id)),
            );
            let operator_id = self.add_operator(node_id, name, operator);
            self.set_operator_inputs(node_id, operator_id, vec![]);
            return OperatorInput::Internal(operator_id);
        }

        let operator_id = self.add_operator(node_id, name, operator);
        let input = self.visit_expr(input, node_id);
        self.set_operator_inputs(node_id, operator_id, vec![input]);
        OperatorInput::Internal(operator_id)
    }

    fn visit_expr(&mut self, expr: &ExprRef, node_id: u32) -> OperatorInput {
        self.budget -= 1;
        if self.budget <= 0 {
            tracing::debug!("can't build the plan: recursion depth has been exceeded");
            return OperatorInput::Constant;
        }

        match expr.as_ref() {
            ExprNode::Argument { .. } => self
                .arg_bindings
                .get(&(Arc::as_ptr(expr) as usize))
                .cloned()
                .unwrap_or(OperatorInput::Constant),
            ExprNode::Parameter { .. }
            | ExprNode::Literal { .. }
            | ExprNode::ResultBinding { .. } => OperatorInput::Constant,

            ExprNode::ReadTable(read) => {
                OperatorInput::Internal(self.add_read_operator(node_id, read, None))
            }
            ExprNode::ReadOlapTable {
                read,
                filter,
                group_by,
                aggregations,
            } => {
                let olap = filter
                    .as_ref()
                    .map(|f| (f, group_by.as_slice(), aggregations.as_slice()));
                OperatorInput::Internal(match olap {
                    Some(olap) => self.add_read_operator(node_id, read, Some(olap)),
                    None => self.add_read_operator(node_id, read, None),
                })
            }
            ExprNode::Lookup { read, lookup_by } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("TableLookup"));
                operator
                    .properties
                    .insert("Table".to_owned(), json!(read.table.display_name()));
                operator
                    .properties
                    .insert("Columns".to_owned(), json!(read.columns));
                operator
                    .properties
                    .insert("LookupKeyColumns".to_owned(), json!(lookup_by));
                if self.ctx.settings.with_estimates() {
                    for (key, value) in estimates_json(read.stats.as_ref()) {
                        operator.properties.insert(key.to_owned(), value);
                    }
                }
                self.ctx
                    .tables
                    .entry(read.table.display_name().to_owned())
                    .or_default()
                    .reads
                    .push(json!({
                        "type": "Lookup",
                        "columns": read.columns,
                        "lookup_by": lookup_by,
                    }));
                OperatorInput::Internal(self.add_operator(node_id, "TableLookup", operator))
            }

            ExprNode::FlatMap { input, arg, body } => {
                let bound = self.visit_expr(input, node_id);
                self.arg_bindings
                    .insert(Arc::as_ptr(arg) as usize, bound);
                self.visit_expr(body, node_id)
            }

            ExprNode::Filter {
                input,
                predicate,
                pushdown,
            } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("Filter"));
                operator
                    .properties
                    .insert("Predicate".to_owned(), json!(predicate));
                if *pushdown {
                    operator
                        .properties
                        .insert("Pushdown".to_owned(), json!("True"));
                }
                let operator_id = self.add_operator(node_id, "Filter", operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Aggregate {
                input,
                group_by,
                aggregation,
                phase,
            } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("Aggregate"));
                operator
                    .properties
                    .insert("GroupBy".to_owned(), json!(group_by));
                operator
                    .properties
                    .insert("Aggregation".to_owned(), json!(aggregation));
                operator
                    .properties
                    .insert("Phase".to_owned(), json!(phase.to_string()));
                let operator_id = self.add_operator(node_id, "Aggregate", operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Sort { input, sort_by } => {
                let columns: Vec<String> = sort_by
                    .iter()
                    .map(|c| format!("{} ({})", c.column, c.direction))
                    .collect();
                let mut operator = Operator::default();
                operator.properties.insert("Name".to_owned(), json!("Sort"));
                operator
                    .properties
                    .insert("SortBy".to_owned(), json!(columns));
                let operator_id = self.add_operator(node_id, "Sort", operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Top {
                input,
                limit,
                sort_by,
            }
            | ExprNode::TopSort {
                input,
                limit,
                sort_by,
            } => {
                let name = if matches!(expr.as_ref(), ExprNode::Top { .. }) {
                    "Top"
                } else {
                    "TopSort"
                };
                let columns: Vec<String> = sort_by
                    .iter()
                    .map(|c| format!("{} ({})", c.column, c.direction))
                    .collect();
                let mut operator = Operator::default();
                operator.properties.insert("Name".to_owned(), json!(name));
                operator
                    .properties
                    .insert("Limit".to_owned(), json!(limit));
                operator.properties.insert(
                    if name == "Top" { "TopBy" } else { "TopSortBy" }.to_owned(),
                    json!(columns),
                );
                let operator_id = self.add_operator(node_id, name, operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Limit { input, limit } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("Limit"));
                operator
                    .properties
                    .insert("Limit".to_owned(), json!(limit));
                let operator_id = self.add_operator(node_id, "Limit", operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Offset { input, offset } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("Offset"));
                operator
                    .properties
                    .insert("Offset".to_owned(), json!(offset));
                let operator_id = self.add_operator(node_id, "Offset", operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Union { inputs } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("Union"));
                let operator_id = self.add_operator(node_id, "Union", operator);
                let inputs: Vec<_> = inputs
                    .iter()
                    .map(|input| self.visit_expr(input, node_id))
                    .collect();
                self.set_operator_inputs(node_id, operator_id, inputs);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::MapJoin {
                left,
                right,
                join_kind,
            } => self.visit_join(node_id, left, right, join_kind, "MapJoin"),
            ExprNode::JoinDict {
                left,
                right,
                join_kind,
            } => self.visit_join(node_id, left, right, join_kind, "JoinDict"),
            ExprNode::GraceJoin {
                left,
                right,
                join_kind,
                flags: _,
            } => self.visit_join(node_id, left, right, join_kind, "Grace"),
            ExprNode::CrossJoin { left, right } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("CrossJoin"));
                let operator_id = self.add_operator(node_id, "CrossJoin", operator);
                let left = self.visit_expr(left, node_id);
                let right = self.visit_expr(right, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![left, right]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Upsert {
                table,
                input,
                columns,
            } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("Upsert"));
                operator
                    .properties
                    .insert("Table".to_owned(), json!(table.display_name()));
                operator
                    .properties
                    .insert("Columns".to_owned(), json!(columns));
                self.ctx
                    .tables
                    .entry(table.display_name().to_owned())
                    .or_default()
                    .writes
                    .push(json!({"type": "MultiUpsert", "columns": columns}));
                let operator_id = self.add_operator(node_id, "Upsert", operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Delete { table, input } => {
                let mut operator = Operator::default();
                operator
                    .properties
                    .insert("Name".to_owned(), json!("Delete"));
                operator
                    .properties
                    .insert("Table".to_owned(), json!(table.display_name()));
                self.ctx
                    .tables
                    .entry(table.display_name().to_owned())
                    .or_default()
                    .writes
                    .push(json!({"type": "MultiErase"}));
                let operator_id = self.add_operator(node_id, "Delete", operator);
                let input = self.visit_expr(input, node_id);
                self.set_operator_inputs(node_id, operator_id, vec![input]);
                OperatorInput::Internal(operator_id)
            }

            ExprNode::Effects { inputs } => {
                let mut first = OperatorInput::Constant;
                for (index, input) in inputs.iter().enumerate() {
                    let result = self.visit_expr(input, node_id);
                    if index == 0 {
                        first = result;
                    }
                }
                first
            }

            ExprNode::Member { input, name } => self.visit_unary_plumbing(
                node_id,
                "Member",
                input,
                Some(("MemberName", json!(name))),
            ),
            ExprNode::Iterator { input } => {
                self.visit_unary_plumbing(node_id, "Iterator", input, None)
            }
            ExprNode::ToFlow { input } => {
                self.visit_unary_plumbing(node_id, "ToFlow", input, None)
            }
            ExprNode::AssumeSorted { input } => {
                self.visit_unary_plumbing(node_id, "AssumeSorted", input, None)
            }
            ExprNode::CombineByKey { input } => {
                self.visit_unary_plumbing(node_id, "CombineByKey", input, None)
            }
            ExprNode::PartitionByKey { input } => {
                self.visit_unary_plumbing(node_id, "PartitionByKey", input, None)
            }
        }
    }

    fn visit_join(
        &mut self,
        node_id: u32,
        left: &ExprRef,
        right: &ExprRef,
        join_kind: &str,
        algo: &str,
    ) -> OperatorInput {
        let name = format!("{}Join ({})", join_kind, algo);
        let mut operator = Operator::default();
        operator.properties.insert("Name".to_owned(), json!(name));
        let operator_id = self.add_operator(node_id, &name, operator);
        let left = self.visit_expr(left, node_id);
        let right = self.visit_expr(right, node_id);
        self.set_operator_inputs(node_id, operator_id, vec![left, right]);
        OperatorInput::Internal(operator_id)
    }

    fn write_plan_node(&self, alloc_id: u32) -> Value {
        let node = &self.nodes[&alloc_id];
        let mut out = serde_json::Map::new();

        out.insert("PlanNodeId".to_owned(), json!(node.node_id));
        out.insert("Node Type".to_owned(), json!(node.type_name));
        if !node.guid.is_empty() {
            out.insert("StageGuid".to_owned(), json!(node.guid));
        }
        for (key, value) in &node.opt_estimates {
            out.insert(key.clone(), value.clone());
        }
        if let Some(node_type) = node.node_type.as_str() {
            out.insert("PlanNodeType".to_owned(), json!(node_type));
        }
        if let Some(cte_name) = &node.cte_name {
            out.insert("Parent Relationship".to_owned(), json!("InitPlan"));
            out.insert("Subplan Name".to_owned(), json!(format!("CTE {}", cte_name)));
        }
        if let Some(cte_ref_name) = &node.cte_ref_name {
            out.insert("CTE Name".to_owned(), json!(cte_ref_name));
        }
        for (key, value) in &node.node_info {
            out.insert(key.clone(), value.clone());
        }

        if !node.operators.is_empty() {
            let operators: Vec<Value> = node
                .operators
                .iter()
                .map(|operator| {
                    let mut op_out = serde_json::Map::new();
                    for (key, value) in &operator.properties {
                        op_out.insert(key.clone(), value.clone());
                    }
                    let inputs: Vec<Value> = operator
                        .inputs
                        .iter()
                        .map(|input| match input {
                            OperatorInput::Internal(id) => json!({"InternalOperatorId": id}),
                            OperatorInput::External(alloc) => {
                                json!({"ExternalPlanNodeId": self.nodes[alloc].node_id})
                            }
                            OperatorInput::Constant => json!({"Other": "ConstantExpression"}),
                        })
                        .collect();
                    op_out.insert("Inputs".to_owned(), Value::Array(inputs));
                    Value::Object(op_out)
                })
                .collect();
            out.insert("Operators".to_owned(), Value::Array(operators));
        }

        if !node.plans.is_empty() {
            let plans: Vec<Value> = node
                .plans
                .iter()
                .map(|plan_id| self.write_plan_node(*plan_id))
                .collect();
            out.insert("Plans".to_owned(), Value::Array(plans));
        }

        Value::Object(out)
    }
}

/// Serializes the whole query into the stable JSON plan document, with the
/// simplified plan attached.
pub fn serialize_query_plan(query: &QueryExpr, settings: &ExplainSettings) -> String {
    let mut ctx = SerializerCtx {
        tables: BTreeMap::new(),
        precompute_phases: query
            .transactions
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_precompute)
            .map(|(tx_id, _)| tx_id as u32)
            .collect(),
        plan_node_id: 0,
        tx_count: query.transactions.len() as u32,
        settings: settings.clone(),
    };

    let mut tx_plans = Vec::new();
    for (tx_id, tx) in query.transactions.iter().enumerate() {
        let serializer = TxPlanSerializer::new(&mut ctx, tx_id as u32, tx);
        if let Some(plan) = serializer.serialize() {
            tx_plans.push(plan);
        }
    }

    let tables: Vec<Value> = ctx
        .tables
        .iter()
        .map(|(name, info)| {
            let mut table = serde_json::Map::new();
            table.insert("name".to_owned(), json!(name));
            if !info.reads.is_empty() {
                table.insert("reads".to_owned(), Value::Array(info.reads.clone()));
            }
            if !info.writes.is_empty() {
                table.insert("writes".to_owned(), Value::Array(info.writes.clone()));
            }
            Value::Object(table)
        })
        .collect();

    let query_type = match query.query_type {
        ExplainQueryType::Query => "query",
        ExplainQueryType::Script => "script",
    };

    let document = json!({
        "meta": {"version": "0.2", "type": query_type},
        "tables": tables,
        "Plan": {
            "Node Type": "Query",
            "PlanNodeType": "Query",
            "Plans": tx_plans,
        },
    });

    add_simplified_plan(&document.to_string())
}

#[cfg(test)]
mod tests {
    use super::super::expr::*;
    use super::*;

    fn full_range_read(table: &str) -> TableReadExpr {
        TableReadExpr {
            table: TableRefExpr {
                path: format!("/Root/{}", table),
                relative_path: Some(table.to_owned()),
            },
            key_columns: vec!["id".to_owned()],
            columns: vec!["id".to_owned(), "value".to_owned()],
            ranges: RangeBoundsExpr::FullRange,
            reverse: false,
            limit: None,
            stats: None,
        }
    }

    fn scan_stage(guid: &str) -> Arc<Stage> {
        let arg = ExprNode::argument("$source");
        Arc::new(Stage {
            guid: guid.to_owned(),
            args: vec![arg.clone()],
            body: arg,
            inputs: vec![StageInput::Source(Source {
                source_type: "ReadRangesSource".to_owned(),
                external_data_source: None,
                read: Some(full_range_read("T")),
                stats: None,
            })],
            sinks: vec![],
        })
    }

    fn single_result_query(stage: Arc<Stage>) -> QueryExpr {
        QueryExpr {
            transactions: vec![TxExpr {
                stages: vec![stage.clone()],
                results: vec![ResultExpr {
                    connection: Arc::new(Connection {
                        kind: ConnectionKind::Result,
                        stage,
                        stats: None,
                    }),
                }],
                is_precompute: false,
            }],
            query_type: ExplainQueryType::Query,
        }
    }

    fn count_occurrences(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn test_single_stage_scan_plan() {
        let query = single_result_query(scan_stage("stage-guid-1"));
        let text = serialize_query_plan(&query, &ExplainSettings::default());
        let plan: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(plan["meta"]["version"], json!("0.2"));
        assert_eq!(plan["meta"]["type"], json!("query"));
        assert_eq!(plan["Plan"]["Node Type"], json!("Query"));

        let phase = &plan["Plan"]["Plans"][0];
        assert_eq!(phase["Node Type"], json!("Phase"));
        let result = &phase["Plans"][0];
        assert_eq!(result["Node Type"], json!("ResultSet"));
        assert_eq!(result["PlanNodeType"], json!("ResultSet"));

        let stage = &result["Plans"][0];
        assert_eq!(stage["Node Type"], json!("TableFullScan"));
        assert_eq!(stage["StageGuid"], json!("stage-guid-1"));
        let scan_op = &stage["Operators"][0];
        assert_eq!(scan_op["Name"], json!("TableFullScan"));
        assert_eq!(scan_op["ReadRanges"], json!(["id (-∞, +∞)"]));

        // The tables section records the full scan.
        assert_eq!(plan["tables"][0]["name"], json!("T"));
        assert_eq!(plan["tables"][0]["reads"][0]["type"], json!("FullScan"));

        // The simplified view holds a single scan node.
        let simplified = plan["SimplifiedPlan"].to_string();
        assert_eq!(count_occurrences(&simplified, "TableFullScan"), 2); // Node Type + operator
    }

    #[test]
    fn test_hash_shuffle_connection_node() {
        let producer = scan_stage("producer");
        let connection = Arc::new(Connection {
            kind: ConnectionKind::HashShuffle {
                key_columns: vec!["k".to_owned()],
                hash_func: Some("HashV2".to_owned()),
            },
            stage: producer.clone(),
            stats: None,
        });
        let arg = ExprNode::argument("$input");
        let consumer = Arc::new(Stage {
            guid: "consumer".to_owned(),
            args: vec![arg.clone()],
            body: Arc::new(ExprNode::Limit {
                input: arg,
                limit: "10".to_owned(),
            }),
            inputs: vec![StageInput::Connection(connection)],
            sinks: vec![],
        });

        let query = single_result_query(consumer);
        let text = serialize_query_plan(&query, &ExplainSettings::default());
        let plan: Value = serde_json::from_str(&text).unwrap();

        let stage = &plan["Plan"]["Plans"][0]["Plans"][0]["Plans"][0];
        assert_eq!(stage["Node Type"], json!("Limit"));
        let shuffle = &stage["Plans"][0];
        assert_eq!(shuffle["Node Type"], json!("HashShuffle"));
        assert_eq!(shuffle["PlanNodeType"], json!("Connection"));
        assert_eq!(shuffle["KeyColumns"], json!(["k"]));
        assert_eq!(shuffle["HashFunc"], json!("HashV2"));

        // The Limit operator's input references the connection node.
        let limit_op = &stage["Operators"][0];
        assert_eq!(
            limit_op["Inputs"][0]["ExternalPlanNodeId"],
            shuffle["PlanNodeId"]
        );

        // Simplification stringifies the shuffle with its keys.
        let simplified = plan["SimplifiedPlan"].to_string();
        assert!(simplified.contains("HashShuffle (KeyColumns:"), "got: {simplified}");
    }

    #[test]
    fn test_stage_revisit_becomes_cte_reference() {
        let stage = scan_stage("shared");
        let query = QueryExpr {
            transactions: vec![TxExpr {
                stages: vec![stage.clone()],
                results: vec![
                    ResultExpr {
                        connection: Arc::new(Connection {
                            kind: ConnectionKind::Result,
                            stage: stage.clone(),
                            stats: None,
                        }),
                    },
                    ResultExpr {
                        connection: Arc::new(Connection {
                            kind: ConnectionKind::Result,
                            stage,
                            stats: None,
                        }),
                    },
                ],
                is_precompute: false,
            }],
            query_type: ExplainQueryType::Query,
        };

        let text = serialize_query_plan(&query, &ExplainSettings::default());
        let plan: Value = serde_json::from_str(&text).unwrap();

        let phase = &plan["Plan"]["Plans"][0];
        let first = &phase["Plans"][0]["Plans"][0];
        let second = &phase["Plans"][1]["Plans"][0];
        assert!(first["Subplan Name"]
            .as_str()
            .unwrap()
            .starts_with("CTE TableFullScan_"));
        assert_eq!(first["Parent Relationship"], json!("InitPlan"));
        assert!(second["CTE Name"]
            .as_str()
            .unwrap()
            .starts_with("TableFullScan_"));
        // The reference node carries no stage guid of its own.
        assert!(second.get("StageGuid").is_none());
    }

    #[test]
    fn test_point_lookup_classification() {
        let mut read = full_range_read("T");
        read.ranges = RangeBoundsExpr::Ranges(vec![KeyRangeExpr {
            bounds: vec![ColumnBound {
                column: "id".to_owned(),
                from: Some("42".to_owned()),
                from_inclusive: true,
                to: Some("42".to_owned()),
                to_inclusive: true,
            }],
        }]);

        assert_eq!(classify_read(&read), PlanTableReadType::Lookup);

        // Multiple point tuples -> multi-lookup.
        let range = match &read.ranges {
            RangeBoundsExpr::Ranges(r) => r[0].clone(),
            _ => unreachable!(),
        };
        read.ranges = RangeBoundsExpr::Ranges(vec![range.clone(), range]);
        assert_eq!(classify_read(&read), PlanTableReadType::MultiLookup);

        // A half-open bound -> range scan.
        read.ranges = RangeBoundsExpr::Ranges(vec![KeyRangeExpr {
            bounds: vec![ColumnBound {
                column: "id".to_owned(),
                from: Some("10".to_owned()),
                from_inclusive: true,
                to: None,
                to_inclusive: false,
            }],
        }]);
        assert_eq!(classify_read(&read), PlanTableReadType::Scan);
    }

    #[test]
    fn test_range_notation() {
        let bound = ColumnBound {
            column: "id".to_owned(),
            from: Some("10".to_owned()),
            from_inclusive: true,
            to: Some("20".to_owned()),
            to_inclusive: false,
        };
        assert_eq!(bound.describe(), "id [10, 20)");

        let point = ColumnBound {
            column: "id".to_owned(),
            from: Some("7".to_owned()),
            from_inclusive: true,
            to: Some("7".to_owned()),
            to_inclusive: true,
        };
        assert_eq!(point.describe(), "id (7)");

        let unbounded = ColumnBound {
            column: "id".to_owned(),
            ..Default::default()
        };
        assert_eq!(unbounded.describe(), "id (-∞, +∞)");
    }

    #[test]
    fn test_plan_json_round_trips() {
        let query = single_result_query(scan_stage("round-trip"));
        let text = serialize_query_plan(&query, &ExplainSettings::default());
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let reparsed: Value = serde_json::from_str(&parsed.to_string()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_precompute_phase_naming() {
        let stage = scan_stage("pre");
        let query = QueryExpr {
            transactions: vec![
                TxExpr {
                    stages: vec![stage.clone()],
                    results: vec![ResultExpr {
                        connection: Arc::new(Connection {
                            kind: ConnectionKind::Value,
                            stage: stage.clone(),
                            stats: None,
                        }),
                    }],
                    is_precompute: true,
                },
                TxExpr {
                    stages: vec![],
                    results: vec![],
                    is_precompute: false,
                },
            ],
            query_type: ExplainQueryType::Script,
        };

        let text = serialize_query_plan(&query, &ExplainSettings::default());
        let plan: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(plan["meta"]["type"], json!("script"));

        let precompute = &plan["Plan"]["Plans"][0]["Plans"][0];
        assert_eq!(precompute["Node Type"], json!("Precompute_0"));
        assert_eq!(precompute["PlanNodeType"], json!("Materialize"));
        assert_eq!(precompute["Subplan Name"], json!("CTE precompute_0_0"));
    }

    #[test]
    fn test_estimates_attached_when_cbo_enabled() {
        let mut read = full_range_read("T");
        read.stats = Some(CostEstimates {
            rows: 100.0,
            cost: 12.5,
            byte_size: 2048.0,
        });
        let arg = ExprNode::argument("$source");
        let stage = Arc::new(Stage {
            guid: "estimated".to_owned(),
            args: vec![arg.clone()],
            body: arg,
            inputs: vec![StageInput::Source(Source {
                source_type: "ReadRangesSource".to_owned(),
                external_data_source: None,
                read: Some(read),
                stats: None,
            })],
            sinks: vec![],
        });

        let query = single_result_query(stage);
        let settings = ExplainSettings {
            cost_based_optimization_level: 2,
        };
        let text = serialize_query_plan(&query, &settings);
        let plan: Value = serde_json::from_str(&text).unwrap();
        let op = &plan["Plan"]["Plans"][0]["Plans"][0]["Plans"][0]["Operators"][0];
        assert_eq!(op["E-Rows"], json!("100"));
        assert_eq!(op["E-Cost"], json!("12.5"));
        assert_eq!(op["E-Size"], json!("2048"));

        // Without the optimizer, no estimate keys at all.
        let text = serialize_query_plan(&query, &ExplainSettings::default());
        assert!(!text.contains("E-Rows"));
    }
}
