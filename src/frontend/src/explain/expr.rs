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

//! The optimized-query expression tree handed to the plan serializer.
//!
//! The tree is a sum type walked by structural matching. Lambda arguments
//! are plain `Argument` nodes; they bind by object identity (the `Arc`
//! pointer), which is what the serializer's argument context keys on.

use std::sync::Arc;

pub type ExprRef = Arc<ExprNode>;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CostEstimates {
    pub rows: f64,
    pub cost: f64,
    pub byte_size: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableRefExpr {
    pub path: String,
    /// Path relative to the database root, preferred in plans.
    pub relative_path: Option<String>,
}

impl TableRefExpr {
    pub fn display_name(&self) -> &str {
        self.relative_path.as_deref().unwrap_or(&self.path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl std::fmt::Display for SortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "Asc"),
            SortDirection::Desc => write!(f, "Desc"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SortColumnExpr {
    pub column: String,
    pub direction: SortDirection,
}

/// One column's bounds within a key range. `None` means unbounded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnBound {
    pub column: String,
    pub from: Option<String>,
    pub from_inclusive: bool,
    pub to: Option<String>,
    pub to_inclusive: bool,
}

impl ColumnBound {
    pub fn is_point(&self) -> bool {
        self.from.is_some()
            && self.from == self.to
            && self.from_inclusive
            && self.to_inclusive
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    /// Mathematical notation: `col [a, b)`, `col (a)` for points,
    /// `col (-∞, +∞)` for unbounded.
    pub fn describe(&self) -> String {
        if self.is_point() {
            return format!("{} ({})", self.column, self.from.as_deref().unwrap());
        }
        let open = if self.from.is_none() || !self.from_inclusive {
            '('
        } else {
            '['
        };
        let close = if self.to.is_none() || !self.to_inclusive {
            ')'
        } else {
            ']'
        };
        format!(
            "{} {}{}, {}{}",
            self.column,
            open,
            self.from.as_deref().unwrap_or("-∞"),
            self.to.as_deref().unwrap_or("+∞"),
            close
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyRangeExpr {
    pub bounds: Vec<ColumnBound>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RangeBoundsExpr {
    /// Every key part is unbounded.
    FullRange,
    Ranges(Vec<KeyRangeExpr>),
    /// Ranges bound to a prior transaction's result.
    ResultBinding { tx_id: u32, result_id: u32 },
    Void,
}

/// A table read, before classification into scan or lookup flavors.
#[derive(Clone, Debug, PartialEq)]
pub struct TableReadExpr {
    pub table: TableRefExpr,
    pub key_columns: Vec<String>,
    pub columns: Vec<String>,
    pub ranges: RangeBoundsExpr,
    pub reverse: bool,
    pub limit: Option<String>,
    pub stats: Option<CostEstimates>,
}

/// Column-shard SSA filters, rendered as a compact SQL-ish expression.
#[derive(Clone, Debug, PartialEq)]
pub enum OlapFilterExpr {
    Cmp {
        column: String,
        op: String,
        value: String,
    },
    Exists {
        column: String,
    },
    And(Vec<OlapFilterExpr>),
    Or(Vec<OlapFilterExpr>),
    Not(Box<OlapFilterExpr>),
}

impl OlapFilterExpr {
    pub fn render(&self) -> String {
        match self {
            OlapFilterExpr::Cmp { column, op, value } => {
                format!("{} {} {}", column, op, value)
            }
            OlapFilterExpr::Exists { column } => format!("Exist({})", column),
            OlapFilterExpr::And(items) => items
                .iter()
                .map(|i| i.render_nested())
                .collect::<Vec<_>>()
                .join(" AND "),
            OlapFilterExpr::Or(items) => items
                .iter()
                .map(|i| i.render_nested())
                .collect::<Vec<_>>()
                .join(" OR "),
            OlapFilterExpr::Not(inner) => format!("NOT {}", inner.render_nested()),
        }
    }

    fn render_nested(&self) -> String {
        match self {
            OlapFilterExpr::And(_) | OlapFilterExpr::Or(_) => format!("({})", self.render()),
            _ => self.render(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationPhase {
    Intermediate,
    Final,
}

impl std::fmt::Display for AggregationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationPhase::Intermediate => write!(f, "Intermediate"),
            AggregationPhase::Final => write!(f, "Final"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionKind {
    UnionAll,
    Broadcast,
    Map,
    HashShuffle {
        key_columns: Vec<String>,
        hash_func: Option<String>,
    },
    Merge {
        sort_columns: Vec<SortColumnExpr>,
    },
    StreamLookup {
        table: TableRefExpr,
        columns: Vec<String>,
        lookup_keys: Vec<String>,
        /// Tuple-typed input: a lookup join rather than a plain lookup.
        is_join: bool,
    },
    ParallelUnionAll,
    Sequencer,
    Result,
    Value,
}

#[derive(Debug)]
pub struct Connection {
    pub kind: ConnectionKind,
    /// The producing stage.
    pub stage: Arc<Stage>,
    pub stats: Option<CostEstimates>,
}

#[derive(Clone, Debug)]
pub struct Source {
    pub source_type: String,
    pub external_data_source: Option<String>,
    /// Set for table read-ranges sources.
    pub read: Option<TableReadExpr>,
    pub stats: Option<CostEstimates>,
}

#[derive(Clone, Debug)]
pub struct Sink {
    pub sink_type: String,
    pub table: Option<TableRefExpr>,
    pub mode: Option<String>,
    pub external_data_sink: Option<String>,
}

#[derive(Debug)]
pub enum StageInput {
    Connection(Arc<Connection>),
    Source(Source),
}

/// One stage: a program lambda over positional inputs.
#[derive(Debug)]
pub struct Stage {
    pub guid: String,
    /// Argument nodes, positionally aligned with `inputs`.
    pub args: Vec<ExprRef>,
    pub body: ExprRef,
    pub inputs: Vec<StageInput>,
    pub sinks: Vec<Sink>,
}

#[derive(Debug)]
pub struct ResultExpr {
    pub connection: Arc<Connection>,
}

#[derive(Debug)]
pub struct TxExpr {
    pub stages: Vec<Arc<Stage>>,
    pub results: Vec<ResultExpr>,
    /// The result of this transaction is materialized and referenced by
    /// later transactions.
    pub is_precompute: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExplainQueryType {
    Query,
    Script,
}

#[derive(Debug)]
pub struct QueryExpr {
    pub transactions: Vec<TxExpr>,
    pub query_type: ExplainQueryType,
}

#[derive(Debug)]
pub enum ExprNode {
    Argument {
        name: String,
    },
    Parameter {
        name: String,
    },
    Literal {
        text: String,
    },
    /// A reference to a prior transaction's materialized result.
    ResultBinding {
        tx_id: u32,
        result_id: u32,
    },
    ReadTable(TableReadExpr),
    ReadOlapTable {
        read: TableReadExpr,
        filter: Option<OlapFilterExpr>,
        group_by: Vec<String>,
        aggregations: Vec<String>,
    },
    Lookup {
        read: TableReadExpr,
        lookup_by: Vec<String>,
    },
    FlatMap {
        input: ExprRef,
        arg: ExprRef,
        body: ExprRef,
    },
    Filter {
        input: ExprRef,
        predicate: String,
        pushdown: bool,
    },
    Aggregate {
        input: ExprRef,
        group_by: Vec<String>,
        aggregation: String,
        phase: AggregationPhase,
    },
    Sort {
        input: ExprRef,
        sort_by: Vec<SortColumnExpr>,
    },
    Top {
        input: ExprRef,
        limit: String,
        sort_by: Vec<SortColumnExpr>,
    },
    TopSort {
        input: ExprRef,
        limit: String,
        sort_by: Vec<SortColumnExpr>,
    },
    Limit {
        input: ExprRef,
        limit: String,
    },
    Offset {
        input: ExprRef,
        offset: String,
    },
    Union {
        inputs: Vec<ExprRef>,
    },
    MapJoin {
        left: ExprRef,
        right: ExprRef,
        join_kind: String,
    },
    JoinDict {
        left: ExprRef,
        right: ExprRef,
        join_kind: String,
    },
    GraceJoin {
        left: ExprRef,
        right: ExprRef,
        join_kind: String,
        flags: Vec<String>,
    },
    CrossJoin {
        left: ExprRef,
        right: ExprRef,
    },
    Upsert {
        table: TableRefExpr,
        input: ExprRef,
        columns: Vec<String>,
    },
    Delete {
        table: TableRefExpr,
        input: ExprRef,
    },
    Effects {
        inputs: Vec<ExprRef>,
    },
    Member {
        input: ExprRef,
        name: String,
    },
    Iterator {
        input: ExprRef,
    },
    ToFlow {
        input: ExprRef,
    },
    AssumeSorted {
        input: ExprRef,
    },
    CombineByKey {
        input: ExprRef,
    },
    PartitionByKey {
        input: ExprRef,
    },
}

impl ExprNode {
    pub fn argument(name: impl Into<String>) -> ExprRef {
        Arc::new(ExprNode::Argument { name: name.into() })
    }
}
