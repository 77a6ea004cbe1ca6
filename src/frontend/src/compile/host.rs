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

//! The contract with the external SQL host: parsing, query splitting, and
//! the prepare family. The host owns the AST and the optimizer; the compile
//! actor only drives it.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tidewave_common::error::{Issue, StatusCode};
use tidewave_pb::plan::PhyTx;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    SqlDml,
    AstDml,
    SqlScan,
    AstScan,
    SqlGenericQuery,
    SqlGenericConcurrentQuery,
    SqlGenericScript,
}

impl QueryType {
    pub fn is_sql(&self) -> bool {
        !matches!(self, QueryType::AstDml | QueryType::AstScan)
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryType::SqlDml => "QUERY_TYPE_SQL_DML",
            QueryType::AstDml => "QUERY_TYPE_AST_DML",
            QueryType::SqlScan => "QUERY_TYPE_SQL_SCAN",
            QueryType::AstScan => "QUERY_TYPE_AST_SCAN",
            QueryType::SqlGenericQuery => "QUERY_TYPE_SQL_GENERIC_QUERY",
            QueryType::SqlGenericConcurrentQuery => "QUERY_TYPE_SQL_GENERIC_CONCURRENT_QUERY",
            QueryType::SqlGenericScript => "QUERY_TYPE_SQL_GENERIC_SCRIPT",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QuerySyntax {
    #[default]
    YqlV1,
    Pg,
}

/// Identity of one compile request.
#[derive(Clone, Debug)]
pub struct QueryId {
    pub cluster: String,
    pub database: String,
    pub text: String,
    pub query_type: QueryType,
    pub syntax: QuerySyntax,
    /// Parameter name -> serialized type, when the client declared them.
    pub query_parameter_types: Option<BTreeMap<String, Vec<u8>>>,
}

#[derive(Clone, Debug, Default)]
pub struct PrepareSettings {
    pub document_api_restricted: bool,
    pub is_internal_call: bool,
    pub use_pg_parser: bool,
    pub syntax_version: u16,
    pub concurrent_results: bool,
    pub table_path_prefix: String,
    pub result_rows_limit: Option<u64>,
}

/// One parsed statement. `root` holds the rendered AST; a statement without
/// a root, or with issues attached, failed to parse.
#[derive(Clone, Debug, Default)]
pub struct AstStatement {
    pub root: Option<String>,
    pub issues: Vec<Issue>,
}

impl AstStatement {
    pub fn is_ok(&self) -> bool {
        self.root.is_some() && self.issues.is_empty()
    }
}

/// Host-side context produced by query splitting, fed back into the
/// per-statement prepare calls.
#[derive(Clone, Debug, Default)]
pub struct SplitContext {
    pub statement_count: usize,
}

#[derive(Clone, Debug, Default)]
pub struct SplitResult {
    pub status: StatusCode,
    pub issues: Vec<Issue>,
    pub exprs: Vec<String>,
    pub world: Option<String>,
    pub ctx: SplitContext,
}

/// The compiled physical query: the transaction set plus plan facts the
/// compile service needs for caching decisions.
#[derive(Clone, Debug, Default)]
pub struct PhysicalQuery {
    pub transactions: Vec<Arc<PhyTx>>,
    /// True when the query touches state that invalidates a cached plan
    /// (temporary tables, unstable system views).
    pub has_uncacheable_reads: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PreparedQuery {
    pub physical_query: PhysicalQuery,
}

/// Whether a compiled query may be stored in the compile cache.
pub fn can_cache_query(query: &PhysicalQuery) -> bool {
    !query.has_uncacheable_reads
}

#[derive(Clone, Debug, Default)]
pub struct PrepareResult {
    pub status: StatusCode,
    pub issues: Vec<Issue>,
    pub preparing_query: Option<PreparedQuery>,
    /// JSON plan text, produced by the host's plan serializer.
    pub query_plan: String,
    pub sql_version: Option<u16>,
    pub allow_cache: bool,
    pub need_to_split: bool,
    pub command_tag_name: Option<String>,
}

/// An in-flight host computation, driven cooperatively: each `continue_run`
/// future resolves to whether the computation finished.
pub trait AsyncQueryResult: Send {
    fn continue_run(&mut self) -> BoxFuture<'static, anyhow::Result<bool>>;
    fn take_result(&mut self) -> PrepareResult;
}

pub trait AsyncSplitResult: Send {
    fn continue_run(&mut self) -> BoxFuture<'static, anyhow::Result<bool>>;
    fn take_result(&mut self) -> SplitResult;
}

/// The SQL host. Parsing and optimization live behind this seam.
pub trait QueryHost: Send + Sync {
    fn parse_statements(
        &self,
        query: &QueryId,
        settings: &PrepareSettings,
        per_statement_result: bool,
    ) -> Vec<AstStatement>;

    fn split_query(&self, query: &QueryId, settings: &PrepareSettings)
        -> Box<dyn AsyncSplitResult>;

    fn prepare_data_query(
        &self,
        query: &QueryId,
        settings: &PrepareSettings,
    ) -> Box<dyn AsyncQueryResult>;

    fn prepare_data_query_ast(
        &self,
        query: &QueryId,
        settings: &PrepareSettings,
    ) -> Box<dyn AsyncQueryResult>;

    fn prepare_scan_query(
        &self,
        query: &QueryId,
        is_sql: bool,
        settings: &PrepareSettings,
    ) -> Box<dyn AsyncQueryResult>;

    fn prepare_generic_query(
        &self,
        query: &QueryId,
        settings: &PrepareSettings,
        split_expr: Option<&str>,
    ) -> Box<dyn AsyncQueryResult>;

    fn prepare_generic_script(
        &self,
        query: &QueryId,
        settings: &PrepareSettings,
        split_expr: Option<&str>,
    ) -> Box<dyn AsyncQueryResult>;

    /// Table metadata collected while compiling, serialized, for the replay
    /// log.
    fn collected_scheme_data(&self) -> Vec<Vec<u8>>;
}
