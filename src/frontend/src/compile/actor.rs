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

//! The compile actor: a bounded, timeout-guarded state machine driving one
//! query through parse, split or prepare against the SQL host.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::prelude::{Engine, BASE64_STANDARD};
use tidewave_common::config::{QueryServiceConfig, TableServiceConfig};
use tidewave_common::error::{Issue, StatusCode};
use tokio::sync::mpsc;

use super::host::{
    can_cache_query, AstStatement, AsyncQueryResult, AsyncSplitResult, PrepareResult,
    PrepareSettings, QueryHost, QueryId, QuerySyntax, QueryType, SplitResult,
};

/// Heaviest read the compiled plan performs; drives cache admission and
/// accounting on the caller side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableReadType {
    #[default]
    Other,
    Lookup,
    Scan,
    FullScan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileAction {
    Parse,
    Compile,
    Split,
}

/// The compile actor's two external messages.
#[derive(Debug)]
pub enum CompileEvent {
    ContinueProcess { finished: bool },
    Wakeup,
}

#[derive(Clone, Debug, Default)]
pub struct CompileStats {
    pub from_cache: bool,
    pub duration_us: u64,
    pub cpu_time_us: u64,
}

#[derive(Clone, Debug)]
pub struct CompileResult {
    pub uid: String,
    pub status: StatusCode,
    pub issues: Vec<Issue>,
    pub max_read_type: TableReadType,
    pub query: QueryId,
    pub prepared_query: Option<Arc<super::host::PreparedQuery>>,
    pub allow_cache: bool,
    pub need_to_split: bool,
    pub command_tag_name: Option<String>,
    pub replay_message_user_view: Option<String>,
}

impl CompileResult {
    fn make(uid: &str, status: StatusCode, issues: Vec<Issue>, query: QueryId) -> Self {
        Self {
            uid: uid.to_owned(),
            status,
            issues,
            max_read_type: TableReadType::Other,
            query,
            prepared_query: None,
            allow_cache: false,
            need_to_split: false,
            command_tag_name: None,
            replay_message_user_view: None,
        }
    }
}

#[derive(Debug)]
pub struct ParseResponse {
    pub query: QueryId,
    pub statements: Vec<AstStatement>,
}

#[derive(Debug)]
pub struct SplitResponse {
    pub status: StatusCode,
    pub issues: Vec<Issue>,
    pub query: QueryId,
    pub result: SplitResult,
}

#[derive(Debug)]
pub struct CompileResponse {
    pub result: CompileResult,
    pub replay_message: Option<String>,
    pub stats: CompileStats,
}

/// Replies sent to the actor's owner. Parse replies synchronously; split and
/// compile complete through the host's async drivers.
#[derive(Debug)]
pub enum CompileActorResponse {
    Parse(ParseResponse),
    Split(SplitResponse),
    Compile(Box<CompileResponse>),
}

/// Effective configuration, frozen at actor construction.
#[derive(Clone, Debug)]
struct EffectiveConfig {
    syntax_version: u16,
    result_rows_limit: Option<u64>,
    table_path_prefix: String,
    per_statement_result: bool,
    compile_timeout: Duration,
}

pub struct CompileActor {
    owner: mpsc::UnboundedSender<CompileActorResponse>,
    host: Arc<dyn QueryHost>,
    uid: String,
    query: QueryId,
    action: CompileAction,
    config: EffectiveConfig,
    collect_full_diagnostics: bool,
    split_expr: Option<String>,

    self_tx: mpsc::UnboundedSender<CompileEvent>,
    inbox: mpsc::UnboundedReceiver<CompileEvent>,

    start_time: Instant,
    compile_cpu_time: Duration,
    async_compile_result: Option<Box<dyn AsyncQueryResult>>,
    async_split_result: Option<Box<dyn AsyncSplitResult>>,
    compile_result: Option<CompileResult>,
    replay_message: Option<String>,
    replay_message_user_view: Option<String>,
}

impl CompileActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: mpsc::UnboundedSender<CompileActorResponse>,
        host: Arc<dyn QueryHost>,
        uid: String,
        query: QueryId,
        action: CompileAction,
        table_service_config: &TableServiceConfig,
        query_service_config: &QueryServiceConfig,
        per_statement_result: bool,
        collect_full_diagnostics: bool,
        split_expr: Option<String>,
    ) -> Self {
        // Snapshot the service configuration; the actor never observes later
        // config changes.
        let mut result_rows_limit = None;
        if matches!(
            query.query_type,
            QueryType::SqlGenericScript | QueryType::SqlGenericQuery
        ) && query_service_config.script_result_rows_limit > 0
        {
            result_rows_limit = Some(query_service_config.script_result_rows_limit);
        }

        let config = EffectiveConfig {
            syntax_version: table_service_config.default_syntax_version,
            result_rows_limit,
            table_path_prefix: query.database.clone(),
            per_statement_result: per_statement_result
                && table_service_config.enable_per_statement_query_execution,
            compile_timeout: Duration::from_millis(table_service_config.compile_timeout_ms),
        };

        let (self_tx, inbox) = mpsc::unbounded_channel();
        Self {
            owner,
            host,
            uid,
            query,
            action,
            config,
            collect_full_diagnostics,
            split_expr,
            self_tx,
            inbox,
            start_time: Instant::now(),
            compile_cpu_time: Duration::ZERO,
            async_compile_result: None,
            async_split_result: None,
            compile_result: None,
            replay_message: None,
            replay_message_user_view: None,
        }
    }

    fn prepare_settings(&self) -> PrepareSettings {
        PrepareSettings {
            use_pg_parser: self.query.syntax == QuerySyntax::Pg,
            syntax_version: match self.query.syntax {
                QuerySyntax::YqlV1 => 1,
                QuerySyntax::Pg => self.config.syntax_version,
            },
            concurrent_results: true,
            table_path_prefix: self.config.table_path_prefix.clone(),
            result_rows_limit: self.config.result_rows_limit,
            ..Default::default()
        }
    }

    /// Runs the actor to completion. Exactly one response is sent to the
    /// owner, then the actor passes away.
    pub async fn run(mut self) {
        match self.action {
            CompileAction::Parse => {
                self.start_parsing();
                return;
            }
            CompileAction::Compile => self.start_compilation(),
            CompileAction::Split => self.start_splitting(),
        }

        let timeout = tokio::time::sleep(self.config.compile_timeout);
        tokio::pin!(timeout);

        loop {
            let event = tokio::select! {
                _ = &mut timeout => CompileEvent::Wakeup,
                event = self.inbox.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            let finished = match (self.action, event) {
                (_, CompileEvent::Wakeup) => {
                    self.handle_timeout();
                    true
                }
                (CompileAction::Compile, CompileEvent::ContinueProcess { finished }) => {
                    self.handle_compile(finished)
                }
                (CompileAction::Split, CompileEvent::ContinueProcess { finished }) => {
                    self.handle_split(finished)
                }
                (CompileAction::Parse, _) => {
                    self.internal_error("unexpected event in parse state".to_owned());
                    true
                }
            };

            if finished {
                return;
            }
        }
    }

    fn start_parsing(&mut self) {
        let settings = self.prepare_settings();
        let statements = self.host.parse_statements(
            &self.query,
            &settings,
            self.config.per_statement_result,
        );
        self.reply_parse_result(statements);
    }

    fn start_splitting(&mut self) {
        let settings = self.prepare_settings();
        let mut driver = self.host.split_query(&self.query, &settings);
        self.arm_continue(driver.continue_run());
        self.async_split_result = Some(driver);
    }

    fn start_compilation(&mut self) {
        self.start_time = Instant::now();
        tracing::debug!(
            cluster = %self.query.cluster,
            database = %self.query.database,
            text = %self.query.text.escape_default(),
            "start compilation"
        );

        let settings = {
            let mut settings = self.prepare_settings();
            if self.query.query_type == QueryType::SqlGenericQuery {
                settings.concurrent_results = false;
            }
            settings
        };

        let timer = Instant::now();
        let mut driver = match self.query.query_type {
            QueryType::SqlDml => self.host.prepare_data_query(&self.query, &settings),
            QueryType::AstDml => self.host.prepare_data_query_ast(&self.query, &settings),
            QueryType::SqlScan | QueryType::AstScan => {
                self.host
                    .prepare_scan_query(&self.query, self.query.query_type.is_sql(), &settings)
            }
            QueryType::SqlGenericQuery | QueryType::SqlGenericConcurrentQuery => self
                .host
                .prepare_generic_query(&self.query, &settings, self.split_expr.as_deref()),
            QueryType::SqlGenericScript => self.host.prepare_generic_script(
                &self.query,
                &settings,
                self.split_expr.as_deref(),
            ),
        };
        self.compile_cpu_time += timer.elapsed();

        self.arm_continue(driver.continue_run());
        self.async_compile_result = Some(driver);
    }

    /// Re-arms the actor on the async driver: the continuation posts a
    /// `ContinueProcess` back to the inbox.
    fn arm_continue(
        &self,
        future: futures::future::BoxFuture<'static, anyhow::Result<bool>>,
    ) {
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let event = match future.await {
                Ok(finished) => CompileEvent::ContinueProcess { finished },
                Err(error) => {
                    tracing::error!(%error, "host continuation failed");
                    // Force completion; the result carries the failure.
                    CompileEvent::ContinueProcess { finished: true }
                }
            };
            let _ = self_tx.send(event);
        });
    }

    fn handle_split(&mut self, finished: bool) -> bool {
        if !finished {
            let future = self
                .async_split_result
                .as_mut()
                .expect("split driver exists in split state")
                .continue_run();
            self.arm_continue(future);
            return false;
        }

        let result = self
            .async_split_result
            .as_mut()
            .expect("split driver exists in split state")
            .take_result();
        tracing::debug!(
            status = %result.status,
            issues = %tidewave_common::error::issues_to_one_line(&result.issues),
            "send split result"
        );
        let _ = self.owner.send(CompileActorResponse::Split(SplitResponse {
            status: result.status,
            issues: result.issues.clone(),
            query: self.query.clone(),
            result,
        }));
        true
    }

    fn handle_compile(&mut self, finished: bool) -> bool {
        if !finished {
            let timer = Instant::now();
            let future = self
                .async_compile_result
                .as_mut()
                .expect("compile driver exists in compile state")
                .continue_run();
            self.arm_continue(future);
            self.compile_cpu_time += timer.elapsed();
            return false;
        }

        let result = self
            .async_compile_result
            .as_mut()
            .expect("compile driver exists in compile state")
            .take_result();
        self.process_compile_result(result);
        true
    }

    fn process_compile_result(&mut self, result: PrepareResult) {
        let status = result.status;

        if result.need_to_split {
            let mut compile_result =
                CompileResult::make(&self.uid, status, result.issues, self.query.clone());
            compile_result.need_to_split = true;
            self.compile_result = Some(compile_result);
            self.reply();
            return;
        }

        if status == StatusCode::Success {
            self.add_message_to_replay_log(&result.query_plan);
        }

        let max_read_type = extract_most_heavy_read_type(&result.query_plan);

        let mut compile_result =
            CompileResult::make(&self.uid, status, result.issues.clone(), self.query.clone());
        compile_result.max_read_type = max_read_type;
        compile_result.command_tag_name = result.command_tag_name.clone();

        if status == StatusCode::Success {
            let preparing_query = result
                .preparing_query
                .expect("successful prepare carries a query");
            compile_result.allow_cache =
                can_cache_query(&preparing_query.physical_query) && result.allow_cache;
            compile_result.prepared_query = Some(Arc::new(preparing_query));

            tracing::debug!(
                duration = ?self.start_time.elapsed(),
                "compilation successful"
            );
        } else {
            if let Some(preparing_query) = result.preparing_query {
                compile_result.allow_cache = false;
                compile_result.prepared_query = Some(Arc::new(preparing_query));
            }
            tracing::error!(
                status = %status,
                issues = %tidewave_common::error::issues_to_one_line(&result.issues),
                "compilation failed"
            );
        }

        self.compile_result = Some(compile_result);
        self.reply();
    }

    fn add_message_to_replay_log(&mut self, query_plan: &str) {
        let mut replay_message = serde_json::Map::new();

        let collected_scheme_data = self.host.collected_scheme_data();
        let tables_meta: Vec<serde_json::Value> = collected_scheme_data
            .iter()
            .map(|proto| serde_json::Value::String(BASE64_STANDARD.encode(proto)))
            .collect();

        replay_message.insert("query_id".into(), self.uid.clone().into());
        replay_message.insert("version".into(), "1.0".into());

        let mut query_parameter_types = serde_json::Map::new();
        if let Some(parameter_types) = &self.query.query_parameter_types {
            for (name, ty) in parameter_types {
                query_parameter_types
                    .insert(name.clone(), BASE64_STANDARD.encode(ty).into());
            }
        }
        replay_message.insert(
            "query_parameter_types".into(),
            query_parameter_types.into(),
        );
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        replay_message.insert("created_at".into(), created_at.to_string().into());
        replay_message.insert(
            "query_syntax".into(),
            self.config.syntax_version.to_string().into(),
        );
        replay_message.insert("query_database".into(), self.query.database.clone().into());
        replay_message.insert("query_cluster".into(), self.query.cluster.clone().into());
        replay_message.insert(
            "query_type".into(),
            self.query.query_type.to_string().into(),
        );

        if self.collect_full_diagnostics {
            // The human-readable variant keeps the metadata inline.
            let mut user_view = replay_message.clone();
            user_view.insert(
                "table_metadata".into(),
                serde_json::Value::Array(tables_meta.clone()),
            );
            user_view.insert("table_meta_serialization_type".into(), "Json".into());
            self.replay_message_user_view =
                Some(serde_json::Value::Object(user_view).to_string());
        }

        replay_message.insert("query_plan".into(), query_plan.into());
        replay_message.insert(
            "query_text".into(),
            self.query.text.escape_default().to_string().into(),
        );
        replay_message.insert(
            "table_metadata".into(),
            serde_json::Value::Array(tables_meta).to_string().into(),
        );
        replay_message.insert(
            "table_meta_serialization_type".into(),
            "EncodedProto".into(),
        );

        let message = serde_json::Value::Object(replay_message).to_string();
        tracing::debug!(message = %message, "built the replay message");
        self.replay_message = Some(message);
    }

    fn reply(&mut self) {
        let mut result = self
            .compile_result
            .take()
            .expect("compile result must be filled before replying");
        tracing::debug!(
            status = %result.status,
            uid = %result.uid,
            issues = %tidewave_common::error::issues_to_one_line(&result.issues),
            "send response"
        );

        result.replay_message_user_view = self.replay_message_user_view.take();
        let stats = CompileStats {
            from_cache: false,
            duration_us: self.start_time.elapsed().as_micros() as u64,
            cpu_time_us: self.compile_cpu_time.as_micros() as u64,
        };
        let _ = self
            .owner
            .send(CompileActorResponse::Compile(Box::new(CompileResponse {
                result,
                replay_message: self.replay_message.take(),
                stats,
            })));
    }

    fn reply_error(&mut self, status: StatusCode, issues: Vec<Issue>) {
        self.compile_result = Some(CompileResult::make(
            &self.uid,
            status,
            issues,
            self.query.clone(),
        ));
        self.reply();
    }

    fn internal_error(&mut self, message: String) {
        tracing::error!(message = %message, "internal error");
        let issue = Issue::new("Internal error while compiling query.")
            .with_sub_issue(Issue::new(message));
        self.reply_error(StatusCode::InternalError, vec![issue]);
    }

    fn reply_parse_result(&mut self, statements: Vec<AstStatement>) {
        if statements.is_empty() {
            let issue = Issue::new("Parsing result of query is empty");
            self.reply_error(StatusCode::InternalError, vec![issue]);
            return;
        }

        for (statement_id, statement) in statements.iter().enumerate() {
            if !statement.is_ok() {
                tracing::error!(statement_id, "got parsing result with error");
                let mut issue = Issue::new("Error while parsing query.");
                for sub_issue in &statement.issues {
                    issue.add_sub_issue(sub_issue.clone());
                }
                self.reply_error(StatusCode::InternalError, vec![issue]);
                return;
            }
        }

        tracing::debug!(statements = statements.len(), "send parsing result");
        let _ = self.owner.send(CompileActorResponse::Parse(ParseResponse {
            query: self.query.clone(),
            statements,
        }));
    }

    fn handle_timeout(&mut self) {
        tracing::warn!(
            cluster = %self.query.cluster,
            database = %self.query.database,
            "compilation timeout"
        );
        let issue = Issue::new("Query compilation timed out.");
        self.reply_error(StatusCode::Timeout, vec![issue]);
    }
}

/// Scans the plan text for the heaviest read the query performs.
pub fn extract_most_heavy_read_type(query_plan: &str) -> TableReadType {
    if query_plan.contains("TableFullScan") {
        TableReadType::FullScan
    } else if query_plan.contains("TableRangeScan") {
        TableReadType::Scan
    } else if query_plan.contains("TablePointLookup") || query_plan.contains("TableLookup") {
        TableReadType::Lookup
    } else {
        TableReadType::Other
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::FutureExt;
    use parking_lot::Mutex;

    use super::*;

    struct NeverFinishes;

    impl AsyncQueryResult for NeverFinishes {
        fn continue_run(&mut self) -> futures::future::BoxFuture<'static, anyhow::Result<bool>> {
            async {
                // Pretend to make progress forever.
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(false)
            }
            .boxed()
        }

        fn take_result(&mut self) -> PrepareResult {
            unreachable!("never finishes")
        }
    }

    struct FinishesWith(Mutex<Option<PrepareResult>>);

    impl AsyncQueryResult for FinishesWith {
        fn continue_run(&mut self) -> futures::future::BoxFuture<'static, anyhow::Result<bool>> {
            async { Ok(true) }.boxed()
        }

        fn take_result(&mut self) -> PrepareResult {
            self.0.lock().take().expect("result taken once")
        }
    }

    struct MockHost {
        result: Mutex<Option<PrepareResult>>,
        statements: Vec<AstStatement>,
        hang: bool,
    }

    impl MockHost {
        fn finishing(result: PrepareResult) -> Self {
            Self {
                result: Mutex::new(Some(result)),
                statements: vec![],
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                result: Mutex::new(None),
                statements: vec![],
                hang: true,
            }
        }

        fn parsing(statements: Vec<AstStatement>) -> Self {
            Self {
                result: Mutex::new(None),
                statements,
                hang: false,
            }
        }

        fn make_driver(&self) -> Box<dyn AsyncQueryResult> {
            if self.hang {
                Box::new(NeverFinishes)
            } else {
                Box::new(FinishesWith(Mutex::new(self.result.lock().take())))
            }
        }
    }

    impl QueryHost for MockHost {
        fn parse_statements(
            &self,
            _query: &QueryId,
            _settings: &PrepareSettings,
            _per_statement_result: bool,
        ) -> Vec<AstStatement> {
            self.statements.clone()
        }

        fn split_query(
            &self,
            _query: &QueryId,
            _settings: &PrepareSettings,
        ) -> Box<dyn AsyncSplitResult> {
            struct Split;
            impl AsyncSplitResult for Split {
                fn continue_run(
                    &mut self,
                ) -> futures::future::BoxFuture<'static, anyhow::Result<bool>> {
                    async { Ok(true) }.boxed()
                }

                fn take_result(&mut self) -> SplitResult {
                    SplitResult {
                        exprs: vec!["statement".to_owned()],
                        ..Default::default()
                    }
                }
            }
            Box::new(Split)
        }

        fn prepare_data_query(
            &self,
            _query: &QueryId,
            _settings: &PrepareSettings,
        ) -> Box<dyn AsyncQueryResult> {
            self.make_driver()
        }

        fn prepare_data_query_ast(
            &self,
            _query: &QueryId,
            _settings: &PrepareSettings,
        ) -> Box<dyn AsyncQueryResult> {
            self.make_driver()
        }

        fn prepare_scan_query(
            &self,
            _query: &QueryId,
            _is_sql: bool,
            _settings: &PrepareSettings,
        ) -> Box<dyn AsyncQueryResult> {
            self.make_driver()
        }

        fn prepare_generic_query(
            &self,
            _query: &QueryId,
            _settings: &PrepareSettings,
            _split_expr: Option<&str>,
        ) -> Box<dyn AsyncQueryResult> {
            self.make_driver()
        }

        fn prepare_generic_script(
            &self,
            _query: &QueryId,
            _settings: &PrepareSettings,
            _split_expr: Option<&str>,
        ) -> Box<dyn AsyncQueryResult> {
            self.make_driver()
        }

        fn collected_scheme_data(&self) -> Vec<Vec<u8>> {
            vec![b"table-meta".to_vec()]
        }
    }

    fn query() -> QueryId {
        QueryId {
            cluster: "local".to_owned(),
            database: "/Root".to_owned(),
            text: "SELECT 1".to_owned(),
            query_type: QueryType::SqlDml,
            syntax: QuerySyntax::YqlV1,
            query_parameter_types: None,
        }
    }

    fn spawn_actor(
        host: Arc<dyn QueryHost>,
        action: CompileAction,
        config: TableServiceConfig,
    ) -> mpsc::UnboundedReceiver<CompileActorResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = CompileActor::new(
            tx,
            host,
            "uid-1".to_owned(),
            query(),
            action,
            &config,
            &QueryServiceConfig::default(),
            false,
            false,
            None,
        );
        tokio::spawn(actor.run());
        rx
    }

    #[tokio::test]
    async fn test_compile_success_builds_replay_log() {
        let result = PrepareResult {
            status: StatusCode::Success,
            preparing_query: Some(Default::default()),
            query_plan: r#"{"Plan":{"Node Type":"Query"}}"#.to_owned(),
            allow_cache: true,
            ..Default::default()
        };
        let host = Arc::new(MockHost::finishing(result));
        let mut rx = spawn_actor(host, CompileAction::Compile, TableServiceConfig::default());

        let response = rx.recv().await.unwrap();
        let compile = assert_matches!(response, CompileActorResponse::Compile(c) => c);
        assert_eq!(compile.result.status, StatusCode::Success);
        assert!(compile.result.allow_cache);
        assert!(!compile.stats.from_cache);

        let replay: serde_json::Value =
            serde_json::from_str(compile.replay_message.as_ref().unwrap()).unwrap();
        assert_eq!(replay["version"], "1.0");
        assert_eq!(replay["query_type"], "QUERY_TYPE_SQL_DML");
        assert_eq!(replay["query_text"], "SELECT 1");
        assert_eq!(replay["table_meta_serialization_type"], "EncodedProto");
    }

    #[tokio::test]
    async fn test_compile_timeout() {
        let config = TableServiceConfig {
            compile_timeout_ms: 10,
            ..Default::default()
        };
        let host = Arc::new(MockHost::hanging());
        let mut rx = spawn_actor(host, CompileAction::Compile, config);

        let response = rx.recv().await.unwrap();
        let compile = assert_matches!(response, CompileActorResponse::Compile(c) => c);
        assert_eq!(compile.result.status, StatusCode::Timeout);
        assert_eq!(compile.result.issues[0].message, "Query compilation timed out.");
        // The actor is gone after replying.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_parse_result_is_internal_error() {
        let host = Arc::new(MockHost::parsing(vec![]));
        let mut rx = spawn_actor(host, CompileAction::Parse, TableServiceConfig::default());

        let response = rx.recv().await.unwrap();
        let compile = assert_matches!(response, CompileActorResponse::Compile(c) => c);
        assert_eq!(compile.result.status, StatusCode::InternalError);
    }

    #[tokio::test]
    async fn test_parse_issue_wraps_statement_issues() {
        let statement = AstStatement {
            root: None,
            issues: vec![Issue::new("syntax error near SELEC")],
        };
        let host = Arc::new(MockHost::parsing(vec![statement]));
        let mut rx = spawn_actor(host, CompileAction::Parse, TableServiceConfig::default());

        let response = rx.recv().await.unwrap();
        let compile = assert_matches!(response, CompileActorResponse::Compile(c) => c);
        assert_eq!(compile.result.status, StatusCode::InternalError);
        assert_eq!(
            compile.result.issues[0].issues[0].message,
            "syntax error near SELEC"
        );
    }

    #[tokio::test]
    async fn test_split_reply() {
        let host = Arc::new(MockHost::parsing(vec![]));
        let mut rx = spawn_actor(host, CompileAction::Split, TableServiceConfig::default());

        let response = rx.recv().await.unwrap();
        let split = assert_matches!(response, CompileActorResponse::Split(s) => s);
        assert_eq!(split.status, StatusCode::Success);
        assert_eq!(split.result.exprs, vec!["statement".to_owned()]);
    }

    #[tokio::test]
    async fn test_need_to_split_propagates() {
        let result = PrepareResult {
            status: StatusCode::Success,
            need_to_split: true,
            ..Default::default()
        };
        let host = Arc::new(MockHost::finishing(result));
        let mut rx = spawn_actor(host, CompileAction::Compile, TableServiceConfig::default());

        let response = rx.recv().await.unwrap();
        let compile = assert_matches!(response, CompileActorResponse::Compile(c) => c);
        assert!(compile.result.need_to_split);
        assert!(compile.result.prepared_query.is_none());
    }

    #[test]
    fn test_extract_most_heavy_read_type() {
        assert_eq!(
            extract_most_heavy_read_type(r#"{"Node Type":"TableFullScan"}"#),
            TableReadType::FullScan
        );
        assert_eq!(
            extract_most_heavy_read_type(r#"{"Node Type":"Limit-TableRangeScan"}"#),
            TableReadType::Scan
        );
        assert_eq!(
            extract_most_heavy_read_type(r#"{"Node Type":"TablePointLookup"}"#),
            TableReadType::Lookup
        );
        assert_eq!(extract_most_heavy_read_type("{}"), TableReadType::Other);
    }
}
