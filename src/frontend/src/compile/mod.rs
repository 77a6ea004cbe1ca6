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

mod actor;
mod host;

pub use actor::{
    extract_most_heavy_read_type, CompileAction, CompileActor, CompileActorResponse,
    CompileEvent, CompileResponse, CompileResult, CompileStats, ParseResponse, SplitResponse,
    TableReadType,
};
pub use host::{
    can_cache_query, AstStatement, AsyncQueryResult, AsyncSplitResult, PhysicalQuery,
    PreparedQuery, PrepareResult, PrepareSettings, QueryHost, QueryId, QuerySyntax, QueryType,
    SplitContext, SplitResult,
};
