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

//! EXPLAIN/ANALYZE plan serialization: the full JSON plan, its simplified
//! view, and the execution-statistics overlay.

pub mod expr;

mod exec_stats;
mod plan;
mod simplify;

pub use exec_stats::{add_exec_stats_to_tx_plan, modify_plan};
pub use plan::{serialize_query_plan, ExplainSettings};
pub use simplify::{add_simplified_plan, simplify_query_plan};
