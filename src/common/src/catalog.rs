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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::types::TypeId;

/// Stable identity of a table: path id plus the schema version the plan was
/// compiled against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TableId {
    pub owner_id: u64,
    pub local_id: u64,
    pub schema_version: u64,
}

impl TableId {
    pub fn new(owner_id: u64, local_id: u64, schema_version: u64) -> Self {
        Self {
            owner_id,
            local_id,
            schema_version,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}]",
            self.owner_id, self.local_id, self.schema_version
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TableKind {
    #[default]
    Unknown,
    Datashard,
    Olap,
    SysView,
    External,
}

/// Row operations a stage performs against its table's shards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShardOperation {
    Read,
    Update,
    Erase,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnMetadata {
    pub id: u32,
    pub name: String,
    pub type_id: TypeId,
}

/// Immutable table facts resolved at compile time and shared by every stage
/// that touches the table.
#[derive(Clone, Debug, Default)]
pub struct TableConstInfo {
    pub path: String,
    pub key_columns: Vec<String>,
    pub columns: BTreeMap<String, ColumnMetadata>,
    /// Auto-increment columns backed by a sequence: column -> (path, path id).
    pub sequences: HashMap<String, (String, u64)>,
    /// Auto-increment columns backed by a literal default value.
    pub default_from_literal: HashMap<String, Vec<u8>>,
    pub table_kind: TableKind,
    pub sys_view_info: Option<String>,
}

pub type TableConstInfoRef = Arc<TableConstInfo>;

impl TableConstInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.get(name)
    }

    pub fn key_column_types(&self) -> Vec<TypeId> {
        self.key_columns
            .iter()
            .filter_map(|name| self.columns.get(name).map(|c| c.type_id))
            .collect()
    }
}
