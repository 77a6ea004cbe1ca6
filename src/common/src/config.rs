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

//! Service configuration for the query pipeline. Every knob names its
//! effect; unknown fields are rejected so that typos in deployment configs
//! surface early.

use serde::Deserialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockChannelsMode {
    #[default]
    Disabled,
    Force,
}

/// Hash functions selectable for hash-shuffle connections via config.
/// `ColumnShardHashV1` is never a default; it is only chosen by the
/// optimizer when shuffle elimination applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashShuffleFunc {
    #[default]
    HashV1,
    HashV2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelTransportVersion {
    #[default]
    UvPickle1_0,
    OobPickle1_0,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableServiceConfig {
    /// Compile actor timeout.
    pub compile_timeout_ms: u64,
    /// Gates multi-statement mode.
    pub enable_per_statement_query_execution: bool,
    /// Chooses block-layout channels.
    pub block_channels_mode: BlockChannelsMode,
    pub default_hash_shuffle_func_type: HashShuffleFunc,
    /// Data-shard data format selector.
    pub enable_arrow_format_at_datashard: bool,
    pub default_cost_based_optimization_level: u32,
    pub default_enable_shuffle_elimination: bool,
    pub enable_spilling_nodes: bool,
    pub channel_transport_version: ChannelTransportVersion,
    pub default_syntax_version: u16,
}

impl Default for TableServiceConfig {
    fn default() -> Self {
        Self {
            compile_timeout_ms: 60_000,
            enable_per_statement_query_execution: false,
            block_channels_mode: BlockChannelsMode::default(),
            default_hash_shuffle_func_type: HashShuffleFunc::default(),
            enable_arrow_format_at_datashard: false,
            default_cost_based_optimization_level: 0,
            default_enable_shuffle_elimination: false,
            enable_spilling_nodes: false,
            channel_transport_version: ChannelTransportVersion::default(),
            default_syntax_version: 1,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryServiceConfig {
    /// Overrides the result rows cap for script/generic queries; zero keeps
    /// the per-query default.
    pub script_result_rows_limit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_overrides() {
        let config: TableServiceConfig = serde_json::from_str(
            r#"{"compile_timeout_ms": 10, "default_hash_shuffle_func_type": "hash_v2"}"#,
        )
        .unwrap();
        assert_eq!(config.compile_timeout_ms, 10);
        assert_eq!(
            config.default_hash_shuffle_func_type,
            HashShuffleFunc::HashV2
        );
        assert_eq!(config.block_channels_mode, BlockChannelsMode::Disabled);

        serde_json::from_str::<TableServiceConfig>(r#"{"no_such_knob": true}"#).unwrap_err();
    }
}
