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

use thiserror::Error;
use tidewave_common::error::StatusCode;

pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// Failures while building or serializing a task graph.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The physical plan violates the protocol contract.
    #[error("malformed physical plan: {0}")]
    BadRequest(String),
    /// An invariant of the graph itself broke mid-build.
    #[error("internal error: {0}")]
    Internal(String),
    /// A consistent read was requested without a snapshot or lock to back it.
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl BuildError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BuildError::BadRequest(_) => StatusCode::BadRequest,
            BuildError::Internal(_) => StatusCode::InternalError,
            BuildError::Precondition(_) => StatusCode::PreconditionFailed,
        }
    }
}

macro_rules! ensure_plan {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(crate::error::BuildError::BadRequest(format!($($arg)*)));
        }
    };
}

macro_rules! ensure_graph {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(crate::error::BuildError::Internal(format!($($arg)*)));
        }
    };
}

pub(crate) use ensure_graph;
pub(crate) use ensure_plan;
