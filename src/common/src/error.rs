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

use std::fmt;

use itertools::Itertools;
use serde::Serialize;

/// Status codes shared by every user-visible reply in the pipeline.
///
/// Errors are classified taxonomically rather than by their Rust error type,
/// so that a failure surfaced from any component maps onto one stable code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum StatusCode {
    #[default]
    Success,
    Timeout,
    BadRequest,
    InternalError,
    Aborted,
    QuotaExceeded,
    PreconditionFailed,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::BadRequest => "BAD_REQUEST",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::Aborted => "ABORTED",
            StatusCode::QuotaExceeded => "QUOTA_EXCEEDED",
            StatusCode::PreconditionFailed => "PRECONDITION_FAILED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Position of the offending input span, reported when parsing fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Position {
    pub row: u32,
    pub column: u32,
}

/// A single diagnostic with optional sub-issues, forming a tree.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Issue {
    pub message: String,
    pub severity: Severity,
    pub position: Option<Position>,
    pub issues: Vec<Issue>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
            position: None,
            issues: Vec::new(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_sub_issue(mut self, issue: Issue) -> Self {
        self.issues.push(issue);
        self
    }

    pub fn add_sub_issue(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    /// Flatten the issue tree into a single line, for log messages.
    pub fn to_one_line(&self) -> String {
        let mut out = self.message.clone();
        if !self.issues.is_empty() {
            let subs = self.issues.iter().map(|i| i.to_one_line()).join("; ");
            out.push_str(&format!(" [{}]", subs));
        }
        out
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_one_line())
    }
}

pub fn issues_to_one_line(issues: &[Issue]) -> String {
    issues.iter().map(|i| i.to_one_line()).join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_tree_one_line() {
        let issue = Issue::new("outer")
            .with_sub_issue(Issue::new("inner a"))
            .with_sub_issue(Issue::new("inner b").with_sub_issue(Issue::new("leaf")));
        assert_eq!(issue.to_one_line(), "outer [inner a; inner b [leaf]]");
    }
}
