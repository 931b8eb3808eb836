use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// Coarse category deciding which pool and timeout policy a query uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    Write,
    Read,
    Analytics,
    Background,
}

impl WorkloadClass {
    pub const ALL: [WorkloadClass; 4] = [
        WorkloadClass::Write,
        WorkloadClass::Read,
        WorkloadClass::Analytics,
        WorkloadClass::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::Write => "write",
            WorkloadClass::Read => "read",
            WorkloadClass::Analytics => "analytics",
            WorkloadClass::Background => "background",
        }
    }

    /// Write traffic is never retried elsewhere.
    pub fn allows_failover(&self) -> bool {
        !matches!(self, WorkloadClass::Write)
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadClass {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "write" => Ok(WorkloadClass::Write),
            "read" => Ok(WorkloadClass::Read),
            "analytics" => Ok(WorkloadClass::Analytics),
            "background" => Ok(WorkloadClass::Background),
            other => Err(DbError::Configuration(format!(
                "unknown workload class: {other}"
            ))),
        }
    }
}

/// Identifies one physical pool: a workload class and a replica slot within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PoolId {
    pub class: WorkloadClass,
    pub replica: usize,
}

impl PoolId {
    pub fn new(class: WorkloadClass, replica: usize) -> Self {
        Self { class, replica }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.class, self.replica)
    }
}

/// Per-call hints accepted by [`crate::manager::PoolManager::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Explicit override; skips classification entirely.
    pub query_type: Option<WorkloadClass>,
    pub read_only: bool,
    pub is_analytics: bool,
    pub is_background: bool,
    /// `Some(false)` disables failover for this call.
    pub allow_failover: Option<bool>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_type(mut self, class: WorkloadClass) -> Self {
        self.query_type = Some(class);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn analytics(mut self, is_analytics: bool) -> Self {
        self.is_analytics = is_analytics;
        self
    }

    pub fn background(mut self, is_background: bool) -> Self {
        self.is_background = is_background;
        self
    }

    pub fn allow_failover(mut self, allow: bool) -> Self {
        self.allow_failover = Some(allow);
        self
    }

    pub(crate) fn failover_allowed(&self) -> bool {
        self.allow_failover != Some(false)
    }
}
