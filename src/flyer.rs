//! Flyer protocol.
//!
//! A flyer acquires on its own once kicked off; the plan runner only learns
//! when it started (`kickoff`), when it finished (`complete`) and what it
//! recorded (`collect`).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DaqResult;
use crate::status::OperationStatus;

/// Device driven by the plan runner through kickoff/complete/collect.
#[async_trait]
pub trait Flyer: Send + Sync {
    /// Device name used in logs and staging lists.
    fn name(&self) -> &str;

    /// Start acquiring. Returns a status resolved once acquisition started.
    async fn kickoff(&self) -> DaqResult<OperationStatus>;

    /// Returns a status resolved once acquisition is over.
    async fn complete(&self) -> DaqResult<OperationStatus>;

    /// Records produced since kickoff.
    async fn collect(&self) -> DaqResult<Vec<Value>>;

    /// Schema of the records returned by `collect`.
    fn describe_collect(&self) -> BTreeMap<String, Value>;

    /// Prepare for a plan. Returns the names of the staged devices.
    async fn stage(&self) -> DaqResult<Vec<String>> {
        Ok(vec![self.name().to_string()])
    }

    /// Undo `stage`. Returns the names of the unstaged devices.
    async fn unstage(&self) -> DaqResult<Vec<String>> {
        Ok(vec![self.name().to_string()])
    }
}
