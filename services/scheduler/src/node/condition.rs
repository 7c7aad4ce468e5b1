//! The `RunningExecutor` node condition.
//!
//! Agents heartbeat by refreshing this condition. Its reason field carries
//! the executor correlation id as `uuid_<id>`.

use chrono::{DateTime, Utc};
use quarry_id::ExecutorId;

use crate::model::{ConditionStatus, Node, NodeCondition};

pub const RUNNING_EXECUTOR: &str = "RunningExecutor";

pub const RUNNING_EXECUTOR_MESSAGE: &str = "node is running the quarry executor";

const UUID_PREFIX: &str = "uuid_";

/// Executor id encoded in a `RunningExecutor` condition.
///
/// `None` for any other condition type, and for reasons without the prefix
/// or with nothing after it.
pub fn parse_condition_reason(condition: &NodeCondition) -> Option<ExecutorId> {
    if condition.condition_type != RUNNING_EXECUTOR {
        return None;
    }
    condition
        .reason
        .strip_prefix(UUID_PREFIX)
        .filter(|id| !id.is_empty())
        .map(ExecutorId::from)
}

/// Create or refresh the `RunningExecutor` condition on `node`.
///
/// The heartbeat time always moves to `now`; the transition time only moves
/// when the executor id changes.
pub fn set_running_executor_condition(node: &mut Node, executor: &ExecutorId, now: DateTime<Utc>) {
    let reason = format!("{UUID_PREFIX}{executor}");

    match node
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == RUNNING_EXECUTOR)
    {
        Some(condition) => {
            condition.last_heartbeat_time = now;
            if condition.reason != reason {
                condition.reason = reason;
                condition.last_transition_time = now;
            }
        }
        None => node.conditions.push(NodeCondition {
            condition_type: RUNNING_EXECUTOR.to_string(),
            status: ConditionStatus::True,
            reason,
            message: RUNNING_EXECUTOR_MESSAGE.to_string(),
            last_heartbeat_time: now,
            last_transition_time: now,
        }),
    }
}
