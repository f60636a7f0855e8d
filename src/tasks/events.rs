//! Scheduler event stream. Subscribers get a plain
//! `tokio::sync::broadcast::Receiver`; a lagged receiver's dropped count
//! is folded into the next event instead of just vanishing.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::tasks::execution::{TaskExecution, TaskId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskStateChanged {
        task: Box<TaskExecution>,
        /// Number of events silently dropped before this one because a
        /// subscriber fell behind the broadcast channel's capacity.
        #[serde(skip_serializing_if = "Option::is_none")]
        dropped_before: Option<u64>,
    },
    TaskProgressUpdated {
        task_id: TaskId,
        percent: u8,
        operation: String,
    },
}

/// Drains a broadcast receiver, converting a `Lagged(n)` error into a
/// synthetic annotation on the next event rather than losing it silently.
pub async fn recv_with_backpressure(
    rx: &mut broadcast::Receiver<SchedulerEvent>,
) -> Option<SchedulerEvent> {
    let mut dropped = 0u64;
    loop {
        match rx.recv().await {
            Ok(mut event) => {
                if dropped > 0 {
                    if let SchedulerEvent::TaskStateChanged { dropped_before, .. } = &mut event {
                        *dropped_before = Some(dropped);
                    }
                }
                return Some(event);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                dropped += n;
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
