//! Task Message Listener: long-polls the coordinator for kill/interrupt
//! control messages addressed to one task.
//!
//! Grounded in `task_runner.task_message_listener.WebApiTaskMessageListener`:
//! `receive` loops the long-poll call until it gets a non-empty message
//! (the API returns no-content on a bare timeout), `unblock` wakes any
//! receiver stuck in that loop when the task finishes some other way.

use crate::api_client::ApiClient;

const DEFAULT_BLOCK_S: u64 = 30;

pub const KILL_MESSAGE: &str = "kill";
pub const INTERRUPT_MESSAGE: &str = "interrupt";
pub const TASK_DONE_MESSAGE: &str = "done";

pub struct MessageListener {
    api: std::sync::Arc<ApiClient>,
    block_s: u64,
}

impl MessageListener {
    pub fn new(api: std::sync::Arc<ApiClient>) -> Self {
        Self {
            api,
            block_s: DEFAULT_BLOCK_S,
        }
    }

    /// Block until a message for `task_id` arrives, retrying the long-poll
    /// across bare timeouts and transient HTTP errors alike.
    pub async fn receive(&self, task_id: &str) -> String {
        loop {
            match self.api.receive_task_message(task_id, self.block_s).await {
                Ok(Some(message)) => return message,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(%err, task_id, "message listener poll failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Release any task waiting in [`Self::receive`] for `task_id`, used
    /// once the task has already finished through the normal fetch loop.
    pub async fn unblock(&self, task_id: &str) {
        if let Err(err) = self.api.unblock_task_message_listeners(task_id).await {
            tracing::warn!(%err, task_id, "failed to unblock message listeners");
        }
    }
}
