//! Cloneable outbound command queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::protocol::envelope::{Command, Payload};

#[derive(Default)]
struct Queue {
    commands: Mutex<VecDeque<Command>>,
    notify: Notify,
}

/// Queues commands for the next protocol tick. Usable from any thread.
#[derive(Clone, Default)]
pub struct CommandSender {
    queue: Arc<Queue>,
}

impl CommandSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.queue
            .commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fire and forget
    pub fn send(&self, command: impl Into<String>, payload: Payload) {
        self.lock().push_back(Command::new(command, payload));
        self.queue.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn drain(&self) -> Vec<Command> {
        self.lock().drain(..).collect()
    }

    pub(crate) async fn queued(&self) {
        self.queue.notify.notified().await
    }
}
