use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::protocol::envelope::{Command, Payload};
use crate::protocol::sender::CommandSender;

type PersistentFn = dyn FnMut(&Payload, &CommandSender) + 'static;
type OneShotFn = dyn FnOnce(&Payload, &CommandSender) + 'static;

/// Routes decoded commands to listeners by name.
///
/// Persistent listeners fire for every matching command; one-shot hooks fire
/// once and are consumed in registration order.
#[derive(Default)]
pub struct CommandDispatcher {
    persistent: HashMap<Cow<'static, str>, Vec<Box<PersistentFn>>>,
    one_shot: HashMap<Cow<'static, str>, VecDeque<Box<OneShotFn>>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, command: impl Into<Cow<'static, str>>, listener: F)
    where
        F: FnMut(&Payload, &CommandSender) + 'static,
    {
        self.persistent
            .entry(command.into())
            .or_default()
            .push(Box::new(listener));
    }

    pub fn hook<F>(&mut self, command: impl Into<Cow<'static, str>>, listener: F)
    where
        F: FnOnce(&Payload, &CommandSender) + 'static,
    {
        self.one_shot
            .entry(command.into())
            .or_default()
            .push_back(Box::new(listener));
    }

    /// One-shot hooks still waiting for `command`
    pub fn pending_hooks(&self, command: &str) -> usize {
        self.one_shot.get(command).map_or(0, VecDeque::len)
    }

    /// Fire listeners for `command`. Returns how many fired.
    pub fn dispatch(&mut self, command: &Command, sender: &CommandSender) -> usize {
        let mut fired = 0;
        if let Some(listeners) = self.persistent.get_mut(command.name.as_str()) {
            for listener in listeners.iter_mut() {
                listener(&command.payload, sender);
                fired += 1;
            }
        }

        let hook = self
            .one_shot
            .get_mut(command.name.as_str())
            .and_then(VecDeque::pop_front);
        if let Some(hook) = hook {
            hook(&command.payload, sender);
            fired += 1;
        }

        if fired == 0 {
            debug!(command=%command.name, "No listener for command");
        }
        fired
    }
}
