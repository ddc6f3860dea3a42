//! Script hook surface.
//!
//! User scripts run outside the core. They only see this narrow interface:
//! per-frame callbacks, named channel handlers, outbound channel messages,
//! a set of script-owned entity transforms, and the user store.
//!
//! Hooks never touch room or client state directly. Anything they send is
//! queued and drained by the owner after the hook returns.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::{math::Transform, protocol::PlayerId, store::UserStore};

/// A queued outbound channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSend {
    pub channel: String,
    pub data: Value,
    /// `None` addresses everyone.
    pub target: Option<PlayerId>,
}

/// View handed to every hook invocation.
pub struct ScriptCtx<'a> {
    outbox: &'a mut Vec<ChannelSend>,
    entities: &'a mut BTreeMap<String, Transform>,
    store: Option<&'a dyn UserStore>,
}

impl<'a> ScriptCtx<'a> {
    pub fn send_channel(&mut self, channel: &str, data: Value, target: Option<PlayerId>) {
        self.outbox.push(ChannelSend {
            channel: channel.to_string(),
            data,
            target,
        });
    }

    /// Publishes a script-owned entity; replicated in snapshots.
    pub fn set_entity(&mut self, id: &str, transform: Transform) {
        self.entities.insert(id.to_string(), transform);
    }

    pub fn remove_entity(&mut self, id: &str) -> Option<Transform> {
        self.entities.remove(id)
    }

    pub fn entity(&self, id: &str) -> Option<&Transform> {
        self.entities.get(id)
    }

    /// User store, when the host has one (server side).
    pub fn store(&self) -> Option<&'a dyn UserStore> {
        self.store
    }
}

pub type FrameHook = Box<dyn FnMut(&mut ScriptCtx<'_>, f32) + Send>;
pub type ChannelHandler = Box<dyn FnMut(&mut ScriptCtx<'_>, &Value, Option<&PlayerId>) + Send>;

/// Registry of script hooks plus the state they publish.
#[derive(Default)]
pub struct ScriptHost {
    frame_hooks: Vec<FrameHook>,
    channel_handlers: HashMap<String, Vec<ChannelHandler>>,
    outbox: Vec<ChannelSend>,
    entities: BTreeMap<String, Transform>,
}

impl ScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback run once per simulation frame.
    pub fn on_frame<F>(&mut self, hook: F)
    where
        F: FnMut(&mut ScriptCtx<'_>, f32) + Send + 'static,
    {
        self.frame_hooks.push(Box::new(hook));
    }

    /// Registers a handler for messages on `channel`.
    pub fn on_channel<F>(&mut self, channel: &str, handler: F)
    where
        F: FnMut(&mut ScriptCtx<'_>, &Value, Option<&PlayerId>) + Send + 'static,
    {
        self.channel_handlers
            .entry(channel.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Queues a channel message from outside any hook.
    pub fn send_channel(&mut self, channel: &str, data: Value, target: Option<PlayerId>) {
        self.outbox.push(ChannelSend {
            channel: channel.to_string(),
            data,
            target,
        });
    }

    pub fn run_frame(&mut self, dt: f32, store: Option<&dyn UserStore>) {
        let mut ctx = ScriptCtx {
            outbox: &mut self.outbox,
            entities: &mut self.entities,
            store,
        };
        for hook in &mut self.frame_hooks {
            hook(&mut ctx, dt);
        }
    }

    /// Delivers a channel message to its handlers. Returns how many ran.
    pub fn dispatch(
        &mut self,
        channel: &str,
        data: &Value,
        sender: Option<&PlayerId>,
        store: Option<&dyn UserStore>,
    ) -> usize {
        let Some(handlers) = self.channel_handlers.get_mut(channel) else {
            return 0;
        };
        let mut ctx = ScriptCtx {
            outbox: &mut self.outbox,
            entities: &mut self.entities,
            store,
        };
        for handler in handlers.iter_mut() {
            handler(&mut ctx, data, sender);
        }
        handlers.len()
    }

    /// Drains queued outbound messages.
    pub fn take_outbox(&mut self) -> Vec<ChannelSend> {
        std::mem::take(&mut self.outbox)
    }

    pub fn entities(&self) -> &BTreeMap<String, Transform> {
        &self.entities
    }

    pub fn hook_count(&self) -> usize {
        self.frame_hooks.len() + self.channel_handlers.values().map(Vec::len).sum::<usize>()
    }
}
