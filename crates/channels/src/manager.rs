//! Channel manager: owns the enabled adapters and routes bus traffic to them.
//!
//! Two dispatch loops run until shutdown: one delivers outbound messages
//! through [`Channel::send`], the other feeds the primary stream queue into
//! [`Channel::handle_stream_delta`]. Messages for unknown channels are
//! logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use clawloop_core::bus::{MessageBus, OutboundMessage, StreamDelta};
use clawloop_core::channel::Channel;
use clawloop_core::error::ChannelError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ChannelManager {
    bus: Arc<MessageBus>,
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelManager {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            channels: HashMap::new(),
        }
    }

    /// Register a channel adapter under its name.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "Registered channel");
        self.channels.insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name)
    }

    /// Registered channel names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Start every channel. Stops at the first failure.
    pub async fn start_all(&self) -> Result<(), ChannelError> {
        for (name, channel) in &self.channels {
            channel.start(self.bus.clone()).await?;
            info!(channel = %name, "Started channel");
        }
        Ok(())
    }

    /// Stop all channels gracefully.
    pub async fn stop_all(&self) {
        for (name, channel) in &self.channels {
            if let Err(e) = channel.stop().await {
                warn!(channel = %name, error = %e, "Failed to stop channel");
            }
        }
    }

    /// Run health checks on all channels.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (name, channel) in &self.channels {
            let healthy = channel.health_check().await.unwrap_or(false);
            results.insert(name.clone(), healthy);
        }
        results
    }

    /// Deliver one outbound message to its channel.
    pub async fn dispatch_outbound(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let Some(channel) = self.channels.get(&msg.channel) else {
            warn!(channel = %msg.channel, chat_id = %msg.chat_id, "No channel for outbound message, dropping");
            return Err(ChannelError::NotConfigured(format!(
                "Channel '{}' not found",
                msg.channel
            )));
        };
        channel.send(msg).await.inspect_err(|e| {
            warn!(channel = %msg.channel, chat_id = %msg.chat_id, error = %e, "Failed to deliver message");
        })
    }

    /// Hand one delta to its channel. Deltas for unregistered channels
    /// (such as gateway or direct turns) are expected and ignored.
    pub fn dispatch_stream(&self, delta: &StreamDelta) {
        match self.channels.get(&delta.channel) {
            Some(channel) => channel.handle_stream_delta(delta),
            None => debug!(channel = %delta.channel, "No channel for stream delta"),
        }
    }

    /// Run both dispatch loops until `shutdown` flips to true or the bus closes.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let outbound = tokio::spawn(self.clone().outbound_loop(shutdown.clone()));
        let stream = tokio::spawn(self.clone().stream_loop(shutdown));
        let _ = tokio::join!(outbound, stream);
        debug!("Channel dispatch stopped");
    }

    async fn outbound_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                msg = self.bus.subscribe_outbound() => match msg {
                    Some(msg) => {
                        let _ = self.dispatch_outbound(&msg).await;
                    }
                    None => break,
                },
            }
        }
    }

    async fn stream_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                delta = self.bus.subscribe_stream() => match delta {
                    Some(delta) => self.dispatch_stream(&delta),
                    None => break,
                },
            }
        }
    }
}
