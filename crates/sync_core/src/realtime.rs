//! Ownership of the single live realtime channel per active conversation.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::ConversationId,
    protocol::{RealtimeEvent, TypingBroadcast},
};
use tokio::task::JoinHandle;

/// Opens one live channel per conversation. The channel delivers inserted
/// message rows and ephemeral typing broadcasts in server commit order.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn subscribe(&self, conversation_id: &ConversationId)
        -> Result<Arc<dyn RealtimeChannel>>;
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Next event pushed on the channel; `None` once the channel has closed.
    async fn next_event(&self) -> Option<RealtimeEvent>;
    async fn broadcast_typing(&self, typing: TypingBroadcast) -> Result<()>;
    fn is_joined(&self) -> bool;
    async fn close(&self);
}

/// Owns one live channel and its event pump. Exactly one caller holds the
/// handle; teardown is `close`, which aborts the pump and releases the
/// collaborator channel, so no callbacks outlive the subscription.
pub struct SubscriptionHandle {
    conversation_id: ConversationId,
    channel: Arc<dyn RealtimeChannel>,
    pump: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(
        conversation_id: ConversationId,
        channel: Arc<dyn RealtimeChannel>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            conversation_id,
            channel,
            pump,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_joined(&self) -> bool {
        self.channel.is_joined()
    }

    pub async fn broadcast_typing(&self, typing: TypingBroadcast) -> Result<()> {
        self.channel.broadcast_typing(typing).await
    }

    pub async fn close(self) {
        self.pump.abort();
        self.channel.close().await;
    }
}
