use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientId, ConversationId, MessageId, MessageKind, TempId, UserId},
    protocol::{
        ConversationRow, MessageRow, NewMessage, ParticipantRow, RealtimeEvent, ReplyPreview,
        TypingBroadcast,
    },
};
use storage::{OutboxItem, Storage};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

pub mod connection;
pub mod realtime;
pub mod reconcile;
pub mod rest;
pub mod ws;

pub use connection::{ConnectionMonitor, ConnectionState};

use realtime::{RealtimeChannel, RealtimeConnector, SubscriptionHandle};
use reconcile::MatchOutcome;

const DEFAULT_PAGE_SIZE: u32 = 50;
const TYPING_EXPIRY: Duration = Duration::from_secs(3);
const RESUBSCRIBE_DEBOUNCE: Duration = Duration::from_millis(750);

/// Connectivity classification for collaborator failures. Adapters normalize
/// transport-level failures into messages these patterns cover.
pub fn is_offline_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_ascii_lowercase();
    text.contains("unreachable")
        || text.contains("connection refused")
        || text.contains("connection reset")
        || text.contains("timed out")
        || text.contains("dns error")
        || text.contains("offline")
}

/// Duplicate-key failures from idempotent upserts are expected under
/// concurrent read tracking and count as success.
pub fn is_duplicate_key_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_ascii_lowercase();
    text.contains("duplicate")
        || text.contains("unique constraint")
        || text.contains("conflict")
}

/// Remote authoritative store, reachable over the network. Message inserts
/// echo `client_id` back unchanged; the read-receipt upsert must be safely
/// callable twice for the same pair.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn conversations_for_user(&self, user_id: &UserId) -> Result<Vec<ConversationRow>>;
    async fn last_messages(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<Vec<MessageRow>>;
    async fn participants(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<Vec<ParticipantRow>>;
    /// Newest-first page; `before` is an exclusive upper bound.
    async fn messages_before(
        &self,
        conversation_id: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<MessageRow>>;
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow>;
    async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        read_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn leave_conversation(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()>;
}

pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Media upload collaborator: given a blob, return a durable URL. Progress,
/// when asked for, is reported monotonically from 0 to 100.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        progress: Option<ProgressFn>,
    ) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageStatus {
    Failed,
    Sending,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Status is monotonic within a session; only a confirmed write can move
    /// a `Failed` entry forward again.
    fn advanced_to(self, floor: MessageStatus) -> MessageStatus {
        self.max(floor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub temp_id: Option<TempId>,
    pub client_id: Option<ClientId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub reply_to_message_id: Option<MessageId>,
    pub reply_to: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub upload_progress: Option<u8>,
}

impl Message {
    pub fn from_row(row: &MessageRow, status: MessageStatus) -> Self {
        Self {
            id: Some(row.id.clone()),
            temp_id: None,
            client_id: row.client_id.clone(),
            conversation_id: row.conversation_id.clone(),
            sender_id: row.sender_id.clone(),
            content: row.content.clone(),
            kind: row.kind,
            media_url: row.media_url.clone(),
            reply_to_message_id: row.reply_to_message_id.clone(),
            reply_to: row.reply_to.clone(),
            created_at: row.created_at,
            status,
            upload_progress: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
    pub unread_count: u32,
    pub last_message: Option<Message>,
}

impl Conversation {
    fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.updated_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypingIndicator {
    pub user_id: UserId,
    pub user_name: String,
}

/// Payload for a user-initiated text send.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub client_id_override: Option<ClientId>,
    pub reply_to_message_id: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn text(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: content.into(),
            kind: MessageKind::Text,
            media_url: None,
            client_id_override: None,
            reply_to_message_id: None,
        }
    }

    /// Manual retry reuses the original idempotency key so a write that
    /// actually landed before the client observed a failure cannot produce a
    /// second row.
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id_override = Some(client_id);
        self
    }

    pub fn with_reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to_message_id = Some(message_id);
        self
    }
}

/// An attachment or voice blob handed to the upload collaborator.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub filename: String,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("attachment upload failed: {0}")]
    Upload(#[source] anyhow::Error),
    #[error("message write failed: {0}")]
    Remote(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    ConversationsUpdated,
    MessagesUpdated {
        conversation_id: ConversationId,
    },
    UploadProgress {
        conversation_id: ConversationId,
        temp_id: TempId,
        progress: u8,
    },
    TypingChanged {
        conversation_id: ConversationId,
    },
    ConnectionChanged(ConnectionState),
}

struct TypingEntry {
    user_name: String,
    generation: u64,
}

#[derive(Default)]
struct StoreState {
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    typing: HashMap<ConversationId, HashMap<UserId, TypingEntry>>,
    drain_in_flight: bool,
    typing_generation: u64,
}

/// The conversation/message state container. Owned by the application shell
/// and shared by reference; reads are snapshots, writes are the operations
/// below, change notification is the broadcast event stream.
pub struct ChatStore {
    remote: Arc<dyn RemoteStore>,
    uploader: Arc<dyn MediaUploader>,
    realtime_connector: Arc<dyn RealtimeConnector>,
    storage: Storage,
    connection: ConnectionMonitor,
    inner: Mutex<StoreState>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    resubscribe_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl ChatStore {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        uploader: Arc<dyn MediaUploader>,
        realtime_connector: Arc<dyn RealtimeConnector>,
        storage: Storage,
        connection: ConnectionMonitor,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            remote,
            uploader,
            realtime_connector,
            storage,
            connection,
            inner: Mutex::new(StoreState::default()),
            subscription: Mutex::new(None),
            resubscribe_task: Mutex::new(None),
            events,
        })
    }

    pub fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Spawns the connectivity watcher and, when currently online, kicks an
    /// initial outbox drain for sends left over from a previous run.
    pub async fn start(self: &Arc<Self>) {
        self.spawn_connection_watcher();
        if self.connection.is_online() {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                store.process_offline_queue().await;
            });
        }
    }

    pub async fn conversations_snapshot(&self) -> Vec<Conversation> {
        self.inner.lock().await.conversations.clone()
    }

    pub async fn messages_snapshot(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn typing_snapshot(&self, conversation_id: &ConversationId) -> Vec<TypingIndicator> {
        let state = self.inner.lock().await;
        let mut indicators: Vec<TypingIndicator> = state
            .typing
            .get(conversation_id)
            .map(|users| {
                users
                    .iter()
                    .map(|(user_id, entry)| TypingIndicator {
                        user_id: user_id.clone(),
                        user_name: entry.user_name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        indicators.sort_by(|a, b| a.user_id.as_str().cmp(b.user_id.as_str()));
        indicators
    }

    /// Fetches the user's conversations plus last messages and participant
    /// profiles, merges them by conversation id (first occurrence wins),
    /// drops locally deleted conversations, and sorts by most recent
    /// activity. On failure the previous state stays untouched.
    pub async fn load_conversations(&self, user_id: &UserId) -> Result<()> {
        match self.fetch_conversations(user_id).await {
            Ok(conversations) => {
                self.inner.lock().await.conversations = conversations;
                let _ = self.events.send(StoreEvent::ConversationsUpdated);
                Ok(())
            }
            Err(err) => {
                error!(user_id = %user_id, "store: conversation load failed: {err:#}");
                Err(err)
            }
        }
    }

    async fn fetch_conversations(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        let rows = self
            .remote
            .conversations_for_user(user_id)
            .await
            .context("conversation list fetch failed")?;

        // Multi-row joins can surface the same conversation twice; the first
        // occurrence wins.
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for row in rows {
            if seen.insert(row.id.clone()) {
                unique.push(row);
            }
        }

        let ids: Vec<ConversationId> = unique.iter().map(|row| row.id.clone()).collect();
        let last_messages = self
            .remote
            .last_messages(&ids)
            .await
            .context("last message fetch failed")?;
        let participants = self
            .remote
            .participants(&ids)
            .await
            .context("participant fetch failed")?;

        let denied: HashSet<ConversationId> =
            self.storage.deny_list_all().await?.into_iter().collect();

        let mut last_by_conversation: HashMap<ConversationId, MessageRow> = HashMap::new();
        for row in last_messages {
            last_by_conversation
                .entry(row.conversation_id.clone())
                .or_insert(row);
        }

        let mut participants_by_conversation: HashMap<ConversationId, Vec<Participant>> =
            HashMap::new();
        for row in participants {
            participants_by_conversation
                .entry(row.conversation_id.clone())
                .or_default()
                .push(Participant {
                    user_id: row.user_id,
                    display_name: row.display_name,
                    avatar_url: row.avatar_url,
                    is_online: row.is_online,
                });
        }

        let mut conversations: Vec<Conversation> = unique
            .into_iter()
            .filter(|row| !denied.contains(&row.id))
            .map(|row| Conversation {
                last_message: last_by_conversation
                    .remove(&row.id)
                    .map(|r| Message::from_row(&r, MessageStatus::Delivered)),
                participants: participants_by_conversation
                    .remove(&row.id)
                    .unwrap_or_default(),
                unread_count: row.unread_count,
                id: row.id,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
            .collect();

        conversations.sort_by_key(|c| std::cmp::Reverse(c.last_activity_at()));
        Ok(conversations)
    }

    /// Loads a page of messages in chronological order. `load_more` prepends
    /// older rows using the oldest held timestamp as an exclusive cursor, so
    /// already-held messages are never re-fetched. When the remote is
    /// unreachable, an initial load serves the local cache instead.
    pub async fn load_messages(
        &self,
        conversation_id: &ConversationId,
        limit: Option<u32>,
        load_more: bool,
    ) -> Result<()> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let before = if load_more {
            self.inner
                .lock()
                .await
                .messages
                .get(conversation_id)
                .and_then(|entries| {
                    entries
                        .iter()
                        .filter(|m| m.id.is_some())
                        .map(|m| m.created_at)
                        .min()
                })
        } else {
            None
        };

        let rows = match self
            .remote
            .messages_before(conversation_id, before, limit)
            .await
        {
            Ok(mut rows) => {
                rows.reverse();
                if let Err(err) = self.storage.cache_messages(conversation_id, &rows).await {
                    warn!(conversation_id = %conversation_id, "cache: refresh failed: {err}");
                }
                rows
            }
            Err(err) if !load_more && is_offline_error(&err) => {
                warn!(
                    conversation_id = %conversation_id,
                    "store: message fetch failed while offline; serving cached rows: {err}"
                );
                self.storage
                    .cached_messages(conversation_id, limit)
                    .await
                    .context("cache read failed")?
            }
            Err(err) => {
                error!(conversation_id = %conversation_id, "store: message fetch failed: {err:#}");
                return Err(err);
            }
        };

        let statuses = compute_window_statuses(&rows);
        let incoming: Vec<Message> = rows
            .iter()
            .zip(statuses)
            .map(|(row, status)| Message::from_row(row, status))
            .collect();

        {
            let mut state = self.inner.lock().await;
            let entries = state.messages.entry(conversation_id.clone()).or_default();
            if load_more {
                let held: HashSet<MessageId> =
                    entries.iter().filter_map(|m| m.id.clone()).collect();
                let mut merged: Vec<Message> = incoming
                    .into_iter()
                    .filter(|m| m.id.as_ref().map_or(true, |id| !held.contains(id)))
                    .collect();
                merged.append(entries);
                *entries = merged;
            } else {
                // Optimistic entries still waiting on confirmation survive a
                // reload; everything else is replaced by the fetched window.
                let pending: Vec<Message> = entries
                    .drain(..)
                    .filter(|m| {
                        m.id.is_none()
                            && !incoming.iter().any(|fetched| {
                                fetched.client_id.is_some() && fetched.client_id == m.client_id
                            })
                    })
                    .collect();
                *entries = incoming;
                entries.extend(pending);
            }
        }

        let _ = self.events.send(StoreEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
        });
        Ok(())
    }

    /// Optimistic send: the entry appears immediately as `Sending`, the
    /// remote write runs through the connection monitor, and the entry is
    /// replaced in place on confirmation. Failures mark the entry `Failed`
    /// and propagate; an offline-classified failure also queues the item
    /// for replay.
    pub async fn send_message(&self, outgoing: OutgoingMessage) -> Result<MessageRow, SendError> {
        validate_outgoing(&outgoing)?;
        let client_id = outgoing
            .client_id_override
            .clone()
            .unwrap_or_else(ClientId::generate);
        let temp_id = self.upsert_optimistic_entry(&outgoing, &client_id).await;
        self.finish_remote_write(outgoing, client_id, temp_id).await
    }

    pub async fn send_attachment(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: MediaPayload,
    ) -> Result<MessageRow, SendError> {
        let kind = kind_for_filename(&payload.filename);
        self.send_media_message(conversation_id, sender_id, payload, kind)
            .await
    }

    pub async fn send_voice_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: MediaPayload,
    ) -> Result<MessageRow, SendError> {
        self.send_media_message(conversation_id, sender_id, payload, MessageKind::Voice)
            .await
    }

    /// Two-phase media send: upload first, then the message write referencing
    /// the durable URL. An upload failure never reaches the outbox; a
    /// connectivity failure after a successful upload does, so the uploaded
    /// URL is not lost.
    async fn send_media_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: MediaPayload,
        kind: MessageKind,
    ) -> Result<MessageRow, SendError> {
        let mut outgoing = OutgoingMessage {
            conversation_id,
            sender_id,
            content: payload.filename.clone(),
            kind,
            media_url: None,
            client_id_override: None,
            reply_to_message_id: None,
        };
        validate_outgoing(&outgoing)?;
        if payload.bytes.is_empty() {
            return Err(SendError::Validation("attachment is empty".into()));
        }

        let client_id = ClientId::generate();
        let temp_id = self.upsert_optimistic_entry(&outgoing, &client_id).await;
        self.set_upload_progress(&outgoing.conversation_id, &temp_id, Some(0))
            .await;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();
        let progress: ProgressFn = Arc::new(move |value| {
            let _ = progress_tx.send(value.min(100));
        });
        let pump = {
            let store = Arc::clone(self);
            let conversation_id = outgoing.conversation_id.clone();
            let temp_id = temp_id.clone();
            tokio::spawn(async move {
                while let Some(value) = progress_rx.recv().await {
                    store
                        .set_upload_progress(&conversation_id, &temp_id, Some(value))
                        .await;
                }
            })
        };

        let uploaded = self
            .uploader
            .upload(payload.bytes, &payload.filename, Some(progress))
            .await;
        pump.await.ok();

        let url = match uploaded {
            Ok(url) => url,
            Err(err) => {
                self.mark_entry_failed(&outgoing.conversation_id, &temp_id)
                    .await;
                return Err(SendError::Upload(err));
            }
        };

        self.set_entry_media_url(&outgoing.conversation_id, &temp_id, &url)
            .await;
        outgoing.media_url = Some(url);
        self.finish_remote_write(outgoing, client_id, temp_id).await
    }

    async fn finish_remote_write(
        &self,
        outgoing: OutgoingMessage,
        client_id: ClientId,
        temp_id: TempId,
    ) -> Result<MessageRow, SendError> {
        let payload = NewMessage {
            conversation_id: outgoing.conversation_id.clone(),
            sender_id: outgoing.sender_id.clone(),
            content: outgoing.content.clone(),
            kind: outgoing.kind,
            media_url: outgoing.media_url.clone(),
            client_id: client_id.clone(),
            reply_to_message_id: outgoing.reply_to_message_id.clone(),
            created_at: Utc::now(),
        };

        let written = self
            .connection
            .with_retry("message write", || {
                self.remote.insert_message(payload.clone())
            })
            .await;

        match written {
            Ok(row) => {
                self.confirm_entry(&row, &temp_id, MessageStatus::Delivered)
                    .await;
                // A manual retry of a queued item confirms here, outside the
                // drain; the durable record must not outlive confirmation.
                if let Err(err) = self.storage.outbox_delete(&client_id).await {
                    warn!(client_id = %client_id, "outbox: stale record not deleted: {err}");
                }
                if let Err(err) = self
                    .storage
                    .cache_messages(&row.conversation_id, std::slice::from_ref(&row))
                    .await
                {
                    warn!(conversation_id = %row.conversation_id, "cache: confirmed send not recorded: {err}");
                }
                Ok(row)
            }
            Err(err) => {
                self.mark_entry_failed(&outgoing.conversation_id, &temp_id)
                    .await;
                if is_offline_error(&err) {
                    let item = OutboxItem {
                        client_id: client_id.clone(),
                        temp_id,
                        conversation_id: outgoing.conversation_id,
                        sender_id: outgoing.sender_id,
                        content: outgoing.content,
                        kind: outgoing.kind,
                        media_url: outgoing.media_url,
                        created_at: payload.created_at,
                    };
                    match self.storage.outbox_put(&item).await {
                        Ok(()) => {
                            info!(client_id = %client_id, "outbox: queued message for replay")
                        }
                        Err(put_err) => {
                            error!(client_id = %client_id, "outbox: failed to persist pending send: {put_err:#}")
                        }
                    }
                }
                Err(SendError::Remote(err))
            }
        }
    }

    /// Inserts the optimistic entry, or flips an existing entry for the same
    /// `client_id` back to `Sending` on a manual retry so the conversation
    /// never shows two rows for one logical message.
    async fn upsert_optimistic_entry(
        &self,
        outgoing: &OutgoingMessage,
        client_id: &ClientId,
    ) -> TempId {
        let temp_id = {
            let mut state = self.inner.lock().await;
            let entries = state
                .messages
                .entry(outgoing.conversation_id.clone())
                .or_default();
            if let Some(existing) = entries
                .iter_mut()
                .find(|m| m.client_id.as_ref() == Some(client_id))
            {
                existing.status = MessageStatus::Sending;
                existing.temp_id.get_or_insert_with(TempId::generate).clone()
            } else {
                let temp_id = TempId::generate();
                entries.push(Message {
                    id: None,
                    temp_id: Some(temp_id.clone()),
                    client_id: Some(client_id.clone()),
                    conversation_id: outgoing.conversation_id.clone(),
                    sender_id: outgoing.sender_id.clone(),
                    content: outgoing.content.clone(),
                    kind: outgoing.kind,
                    media_url: outgoing.media_url.clone(),
                    reply_to_message_id: outgoing.reply_to_message_id.clone(),
                    reply_to: None,
                    created_at: Utc::now(),
                    status: MessageStatus::Sending,
                    upload_progress: None,
                });
                temp_id
            }
        };
        let _ = self.events.send(StoreEvent::MessagesUpdated {
            conversation_id: outgoing.conversation_id.clone(),
        });
        temp_id
    }

    /// Write confirmation replaces the optimistic entry in place, matched by
    /// `temp_id` first, then `client_id` (outbox replay after a restart has
    /// no in-memory entry to carry a temp id).
    async fn confirm_entry(&self, row: &MessageRow, temp_id: &TempId, floor: MessageStatus) {
        let conversation_id = row.conversation_id.clone();
        {
            let mut state = self.inner.lock().await;
            let entries = state.messages.entry(conversation_id.clone()).or_default();
            let index = entries
                .iter()
                .position(|m| m.temp_id.as_ref() == Some(temp_id))
                .or_else(|| {
                    row.client_id.as_ref().and_then(|client_id| {
                        entries
                            .iter()
                            .position(|m| m.client_id.as_ref() == Some(client_id))
                    })
                });
            match index {
                Some(index) => reconcile::fold_row(&mut entries[index], row, floor),
                None => entries.push(Message::from_row(row, floor)),
            }
        }
        let _ = self.events.send(StoreEvent::MessagesUpdated { conversation_id });
    }

    async fn mark_entry_failed(&self, conversation_id: &ConversationId, temp_id: &TempId) {
        {
            let mut state = self.inner.lock().await;
            if let Some(entry) = state
                .messages
                .get_mut(conversation_id)
                .and_then(|entries| entries.iter_mut().find(|m| m.temp_id.as_ref() == Some(temp_id)))
            {
                entry.status = MessageStatus::Failed;
                entry.upload_progress = None;
            }
        }
        let _ = self.events.send(StoreEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
        });
    }

    async fn set_upload_progress(
        &self,
        conversation_id: &ConversationId,
        temp_id: &TempId,
        progress: Option<u8>,
    ) {
        {
            let mut state = self.inner.lock().await;
            if let Some(entry) = state
                .messages
                .get_mut(conversation_id)
                .and_then(|entries| entries.iter_mut().find(|m| m.temp_id.as_ref() == Some(temp_id)))
            {
                entry.upload_progress = progress;
            }
        }
        if let Some(progress) = progress {
            let _ = self.events.send(StoreEvent::UploadProgress {
                conversation_id: conversation_id.clone(),
                temp_id: temp_id.clone(),
                progress,
            });
        }
    }

    async fn set_entry_media_url(
        &self,
        conversation_id: &ConversationId,
        temp_id: &TempId,
        url: &str,
    ) {
        let mut state = self.inner.lock().await;
        if let Some(entry) = state
            .messages
            .get_mut(conversation_id)
            .and_then(|entries| entries.iter_mut().find(|m| m.temp_id.as_ref() == Some(temp_id)))
        {
            entry.media_url = Some(url.to_string());
            entry.upload_progress = None;
        }
    }

    /// Replays queued sends strictly in insertion order. Guarded by a single
    /// in-flight flag so reconnect flapping never runs two drains at once; a
    /// failed item stays queued and does not block the items behind it.
    pub async fn process_offline_queue(&self) {
        {
            let mut state = self.inner.lock().await;
            if state.drain_in_flight {
                info!("outbox: drain already in flight; skipping duplicate trigger");
                return;
            }
            state.drain_in_flight = true;
        }

        let items = match self.storage.outbox_all().await {
            Ok(items) => items,
            Err(err) => {
                error!("outbox: failed to read queue: {err:#}");
                self.inner.lock().await.drain_in_flight = false;
                return;
            }
        };

        if !items.is_empty() {
            info!(pending = items.len(), "outbox: drain started");
        }

        let mut sent = 0usize;
        for item in items {
            let payload = NewMessage {
                conversation_id: item.conversation_id.clone(),
                sender_id: item.sender_id.clone(),
                content: item.content.clone(),
                kind: item.kind,
                media_url: item.media_url.clone(),
                client_id: item.client_id.clone(),
                reply_to_message_id: None,
                created_at: item.created_at,
            };
            match self.remote.insert_message(payload).await {
                Ok(row) => {
                    if let Err(err) = self.storage.outbox_delete(&item.client_id).await {
                        warn!(client_id = %item.client_id, "outbox: confirmed item not deleted: {err}");
                    }
                    self.confirm_entry(&row, &item.temp_id, MessageStatus::Sent)
                        .await;
                    sent += 1;
                }
                Err(err) => {
                    warn!(client_id = %item.client_id, "outbox: replay failed; leaving item queued: {err}");
                }
            }
        }

        if sent > 0 {
            info!(sent, "outbox: drain complete");
        }
        self.inner.lock().await.drain_in_flight = false;
    }

    /// Background read tracking; a duplicate receipt is expected under
    /// concurrent tracking and counts as success.
    pub async fn mark_message_as_read(&self, message_id: &MessageId, user_id: &UserId) {
        match self
            .remote
            .upsert_read_receipt(message_id, user_id, Utc::now())
            .await
        {
            Ok(()) => {}
            Err(err) if is_duplicate_key_error(&err) => {}
            Err(err) => {
                warn!(message_id = %message_id, "reads: receipt upsert failed: {err}");
            }
        }
    }

    pub async fn mark_as_read(&self, conversation_id: &ConversationId, user_id: &UserId) {
        let unread: Vec<MessageId> = {
            let mut state = self.inner.lock().await;
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| &c.id == conversation_id)
            {
                conversation.unread_count = 0;
            }
            state
                .messages
                .get(conversation_id)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|m| &m.sender_id != user_id)
                        .filter_map(|m| m.id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        let _ = self.events.send(StoreEvent::ConversationsUpdated);

        for message_id in unread {
            self.mark_message_as_read(&message_id, user_id).await;
        }
    }

    /// Opens the live channel for a conversation. Subscribing to the already
    /// active conversation is a no-op; a different conversation tears the
    /// previous channel down first, so at most one channel is ever open.
    pub async fn subscribe_to_messages(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<()> {
        {
            let subscription = self.subscription.lock().await;
            if matches!(subscription.as_ref(), Some(handle) if handle.conversation_id() == &conversation_id)
            {
                return Ok(());
            }
        }
        self.teardown_subscription().await;

        let channel = self
            .realtime_connector
            .subscribe(&conversation_id)
            .await
            .with_context(|| {
                format!("failed to open realtime channel for conversation {conversation_id}")
            })?;
        let pump = self.spawn_event_pump(conversation_id.clone(), Arc::clone(&channel));
        *self.subscription.lock().await =
            Some(SubscriptionHandle::new(conversation_id, channel, pump));
        Ok(())
    }

    /// Immediate from the caller's perspective: clears the active-channel
    /// reference and cancels any pending resubscribe. A write already in
    /// flight still completes and reconciles normally.
    pub async fn unsubscribe_from_messages(&self) {
        if let Some(task) = self.resubscribe_task.lock().await.take() {
            task.abort();
        }
        self.teardown_subscription().await;
    }

    async fn teardown_subscription(&self) {
        let handle = self.subscription.lock().await.take();
        if let Some(handle) = handle {
            info!(conversation_id = %handle.conversation_id(), "realtime: channel closed");
            handle.close().await;
        }
    }

    /// Fire-and-forget typing signal on the active channel.
    pub async fn broadcast_typing(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        user_name: &str,
        is_typing: bool,
    ) {
        let subscription = self.subscription.lock().await;
        let Some(handle) = subscription
            .as_ref()
            .filter(|h| h.conversation_id() == conversation_id)
        else {
            return;
        };
        let typing = TypingBroadcast {
            user_id: user_id.clone(),
            user_name: user_name.to_string(),
            is_typing,
        };
        if let Err(err) = handle.broadcast_typing(typing).await {
            warn!(conversation_id = %conversation_id, "typing: broadcast failed: {err}");
        }
    }

    /// Removes the membership remotely, records the conversation in the
    /// permanent deny-list so a recreated membership cannot resurface it,
    /// and purges local state including queued outbox items.
    pub async fn delete_conversation(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        self.remote
            .leave_conversation(conversation_id, user_id)
            .await
            .with_context(|| format!("failed to leave conversation {conversation_id}"))?;
        self.storage.deny_list_add(conversation_id).await?;
        if let Err(err) = self
            .storage
            .outbox_delete_conversation(conversation_id)
            .await
        {
            warn!(conversation_id = %conversation_id, "outbox: purge on delete failed: {err}");
        }
        if let Err(err) = self.storage.clear_cached_messages(conversation_id).await {
            warn!(conversation_id = %conversation_id, "cache: purge on delete failed: {err}");
        }

        {
            let mut state = self.inner.lock().await;
            state.conversations.retain(|c| &c.id != conversation_id);
            state.messages.remove(conversation_id);
            state.typing.remove(conversation_id);
        }

        let active = {
            let subscription = self.subscription.lock().await;
            matches!(subscription.as_ref(), Some(handle) if handle.conversation_id() == conversation_id)
        };
        if active {
            self.unsubscribe_from_messages().await;
        }

        let _ = self.events.send(StoreEvent::ConversationsUpdated);
        Ok(())
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        channel: Arc<dyn RealtimeChannel>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = channel.next_event().await {
                match event {
                    RealtimeEvent::MessageInserted { message } => {
                        if message.conversation_id != conversation_id {
                            continue;
                        }
                        store.apply_incoming_row(message).await;
                    }
                    RealtimeEvent::Typing { typing } => {
                        store.apply_typing(&conversation_id, typing).await;
                    }
                }
            }
            info!(conversation_id = %conversation_id, "realtime: channel stream ended");
        })
    }

    /// Folds an authoritative insert into the local list: exact-id
    /// duplicates are dropped, reconciled rows replace their optimistic
    /// entry in place, everything else appends as `Delivered`.
    pub(crate) async fn apply_incoming_row(&self, row: MessageRow) {
        let conversation_id = row.conversation_id.clone();
        let outcome = {
            let mut state = self.inner.lock().await;
            let entries = state.messages.entry(conversation_id.clone()).or_default();
            if entries.iter().any(|m| m.id.as_ref() == Some(&row.id)) {
                None
            } else {
                let outcome = reconcile::match_incoming(entries, &row);
                match outcome {
                    MatchOutcome::ByClientId { index }
                    | MatchOutcome::ByHeuristic { index, .. } => {
                        reconcile::fold_row(&mut entries[index], &row, MessageStatus::Delivered);
                    }
                    MatchOutcome::NoMatch => {
                        entries.push(Message::from_row(&row, MessageStatus::Delivered));
                    }
                }
                Some(outcome)
            }
        };

        let Some(outcome) = outcome else {
            return;
        };
        if let MatchOutcome::ByHeuristic { score, .. } = outcome {
            info!(message_id = %row.id, score, "reconcile: matched optimistic entry without client_id");
        }
        if let Err(err) = self
            .storage
            .cache_messages(&conversation_id, std::slice::from_ref(&row))
            .await
        {
            warn!(conversation_id = %conversation_id, "cache: incoming row not recorded: {err}");
        }
        let _ = self.events.send(StoreEvent::MessagesUpdated { conversation_id });
    }

    async fn apply_typing(self: &Arc<Self>, conversation_id: &ConversationId, typing: TypingBroadcast) {
        if typing.is_typing {
            let generation = {
                let mut state = self.inner.lock().await;
                state.typing_generation += 1;
                let generation = state.typing_generation;
                state
                    .typing
                    .entry(conversation_id.clone())
                    .or_default()
                    .insert(
                        typing.user_id.clone(),
                        TypingEntry {
                            user_name: typing.user_name.clone(),
                            generation,
                        },
                    );
                generation
            };
            let _ = self.events.send(StoreEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
            });

            // A lost stop-event must not leave a stale indicator; the timer
            // only clears the generation it was armed for.
            let store = Arc::clone(self);
            let conversation_id = conversation_id.clone();
            let user_id = typing.user_id;
            tokio::spawn(async move {
                tokio::time::sleep(TYPING_EXPIRY).await;
                store
                    .clear_typing_if_stale(&conversation_id, &user_id, generation)
                    .await;
            });
        } else {
            let removed = {
                let mut state = self.inner.lock().await;
                state
                    .typing
                    .get_mut(conversation_id)
                    .map(|users| users.remove(&typing.user_id).is_some())
                    .unwrap_or(false)
            };
            if removed {
                let _ = self.events.send(StoreEvent::TypingChanged {
                    conversation_id: conversation_id.clone(),
                });
            }
        }
    }

    async fn clear_typing_if_stale(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        generation: u64,
    ) {
        let removed = {
            let mut state = self.inner.lock().await;
            match state.typing.get_mut(conversation_id) {
                Some(users)
                    if users
                        .get(user_id)
                        .is_some_and(|entry| entry.generation == generation) =>
                {
                    users.remove(user_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            let _ = self.events.send(StoreEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    fn spawn_connection_watcher(self: &Arc<Self>) {
        let mut state_rx = self.connection.subscribe();
        let mut previous = *state_rx.borrow();
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let current = *state_rx.borrow();
                let _ = store.events.send(StoreEvent::ConnectionChanged(current));
                if current.is_online() && previous != current {
                    info!("connection: back online; draining outbox");
                    store.process_offline_queue().await;
                    store.schedule_resubscribe().await;
                }
                previous = current;
            }
        });
    }

    /// Schedules a debounced resubscribe for the active conversation. A
    /// newer schedule or an explicit unsubscribe cancels the pending task,
    /// so flapping never resubscribes a stale conversation.
    async fn schedule_resubscribe(self: &Arc<Self>) {
        let target = {
            let subscription = self.subscription.lock().await;
            match subscription.as_ref() {
                Some(handle) if !handle.is_joined() => Some(handle.conversation_id().clone()),
                _ => None,
            }
        };
        let Some(conversation_id) = target else {
            return;
        };

        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(RESUBSCRIBE_DEBOUNCE).await;
            if !store.connection.is_online() {
                return;
            }
            let still_stale = {
                let subscription = store.subscription.lock().await;
                matches!(
                    subscription.as_ref(),
                    Some(handle) if handle.conversation_id() == &conversation_id && !handle.is_joined()
                )
            };
            if !still_stale {
                return;
            }
            info!(conversation_id = %conversation_id, "realtime: resubscribing after reconnect");
            store.teardown_subscription().await;
            if let Err(err) = store.subscribe_to_messages(conversation_id.clone()).await {
                warn!(conversation_id = %conversation_id, "realtime: resubscribe failed: {err:#}");
            }
        });

        let mut guard = self.resubscribe_task.lock().await;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }
}

fn validate_outgoing(outgoing: &OutgoingMessage) -> Result<(), SendError> {
    if outgoing.conversation_id.as_str().trim().is_empty() {
        return Err(SendError::Validation("conversation id is required".into()));
    }
    if outgoing.sender_id.as_str().trim().is_empty() {
        return Err(SendError::Validation("sender id is required".into()));
    }
    if outgoing.content.trim().is_empty() && outgoing.media_url.is_none() {
        return Err(SendError::Validation("message content is empty".into()));
    }
    Ok(())
}

/// Window-local read heuristic: a fetched message counts as read when any
/// later message from a different sender exists in the same window, else
/// delivered. An approximation, not a receipt join.
fn compute_window_statuses(rows: &[MessageRow]) -> Vec<MessageStatus> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let answered_later = rows[index + 1..]
                .iter()
                .any(|later| later.sender_id != row.sender_id);
            if answered_later {
                MessageStatus::Read
            } else {
                MessageStatus::Delivered
            }
        })
        .collect()
}

fn kind_for_filename(filename: &str) -> MessageKind {
    let extension = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" => MessageKind::Image,
        _ => MessageKind::File,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod reconcile_tests;

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod rest_tests;
