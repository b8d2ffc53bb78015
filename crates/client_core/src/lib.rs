//! Real-time reconciliation engine for the unified inbox: push connections,
//! optimistic sends, per-chat message lists, pagination, and chat previews.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{
    AccountId, ChatKey, LocalId, MessageId, MessageStatus, Platform, SessionKey, UnifiedMessage,
};
use shared::protocol::{ChatAddress, ClientAction, PushEvent};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod connection;
pub mod dialogs;
pub mod message_store;
pub mod outbox;
pub mod rest;
pub mod scroll;

pub use connection::{
    ConnectionRegistry, ConnectionState, ManagedConnection, PushFrame, PushSocket, PushTransport,
    WsPushTransport,
};
pub use dialogs::{DialogAggregator, DialogSource};
pub use message_store::{HistorySource, MessageStore, PaginationCursor};
pub use outbox::Outbox;
pub use rest::RestApi;
pub use scroll::{
    capture_anchor, restore_anchor, MessageExtent, ScrollAnchor, ScrollController, Viewport,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Mutation endpoint used when the push channel cannot originate an action.
#[async_trait]
pub trait SendGateway: Send + Sync {
    async fn dispatch(&self, action: &ClientAction) -> Result<()>;
}

/// Engine events delivered to the UI shell.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged {
        session: SessionKey,
        state: ConnectionState,
    },
    MessagesChanged {
        chat: ChatKey,
    },
    PreviewChanged {
        chat: ChatKey,
    },
    TypingChanged {
        chat: ChatKey,
    },
    AccountStatusChanged {
        platform: Platform,
        account_id: AccountId,
        online: bool,
    },
    SendFailed {
        chat: ChatKey,
        local_id: LocalId,
        reason: String,
    },
    Raw {
        session: SessionKey,
        payload: String,
    },
}

pub struct InboxClient {
    connections: ConnectionRegistry,
    store: MessageStore,
    dialogs: DialogAggregator,
    outbox: Mutex<Outbox>,
    gateway: Arc<dyn SendGateway>,
    attached: Mutex<HashSet<SessionKey>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl InboxClient {
    /// Production wiring: one REST client for all collaborator roles plus
    /// the websocket push transport.
    pub fn new(server_url: impl Into<String>, push_url: url::Url) -> Arc<Self> {
        let api = Arc::new(RestApi::new(server_url));
        Self::new_with_dependencies(
            Arc::new(WsPushTransport::new(push_url)),
            api.clone(),
            api.clone(),
            api,
        )
    }

    pub fn new_with_dependencies(
        transport: Arc<dyn PushTransport>,
        history: Arc<dyn HistorySource>,
        dialog_source: Arc<dyn DialogSource>,
        gateway: Arc<dyn SendGateway>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connections: ConnectionRegistry::new(transport),
            store: MessageStore::new(history),
            dialogs: DialogAggregator::new(dialog_source),
            outbox: Mutex::new(Outbox::new()),
            gateway,
            attached: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn dialogs(&self) -> &DialogAggregator {
        &self.dialogs
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Connect the session's push channel and start folding its events into
    /// the store and previews. Idempotent per session key.
    pub async fn attach_session(self: &Arc<Self>, session: &SessionKey) {
        {
            let mut attached = self.attached.lock().await;
            if !attached.insert(session.clone()) {
                debug!(session = %session, "client: session already attached");
                return;
            }
        }
        self.ensure_typing_sweeper().await;

        let mut frames = self.connections.subscribe(session).await;
        let connection = self.connections.ensure(session).await;
        let mut status = connection.status();

        let client = Arc::clone(self);
        let status_session = session.clone();
        let status_task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let state = *status.borrow();
                client.emit(ClientEvent::ConnectionChanged {
                    session: status_session.clone(),
                    state,
                });
            }
        });

        let client = Arc::clone(self);
        let pump_session = session.clone();
        let pump_task = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => client.apply_frame(&pump_session, frame).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session = %pump_session, skipped, "client: event consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(status_task);
        tasks.push(pump_task);
    }

    async fn ensure_typing_sweeper(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock().await;
        if guard.is_some() {
            return;
        }
        let client = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(TYPING_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                for chat in client.dialogs.sweep_expired().await {
                    client.emit(ClientEvent::TypingChanged { chat });
                }
            }
        }));
    }

    async fn apply_frame(&self, session: &SessionKey, frame: PushFrame) {
        match frame {
            PushFrame::Raw(payload) => {
                debug!(session = %session, "client: raw passthrough frame");
                self.emit(ClientEvent::Raw {
                    session: session.clone(),
                    payload,
                });
            }
            PushFrame::Event(event) => self.apply_event(event).await,
        }
    }

    async fn apply_event(&self, event: PushEvent) {
        match &event {
            PushEvent::NewMessage { message } | PushEvent::MessageConfirmed { message } => {
                let message = self.reconcile_confirmed(message.clone()).await;
                let chat = message.chat.clone();
                let changed = self.store.add_or_update(&chat, message).await;
                self.dialogs.apply(&event).await;
                if changed {
                    self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
                }
                self.emit(ClientEvent::PreviewChanged { chat });
            }
            PushEvent::MessageEdited { message } => {
                let chat = message.chat.clone();
                let changed = self.store.add_or_update(&chat, message.clone()).await;
                self.dialogs.apply(&event).await;
                if changed {
                    self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
                }
                self.emit(ClientEvent::PreviewChanged { chat });
            }
            PushEvent::MessageDeleted { chat, message_id } => {
                let changed = self.store.remove(chat, message_id).await;
                self.dialogs.apply(&event).await;
                if changed {
                    self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
                }
                self.emit(ClientEvent::PreviewChanged { chat: chat.clone() });
            }
            PushEvent::ReadReceipt { chat, up_to } => {
                let changed = self.store.mark_delivered(chat, up_to.as_ref()).await;
                self.dialogs.apply(&event).await;
                if changed {
                    self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
                }
                self.emit(ClientEvent::PreviewChanged { chat: chat.clone() });
            }
            PushEvent::TypingStart { chat, .. } | PushEvent::TypingStop { chat, .. } => {
                self.dialogs.apply(&event).await;
                self.emit(ClientEvent::TypingChanged { chat: chat.clone() });
            }
            PushEvent::AccountStatus {
                platform,
                account_id,
                online,
            } => {
                self.dialogs.apply(&event).await;
                self.emit(ClientEvent::AccountStatusChanged {
                    platform: platform.clone(),
                    account_id: account_id.clone(),
                    online: *online,
                });
            }
            PushEvent::PinChanged { chat, .. } => {
                self.dialogs.apply(&event).await;
                self.emit(ClientEvent::PreviewChanged { chat: chat.clone() });
            }
            PushEvent::ViewCount {
                chat,
                message_id,
                views,
            } => {
                let changed = self.store.apply_views(chat, message_id, *views).await;
                self.dialogs.apply(&event).await;
                if changed {
                    self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
                }
            }
        }
    }

    /// Match a confirmed message against the outbox so it collapses into its
    /// provisional slot. Providers that echo the temp id skip the
    /// fingerprint scan, but their entry still has to be consumed.
    async fn reconcile_confirmed(&self, mut message: UnifiedMessage) -> UnifiedMessage {
        {
            let mut outbox = self.outbox.lock().await;
            match message.temp_id.clone() {
                Some(local_id) => outbox.discard(&message.chat, &message.text, &local_id),
                None => message.temp_id = outbox.try_match(&message),
            }
        }
        if message.temp_id.is_some() && message.status == MessageStatus::Pending {
            message.status = MessageStatus::Sent;
        }
        message
    }

    /// Optimistic send: the provisional message is visible immediately and
    /// collapses into the confirmed one when the provider echoes it back.
    pub async fn send_message(
        &self,
        session: &SessionKey,
        address: &ChatAddress,
        text: &str,
    ) -> Result<LocalId> {
        let chat = address.chat.clone();
        let local_id = LocalId::random();
        let now = Utc::now();
        let provisional =
            UnifiedMessage::provisional(chat.clone(), local_id.clone(), text.to_string(), now);

        self.store.add_or_update(&chat, provisional).await;
        {
            let mut outbox = self.outbox.lock().await;
            outbox.register(&chat, text, local_id.clone(), now);
        }
        self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });

        let action = ClientAction::SendMessage {
            address: address.clone(),
            temp_id: local_id.clone(),
            text: text.to_string(),
        };
        if let Err(err) = self.dispatch_action(session, &action).await {
            // Roll back the provisional entry and its outbox registration;
            // this is the only deletion path besides a successful match.
            {
                let mut outbox = self.outbox.lock().await;
                outbox.discard(&chat, text, &local_id);
            }
            self.store
                .remove(&chat, &MessageId::new(local_id.as_str()))
                .await;
            self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
            self.emit(ClientEvent::SendFailed {
                chat,
                local_id,
                reason: err.to_string(),
            });
            return Err(err);
        }
        Ok(local_id)
    }

    pub async fn edit_message(
        &self,
        session: &SessionKey,
        address: &ChatAddress,
        message_id: MessageId,
        text: &str,
    ) -> Result<()> {
        let action = ClientAction::EditMessage {
            address: address.clone(),
            message_id,
            text: text.to_string(),
        };
        self.dispatch_action(session, &action).await
    }

    pub async fn delete_message(
        &self,
        session: &SessionKey,
        address: &ChatAddress,
        message_id: MessageId,
    ) -> Result<()> {
        let action = ClientAction::DeleteMessage {
            address: address.clone(),
            message_id,
        };
        self.dispatch_action(session, &action).await
    }

    pub async fn set_typing(
        &self,
        session: &SessionKey,
        address: &ChatAddress,
        active: bool,
    ) -> Result<()> {
        let action = if active {
            ClientAction::TypingStart {
                address: address.clone(),
            }
        } else {
            ClientAction::TypingStop {
                address: address.clone(),
            }
        };
        self.dispatch_action(session, &action).await
    }

    /// Reset the local counter immediately and tell the provider; the
    /// eventual read-receipt echo is absorbed idempotently.
    pub async fn mark_read(
        &self,
        session: &SessionKey,
        address: &ChatAddress,
        up_to: Option<MessageId>,
    ) -> Result<()> {
        if self.dialogs.mark_read(&address.chat).await {
            self.emit(ClientEvent::PreviewChanged {
                chat: address.chat.clone(),
            });
        }
        let action = ClientAction::MarkRead {
            address: address.clone(),
            up_to,
        };
        self.dispatch_action(session, &action).await
    }

    /// Prefer the open push channel; fall back to the REST gateway when the
    /// socket is down or the write fails.
    async fn dispatch_action(&self, session: &SessionKey, action: &ClientAction) -> Result<()> {
        let connection = self.connections.ensure(session).await;
        if connection.state().await == ConnectionState::Open {
            match connection.send(action).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        session = %session,
                        error = %err,
                        "client: push write failed, falling back to REST"
                    );
                }
            }
        }
        self.gateway.dispatch(action).await
    }

    pub async fn open_chat(&self, chat: &ChatKey) -> Result<bool> {
        let changed = self.store.fetch_initial(chat).await?;
        if changed {
            self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
        }
        Ok(changed)
    }

    pub async fn load_older(&self, chat: &ChatKey) -> Result<bool> {
        let changed = self.store.fetch_older(chat).await?;
        if changed {
            self.emit(ClientEvent::MessagesChanged { chat: chat.clone() });
        }
        Ok(changed)
    }

    /// Navigating away: bound memory, forget cursors, and discard in-flight
    /// outbox entries so late confirmations arrive as independent messages.
    pub async fn close_chat(&self, chat: &ChatKey) {
        self.store.clear(chat).await;
        let mut outbox = self.outbox.lock().await;
        outbox.clear_chat(chat);
    }

    pub async fn fetch_dialogs(
        &self,
        platform: &Platform,
        account_id: &AccountId,
        offset: Option<&str>,
    ) -> Result<Option<String>> {
        let (changed, next_offset) = self.dialogs.fetch_page(platform, account_id, offset).await?;
        for chat in changed {
            self.emit(ClientEvent::PreviewChanged { chat });
        }
        Ok(next_offset)
    }

    /// Tear the session down: close every connection, stop owned tasks, and
    /// drop all volatile state. Nothing survives for a later session.
    pub async fn teardown(&self) {
        self.connections.close_all().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }
        self.attached.lock().await.clear();
        self.store.reset().await;
        self.dialogs.reset().await;
        self.outbox.lock().await.clear();
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
