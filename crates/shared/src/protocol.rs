use serde::{Deserialize, Serialize};

use crate::domain::{
    AccountId, ChatKey, ChatPreview, LocalId, MessageId, Platform, UnifiedMessage,
};

/// Inbound push envelope, `{ "type": ..., "data": ... }` on the wire. Frames
/// that do not parse as this enum are passed through raw by the connection
/// layer rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage {
        message: UnifiedMessage,
    },
    MessageEdited {
        message: UnifiedMessage,
    },
    MessageDeleted {
        chat: ChatKey,
        message_id: MessageId,
    },
    ReadReceipt {
        chat: ChatKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<MessageId>,
    },
    TypingStart {
        chat: ChatKey,
        user: String,
    },
    TypingStop {
        chat: ChatKey,
        user: String,
    },
    AccountStatus {
        platform: Platform,
        account_id: AccountId,
        online: bool,
    },
    PinChanged {
        chat: ChatKey,
        pinned: bool,
    },
    ViewCount {
        chat: ChatKey,
        message_id: MessageId,
        views: u64,
    },
    /// Correlates a provisional send with its final identifier. Providers
    /// that echo the client's temp id set it on the message; the rest are
    /// reconciled by fingerprint in the outbox.
    MessageConfirmed {
        message: UnifiedMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    User,
    Group,
    Channel,
}

/// Platform-specific addressing carried by outbound actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatAddress {
    pub chat: ChatKey,
    pub peer_kind: PeerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_hash: Option<String>,
}

impl ChatAddress {
    pub fn new(chat: ChatKey, peer_kind: PeerKind) -> Self {
        Self {
            chat,
            peer_kind,
            access_hash: None,
        }
    }

    pub fn with_access_hash(mut self, access_hash: impl Into<String>) -> Self {
        self.access_hash = Some(access_hash.into());
        self
    }
}

/// Outbound client actions, mirroring the subset of the push vocabulary a
/// client may originate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientAction {
    SendMessage {
        address: ChatAddress,
        temp_id: LocalId,
        text: String,
    },
    EditMessage {
        address: ChatAddress,
        message_id: MessageId,
        text: String,
    },
    DeleteMessage {
        address: ChatAddress,
        message_id: MessageId,
    },
    TypingStart {
        address: ChatAddress,
    },
    TypingStop {
        address: ChatAddress,
    },
    MarkRead {
        address: ChatAddress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<MessageId>,
    },
}

/// One backward page of message history from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<UnifiedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// One page of chat previews for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogPage {
    pub dialogs: Vec<ChatPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<String>,
}
