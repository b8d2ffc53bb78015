use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

macro_rules! str_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

str_newtype!(Platform);
str_newtype!(AccountId);
str_newtype!(ChatId);
str_newtype!(MessageId);
str_newtype!(LocalId);
str_newtype!(SessionKey);

impl LocalId {
    /// Fresh identifier for a provisional message awaiting confirmation.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Composite `platform:account:chat` identifier. Stable, never reused across
/// platforms or accounts; the primary index everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatKey {
    pub platform: Platform,
    pub account_id: AccountId,
    pub chat_id: ChatId,
}

impl ChatKey {
    pub fn new(
        platform: impl Into<Platform>,
        account_id: impl Into<AccountId>,
        chat_id: impl Into<ChatId>,
    ) -> Self {
        Self {
            platform: platform.into(),
            account_id: account_id.into(),
            chat_id: chat_id.into(),
        }
    }
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.account_id, self.chat_id)
    }
}

impl FromStr for ChatKey {
    type Err = EngineError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parts = input.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(platform), Some(account), Some(chat))
                if !platform.is_empty() && !account.is_empty() && !chat.is_empty() =>
            {
                Ok(Self::new(platform, account, chat))
            }
            _ => Err(EngineError::InvalidChatKey {
                input: input.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One message as every provider-specific payload is normalized before it
/// enters the engine. `message_id` is provider-assigned and stable once
/// confirmed; `temp_id` names the provisional slot a local send occupies
/// until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub chat: ChatKey,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<LocalId>,
    pub text: String,
    pub date: DateTime<Utc>,
    pub direction: Direction,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<u64>,
}

impl UnifiedMessage {
    /// Provisional entry for an optimistic send; the temp id doubles as the
    /// list id until the provider assigns the real one.
    pub fn provisional(chat: ChatKey, local_id: LocalId, text: String, date: DateTime<Utc>) -> Self {
        Self {
            chat,
            message_id: MessageId::new(local_id.as_str()),
            temp_id: Some(local_id),
            text,
            date,
            direction: Direction::Outgoing,
            status: MessageStatus::Pending,
            media: None,
            views: None,
        }
    }
}

/// Chat-list record maintained by the dialog aggregator and returned by the
/// dialog fetch endpoint. `last_message` is a denormalized snapshot and may
/// be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPreview {
    pub chat: ChatKey,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<UnifiedMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub pinned: bool,
}

impl ChatPreview {
    /// Minimal record created from a push event before dialog details are
    /// fetched, so the chat list can render something immediately.
    pub fn shadow(chat: &ChatKey) -> Self {
        Self {
            chat: chat.clone(),
            title: chat.chat_id.to_string(),
            last_message: None,
            unread_count: 0,
            pinned: false,
        }
    }
}
