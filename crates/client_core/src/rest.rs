//! reqwest-backed implementations of the REST collaborator traits.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::domain::{AccountId, ChatKey, Platform};
use shared::protocol::{ClientAction, DialogPage, HistoryPage};

use crate::dialogs::DialogSource;
use crate::message_store::HistorySource;
use crate::SendGateway;

/// Aggregator-API client; one instance serves as history source, dialog
/// source, and send gateway.
#[derive(Clone)]
pub struct RestApi {
    http: Client,
    server_url: String,
}

#[derive(Serialize)]
struct HistoryQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
}

#[derive(Serialize)]
struct DialogQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<&'a str>,
}

impl RestApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl HistorySource for RestApi {
    async fn fetch_page(
        &self,
        chat: &ChatKey,
        limit: u32,
        before: Option<&str>,
    ) -> Result<HistoryPage> {
        let page: HistoryPage = self
            .http
            .get(format!(
                "{}/chats/{}/{}/{}/messages",
                self.server_url, chat.platform, chat.account_id, chat.chat_id
            ))
            .query(&HistoryQuery { limit, before })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }
}

#[async_trait]
impl DialogSource for RestApi {
    async fn fetch_dialogs(
        &self,
        platform: &Platform,
        account_id: &AccountId,
        limit: u32,
        offset: Option<&str>,
    ) -> Result<DialogPage> {
        let page: DialogPage = self
            .http
            .get(format!(
                "{}/accounts/{}/{}/dialogs",
                self.server_url, platform, account_id
            ))
            .query(&DialogQuery { limit, offset })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }
}

#[async_trait]
impl SendGateway for RestApi {
    async fn dispatch(&self, action: &ClientAction) -> Result<()> {
        self.http
            .post(format!("{}/actions", self.server_url))
            .json(action)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
