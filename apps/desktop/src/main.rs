use anyhow::Result;
use clap::Parser;
use client_core::{ClientEvent, InboxClient};
use shared::domain::{AccountId, Platform, SessionKey};
use tracing::info;
use url::Url;

#[derive(Parser, Debug)]
struct Args {
    /// Aggregator REST endpoint, e.g. http://localhost:8080
    #[arg(long)]
    server_url: String,
    /// Push websocket endpoint, e.g. ws://localhost:8080/push
    #[arg(long)]
    push_url: Url,
    /// Session identifier issued at login
    #[arg(long)]
    session: String,
    /// Optional platform:account pair to prefetch dialogs for, e.g. telegram:acct-1
    #[arg(long)]
    account: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let client = InboxClient::new(args.server_url, args.push_url);
    let mut events = client.subscribe_events();

    let session = SessionKey::new(args.session);
    client.attach_session(&session).await;
    info!(session = %session, "attached push session");

    if let Some(account) = args.account.as_deref() {
        let (platform, account_id) = account
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("--account expects platform:account"))?;
        let platform = Platform::new(platform);
        let account_id = AccountId::new(account_id);
        let mut offset = None;
        loop {
            let next = client
                .fetch_dialogs(&platform, &account_id, offset.as_deref())
                .await?;
            match next {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        for preview in client.dialogs().previews().await {
            println!(
                "{}  unread={}  pinned={}  {}",
                preview.chat, preview.unread_count, preview.pinned, preview.title
            );
        }
    }

    println!("Streaming engine events (ctrl-c to exit).");
    while let Ok(event) = events.recv().await {
        match event {
            ClientEvent::Raw { session, payload } => {
                println!("[{session}] raw frame: {payload}");
            }
            other => println!("{other:?}"),
        }
    }
    Ok(())
}
