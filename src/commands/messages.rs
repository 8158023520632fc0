//! Message commands: shortcuts over the `messages` service.

use anyhow::Result;
use commgate::client::{self, DaemonClient};
use commgate::config::Config;
use serde_json::json;

use crate::MessagesAction;

use super::{print_result, unwrap_or_fail};

pub async fn run(config: Config, action: MessagesAction, pretty: bool) -> Result<()> {
    let client = DaemonClient::new(&config);

    let (method, params) = match action {
        MessagesAction::UnreadCount => ("unread_count", json!({})),
        MessagesAction::Unread { limit } => ("unread", json!({ "limit": limit })),
        MessagesAction::Recent { limit } => ("recent", json!({ "limit": limit })),
        MessagesAction::Search { query, limit, since } => {
            let mut params = json!({ "query": query, "limit": limit });
            if let Some(since) = since {
                params["since"] = json!(since);
            }
            ("search", params)
        }
        MessagesAction::With { contact, limit } => {
            ("with_contact", json!({ "contact": contact, "limit": limit }))
        }
        MessagesAction::Send { to, text } => ("send", json!({ "to": to, "text": text })),
    };

    let result = unwrap_or_fail(client::call(&client, "messages", method, params).await);
    print_result(&result, pretty);
    Ok(())
}
