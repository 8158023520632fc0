//! Contact commands: shortcuts over the `contacts` service.

use anyhow::Result;
use commgate::client::{self, DaemonClient};
use commgate::config::Config;
use serde_json::json;

use crate::ContactsAction;

use super::{print_result, unwrap_or_fail};

pub async fn run(config: Config, action: ContactsAction, pretty: bool) -> Result<()> {
    let client = DaemonClient::new(&config);

    let (method, params) = match action {
        ContactsAction::Resolve { query } => ("resolve", json!({ "query": query })),
        ContactsAction::List => ("list", json!({})),
        ContactsAction::Resync => ("resync", json!({})),
    };

    let result = unwrap_or_fail(client::call(&client, "contacts", method, params).await);
    print_result(&result, pretty);
    Ok(())
}
