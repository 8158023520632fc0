//! Generic `call` command: invoke any (service, method) with raw params.

use std::time::Duration;

use anyhow::{Context, Result};
use commgate::client::{self, DaemonClient};
use commgate::config::Config;
use serde_json::Value;

use super::{print_result, unwrap_or_fail};

pub async fn run(
    config: Config,
    service: String,
    method: String,
    params: Option<String>,
    timeout_ms: Option<u64>,
    pretty: bool,
) -> Result<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(&raw).context("--params must be a JSON object")?,
        None => Value::Object(serde_json::Map::new()),
    };
    if !params.is_object() {
        anyhow::bail!("--params must be a JSON object");
    }

    let mut client = DaemonClient::new(&config);
    if let Some(ms) = timeout_ms {
        client = client.with_timeout(Duration::from_millis(ms));
    }

    let result = unwrap_or_fail(client::call(&client, &service, &method, params).await);
    print_result(&result, pretty);
    Ok(())
}
