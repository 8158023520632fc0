//! CLI command implementations.
//!
//! Each command marshals argv into one request, prints one response, and
//! exits. Failures exit non-zero with the taxonomy code from
//! `ClientError` so scripts can distinguish "daemon absent" from "call
//! failed".

pub mod call;
pub mod contacts;
pub mod daemon;
pub mod messages;

use commgate::client::ClientError;
use serde_json::Value;

/// Print a result payload to stdout.
pub fn print_result(value: &Value, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(s) => println!("{s}"),
        Err(e) => {
            eprintln!("failed to render result: {e}");
            std::process::exit(1);
        }
    }
}

/// Report a client failure and exit with its taxonomy code.
pub fn fail(err: ClientError) -> ! {
    eprintln!("{err}");
    std::process::exit(err.exit_code());
}

/// Unwrap a call result or exit.
pub fn unwrap_or_fail<T>(result: Result<T, ClientError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fail(err),
    }
}
