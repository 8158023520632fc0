//! Daemon Module
//!
//! The warm half of the thin-client/daemon pairing. The daemon holds the
//! expensive state (database handles, OAuth tokens, the contact
//! directory) and serves one-shot requests over a Unix domain socket.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                    gateway daemon                     │
//! │                                                       │
//! │  ┌─────────────────────────────────────────────────┐  │
//! │  │                  DaemonState                    │  │
//! │  │  ┌───────────┐ ┌────────────┐ ┌──────────────┐  │  │
//! │  │  │ Backend   │ │ Credential │ │ Contact      │  │  │
//! │  │  │ Registry  │ │ Cache      │ │ Directory    │  │  │
//! │  │  └───────────┘ └────────────┘ └──────────────┘  │  │
//! │  └──────────────────────┬──────────────────────────┘  │
//! │                         │                             │
//! │  ┌──────────────────────┴──────────────────────────┐  │
//! │  │               Request Handler                   │  │
//! │  │   parse → validate → route → time → respond     │  │
//! │  └─────────────────────────────────────────────────┘  │
//! │                                                       │
//! │  ┌────────────────┐                                   │
//! │  │ Unix Socket    │ ◀── one NDJSON request per        │
//! │  │ (Local IPC)    │     connection from the client    │
//! │  └────────────────┘                                   │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod handler;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod server;

pub use handler::RequestHandler;
pub use lifecycle::{daemon_pid, is_daemon_running, signal_stop, Daemon};
pub use protocol::{
    decode_line, encode_line, ErrorCode, ErrorPayload, Request, Response, ResponseMeta,
    MAX_LINE_BYTES, PROTOCOL_VERSION,
};
pub use registry::{DaemonState, SERVICES};
pub use server::GatewayServer;
