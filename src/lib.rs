#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! hubchat library: real-time chat over a persistent hub connection.
//!
//! Modules, leaves first:
//! - `message`: the chat line value type
//! - `error`: per-operation error enums
//! - `transport`: `HubTransport` trait and the SignalR JSON WebSocket client
//! - `connection`: connection lifecycle controller and single-slot stream registry
//! - `storage`: message persistence (memory, JSON lines)
//! - `session`: ordered chat log, slash commands, and the delivery loop
//! - `presentation`: view state and banner signals for a UI
//! - `config`: TOML/env/CLI configuration

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod presentation;
pub mod session;
pub mod storage;
pub mod transport;
