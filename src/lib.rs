#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! kubesock library: the session orchestration core and its HTTP surface.
//!
//! - `protocol`: message envelope, close codes, request payloads
//! - `transport`: duplex envelope transports (WebSocket, in-memory)
//! - `sessions`: registry, bind handshake, bind-deadline supervisor
//! - `dispatch`: per-session request/reply loop
//! - `bridges`: resource, terminal and log adapters
//! - `backend`: kubectl/helm collaborators and the PTY exec backend
//! - `routes`: creation calls and stream endpoints

pub mod auth;
pub mod backend;
pub mod bridges;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod transport;
pub mod util;

pub use auth::ApiKey;
pub use backend::Backends;
pub use config::Config;
pub use sessions::SessionRegistry;
pub use state::AppState;
