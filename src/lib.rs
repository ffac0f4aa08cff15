//! Resumable chunked file transfer server.
//!
//! Uploads are split into indexed chunks that may arrive in any order and be
//! retried freely. Each session lives in its own directory under the storage
//! root; once every chunk is present the session is assembled into a single
//! verified file. Progress and room activity are pushed to subscribers over
//! server-sent events.

pub mod assembly;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod handlers;
pub mod hub;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod received;
pub mod room;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod utils;
