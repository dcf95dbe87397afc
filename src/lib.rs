//! FamSync host application.
//!
//! Wires the `famsync-core` engine to a SQLite local store and an HTTP
//! record server, and ships that server as `famsync-server`.

pub mod config;
pub mod db;
pub mod server;
pub mod sync;
