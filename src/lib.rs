// rsqlited - a network server for file-backed SQLite databases.
//
// Clients speak the frontend wire protocol; the server splits and
// classifies their SQL, enforces per-user privileges, serializes writers
// through a process-wide lock, and proxies execution to the embedded
// engine.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

// Core data model (users, catalogs, privileges, errors)
pub mod core;

// SQL front parser: statement splitter, dialect recognizers, meta SQL
// rendering
pub mod parser;

// Per-connection transaction state and the write-lock coordinator
pub mod transaction;

// The meta database: users, grants and catalogs
pub mod meta;

// Network layer: server, workers, processors, wire protocol, auth
pub mod network;

// Configuration loading and tunables
pub mod config;

// Re-export commonly used types for convenience
pub use crate::config::ServerConfig;
pub use crate::core::ServerError;
pub use crate::meta::MetaDb;
pub use crate::network::{Server, SERVER_VERSION};
pub use crate::parser::{SqlParser, Statement};
