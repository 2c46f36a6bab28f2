// Network layer: accept loop, worker threads, per-connection processors,
// the wire protocol and the authentication methods.

pub mod auth;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod state;
pub mod worker;

pub use self::server::{Server, ServerCore, SERVER_VERSION};
pub use self::state::{ProcessorState, StateTag};
