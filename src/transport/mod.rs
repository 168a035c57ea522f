//! Network transport between client and server.

pub mod tcp;

pub use tcp::{bind, ServerSession};
