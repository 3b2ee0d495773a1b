//! Lock server: protocol state machine plus its TCP listener.

mod listener;
mod session;

pub use listener::{LockServer, ServerHandle, ServerLifecycle};
pub use session::{ConnId, ServerSession, SessionEvent, SessionStats};
