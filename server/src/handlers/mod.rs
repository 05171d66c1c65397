//! Request handlers for sync operations.

mod channel;
mod pull;
mod push;
mod session;

pub use channel::*;
pub use pull::*;
pub use push::*;
pub use session::*;
