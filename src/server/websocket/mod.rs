//! WebSocket transport for live download progress.
//!
//! Every connection holds its own broadcaster subscription. Delivery is
//! best-effort: a client that falls behind loses events and is expected to
//! send `request_status` to reconcile.

pub mod handler;
pub mod messages;

pub use handler::ws_handler;
pub use messages::{msg_types, ClientMessage, ServerMessage};
