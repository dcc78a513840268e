//! Debate SFU signaling API
//!
//! JSON-over-WebSocket signaling at `/ws` and a `/health` check, both served
//! by axum on top of a [`debate_sfu::RoomRegistry`].

pub mod http;
pub mod protocol;
pub mod session;

pub use http::{create_router, AppState};
pub use protocol::{ClientFrame, ClientRequest, ErrorBody, ResponseFrame};
pub use session::Session;
