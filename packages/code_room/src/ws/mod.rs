//! WebSocket transport for rooms.

mod connection;
pub mod protocol;

pub use connection::handle_room_ws;
