pub mod health;
pub mod questions;
pub mod rooms;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use questions::random_question_handler;
pub use rooms::{get_room, list_languages, list_rooms};
pub use websocket::room_websocket_handler;
