//! Rooms: one actor per live room owning the document, the participants and
//! the current run, plus the registry that creates and disposes them.

mod actor;
mod document;
mod hub;
mod registry;
mod runner;

pub use actor::{SessionHandle, SessionInfo};
pub use hub::{Participant, ParticipantId};
pub use registry::{SessionRegistry, is_valid_room_id};
