//! Broadcast Hub
//!
//! Fans frames out to every participant of one session. Each participant has
//! its own bounded queue; a participant whose queue is full (or whose
//! connection is gone) is evicted instead of being waited on, so one slow
//! reader never holds up the rest of the room.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ws::protocol::ServerFrame;

pub type ParticipantId = Uuid;

/// Sending side of one connection, as seen by its session
#[derive(Clone, Debug)]
pub struct Participant {
    pub id: ParticipantId,
    sender: mpsc::Sender<ServerFrame>,
    evicted: CancellationToken,
}

impl Participant {
    /// Create a participant and the receiving end its connection drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let participant = Self {
            id: Uuid::new_v4(),
            sender,
            evicted: CancellationToken::new(),
        };
        (participant, receiver)
    }

    /// Cancelled when the session drops this participant for falling behind
    pub fn eviction_token(&self) -> CancellationToken {
        self.evicted.clone()
    }

    pub(crate) fn try_deliver(&self, frame: ServerFrame) -> Result<(), TrySendError<ServerFrame>> {
        self.sender.try_send(frame)
    }
}

#[derive(Debug, Default)]
pub struct Hub {
    /// Join order
    participants: Vec<Participant>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.participants.iter().any(|p| p.id == id)
    }

    pub fn add(&mut self, participant: Participant) {
        if !self.contains(participant.id) {
            self.participants.push(participant);
        }
    }

    pub fn remove(&mut self, id: ParticipantId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.id != id);
        self.participants.len() != before
    }

    /// Deliver to every participant. Returns how many were evicted.
    pub fn broadcast(&mut self, frame: &ServerFrame) -> usize {
        self.deliver_where(frame, |_| true)
    }

    /// Deliver to everyone but `sender`. Returns how many were evicted.
    pub fn broadcast_except(&mut self, sender: ParticipantId, frame: &ServerFrame) -> usize {
        self.deliver_where(frame, |p| p.id != sender)
    }

    /// Deliver to one participant. Returns how many were evicted (0 or 1).
    pub fn send_to(&mut self, id: ParticipantId, frame: &ServerFrame) -> usize {
        self.deliver_where(frame, |p| p.id == id)
    }

    fn deliver_where(
        &mut self,
        frame: &ServerFrame,
        mut wanted: impl FnMut(&Participant) -> bool,
    ) -> usize {
        let before = self.participants.len();

        self.participants.retain(|p| {
            if !wanted(p) {
                return true;
            }
            match p.try_deliver(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(participant = %p.id, frame = frame.kind(), "Outbound queue full, evicting participant");
                    p.evicted.cancel();
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(participant = %p.id, "Outbound queue closed, dropping participant");
                    p.evicted.cancel();
                    false
                }
            }
        });

        before - self.participants.len()
    }
}
