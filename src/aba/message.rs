use serde::{Deserialize, Serialize};

/// Round-tagged binary-agreement messages. Both kinds are unsigned; the
/// transport authenticates the initiator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum Message {
    /// The sender's current estimate for the round.
    Est(usize, bool),
    /// A value the sender saw reach the safe-value quorum.
    Aux(usize, bool),
}

impl Message {
    pub fn action_str(&self) -> &str {
        match self {
            Message::Est(..) => "est",
            Message::Aux(..) => "aux",
        }
    }
}
