use serde_repr::{Deserialize_repr, Serialize_repr};

/// Lifecycle of a participant. Transitions only move forward; `Disconnected`
/// is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParticipantState {
    Joining = 0,
    Joined = 1,
    Active = 2,
    Disconnected = 3,
}

impl From<u8> for ParticipantState {
    fn from(val: u8) -> Self {
        match val {
            0 => ParticipantState::Joining,
            1 => ParticipantState::Joined,
            2 => ParticipantState::Active,
            _ => ParticipantState::Disconnected,
        }
    }
}

impl From<ParticipantState> for u8 {
    fn from(state: ParticipantState) -> Self {
        state as u8
    }
}

impl ParticipantState {
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}
