use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParticipantId;

/// Row of the `room_players` table: a participant's stake in one room.
///
/// Unique per `(room_id, participant_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub participant_id: ParticipantId,
    pub room_id: String,
    /// Signed so that balances driven below zero by racing legacy transfers
    /// are reported as-is instead of wrapping.
    pub chips: i64,
    /// Unix time in milliseconds
    pub joined_at: u64,
}

/// A [Membership] joined with the participant's current display name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    #[serde(flatten)]
    pub membership: Membership,
    /// `None` when the `players` row is missing.
    pub name: Option<String>,
}

impl MembershipView {
    pub fn participant_id(&self) -> ParticipantId {
        self.membership.participant_id
    }

    pub fn chips(&self) -> i64 {
        self.membership.chips
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}
