use serde::{Deserialize, Serialize};

/// Row of the `rooms` table. The id is the human-typable room code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    /// Unix time in milliseconds
    pub created_at: u64,
}
