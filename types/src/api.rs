use crate::ledger::ParticipantId;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Capacity of the gateway's change broadcast.
pub const CHANGE_BUFFER: usize = 1024;

/// Tables exposed by the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Rooms,
    Players,
    RoomPlayers,
    Transactions,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Rooms => "rooms",
            Table::Players => "players",
            Table::RoomPlayers => "room_players",
            Table::Transactions => "transactions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rooms" => Ok(Table::Rooms),
            "players" => Ok(Table::Players),
            "room_players" => Ok(Table::RoomPlayers),
            "transactions" => Ok(Table::Transactions),
            other => Err(UnknownTable(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown table: {0}")]
pub struct UnknownTable(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Notification that a row in `table` scoped to `room_id` changed.
///
/// Carries no row data: subscribers re-read the collection they care about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub room_id: String,
}

/// Equality predicate `room_id = <value>` on a single table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub table: Table,
    pub room_id: String,
}

impl ChangeFilter {
    pub fn new(table: Table, room_id: impl Into<String>) -> Self {
        Self {
            table,
            room_id: room_id.into(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.room_id == event.room_id
    }
}

/// Body of `POST /rooms`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRoom {
    pub id: String,
}

/// Body of `PATCH /players/:id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRename {
    pub name: String,
}

/// Number of rows touched by an update or delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affected {
    pub rows: usize,
}

/// What an upsert does when the key already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    /// Keep the existing row untouched.
    Ignore,
    /// Overwrite the existing row's mutable fields.
    #[default]
    Merge,
}

/// Body of `PUT /rooms/:room/members`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpsert {
    pub participant_id: ParticipantId,
    pub chips: i64,
    #[serde(default)]
    pub on_conflict: OnConflict,
}

/// Body of `PATCH /rooms/:room/members/:participant`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipsUpdate {
    pub chips: i64,
}

/// Query of `GET /rooms/:room/members`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersQuery {
    pub participant: Option<ParticipantId>,
}

/// Body of `POST /rooms/:room/transfers` (record insert) and
/// `POST /rooms/:room/transfer` (atomic procedure).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_player: ParticipantId,
    pub to_player: ParticipantId,
    pub amount: i64,
}

/// Error body returned with every non-2xx response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
