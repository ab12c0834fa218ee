//! Types shared by the chipledger gateway and its clients.
//!
//! [ledger] holds the rows that live in the gateway's tables and the
//! validation rules both sides agree on. [api] holds request and response
//! bodies plus the change-notification types carried by the change feed.

pub mod api;
pub mod ledger;

pub use api::{ChangeEvent, ChangeFilter, ChangeKind, Table};
pub use ledger::{Membership, MembershipView, Participant, ParticipantId, Room, TransferRecord};
