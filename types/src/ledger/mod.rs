mod code;
mod constants;
mod membership;
mod player;
mod room;
mod transfer;

pub use code::{generate_room_code, normalize_room_code};
pub use constants::*;
pub use membership::*;
pub use player::*;
pub use room::*;
pub use transfer::*;

use thiserror::Error;

/// Rejection of a value before it is allowed to reach the gateway.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name too long: {got} characters (max {max})")]
    NameTooLong { max: usize, got: usize },
    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),
    #[error("amount must be positive (got {0})")]
    NonPositiveAmount(i64),
    #[error("cannot transfer chips to yourself")]
    SelfTransfer,
}

#[cfg(test)]
mod tests;
