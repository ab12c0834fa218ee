use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ParticipantId, ValidationError};

/// Row of the `transactions` table. Append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub room_id: String,
    pub from_player: ParticipantId,
    pub to_player: ParticipantId,
    pub amount: i64,
    /// Unix time in milliseconds
    pub timestamp: u64,
}

/// Result of the atomic transfer procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub record: TransferRecord,
    pub sender_chips: i64,
    pub receiver_chips: i64,
}

/// Checks that hold for every transfer regardless of balances.
pub fn validate_transfer(
    from: ParticipantId,
    to: ParticipantId,
    amount: i64,
) -> Result<(), ValidationError> {
    if from == to {
        return Err(ValidationError::SelfTransfer);
    }
    if amount <= 0 {
        return Err(ValidationError::NonPositiveAmount(amount));
    }
    Ok(())
}
