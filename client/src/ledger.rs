//! Chip transfers between members of the active room.

use crate::{sync::RoomView, Error, Gateway, Precondition, Result};
use chipledger_types::{
    api::TransferRequest,
    ledger::{validate_transfer, ParticipantId, TransferReceipt},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How a transfer is written to the gateway.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// One call to the gateway's transfer procedure, which validates and
    /// applies the record and both balance changes together.
    #[default]
    Atomic,
    /// Three independent writes: insert the record, debit the sender, credit
    /// the receiver. Balances are computed from the local view, so racing
    /// transfers can overwrite each other and a failure part-way leaves the
    /// earlier writes in place.
    Sequential,
}

/// A write of the sequential transfer path that completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStep {
    RecordInserted,
    SenderDebited,
    ReceiverCredited,
}

/// Balances a transfer was checked against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checked {
    pub room: String,
    pub sender_chips: i64,
    pub receiver_chips: i64,
}

/// Client-side transfer guard, evaluated against the local view only.
pub fn check(
    view: &RoomView,
    from: ParticipantId,
    to: ParticipantId,
    amount: i64,
) -> std::result::Result<Checked, Precondition> {
    let room = view.room_id.clone().ok_or(Precondition::NotInRoom)?;
    validate_transfer(from, to, amount)?;
    let sender = view.member(from).ok_or(Precondition::NotMember(from))?;
    let receiver = view.member(to).ok_or(Precondition::NotMember(to))?;
    if sender.chips() < amount {
        return Err(Precondition::InsufficientChips {
            balance: sender.chips(),
            amount,
        });
    }
    Ok(Checked {
        room,
        sender_chips: sender.chips(),
        receiver_chips: receiver.chips(),
    })
}

/// Ledger engine.
pub struct Ledger<G: Gateway> {
    gateway: G,
    mode: TransferMode,
}

impl<G: Gateway> Ledger<G> {
    pub fn new(gateway: G, mode: TransferMode) -> Self {
        Self { gateway, mode }
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Move `amount` chips from `from` to `to` in the view's room.
    ///
    /// Nothing is written unless the guard passes. The caller is expected to
    /// refresh its view afterwards; no delta is applied locally.
    pub async fn transfer(
        &self,
        view: &RoomView,
        from: ParticipantId,
        to: ParticipantId,
        amount: i64,
    ) -> Result<TransferReceipt> {
        let checked = check(view, from, to, amount)?;
        let request = TransferRequest {
            from_player: from,
            to_player: to,
            amount,
        };
        let receipt = match self.mode {
            TransferMode::Atomic => self.gateway.transfer(&checked.room, &request).await?,
            TransferMode::Sequential => self.sequential(&checked, &request).await?,
        };
        info!(
            room = %checked.room,
            %from,
            %to,
            amount,
            mode = ?self.mode,
            "transfer complete"
        );
        Ok(receipt)
    }

    async fn sequential(
        &self,
        checked: &Checked,
        request: &TransferRequest,
    ) -> Result<TransferReceipt> {
        let room = checked.room.as_str();
        let record = self.gateway.insert_transfer(room, request).await?;
        let mut applied = vec![TransferStep::RecordInserted];

        let sender_chips = checked.sender_chips - request.amount;
        let receiver_chips = checked.receiver_chips.saturating_add(request.amount);
        let writes = [
            (request.from_player, sender_chips, TransferStep::SenderDebited),
            (request.to_player, receiver_chips, TransferStep::ReceiverCredited),
        ];
        for (participant, chips, step) in writes {
            match self.gateway.update_chips(room, participant, chips).await {
                Ok(affected) => {
                    if affected.rows == 0 {
                        warn!(room, %participant, ?step, "balance update matched no membership");
                    }
                    applied.push(step);
                }
                Err(e) => {
                    warn!(room, ?applied, record = %record.id, "transfer left partially applied");
                    return Err(Error::PartialTransfer {
                        applied,
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(TransferReceipt {
            record,
            sender_chips,
            receiver_chips,
        })
    }
}
