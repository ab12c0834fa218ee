//! In-process gateway backed by the simulator, with fault injection.

use crate::{Error, Gateway, Result};
use chipledger_simulator::Simulator;
use chipledger_types::{
    api::{Affected, ChangeEvent, ChangeFilter, ChangeKind, MembershipUpsert, TransferRequest},
    ledger::{
        Membership, MembershipView, Participant, ParticipantId, Room, TransferReceipt,
        TransferRecord,
    },
};
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Gateway operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    InsertRoom,
    GetRoom,
    UpsertPlayer,
    RenamePlayer,
    ListMemberships,
    UpsertMembership,
    UpdateChips,
    DeleteMembership,
    ListTransfers,
    InsertTransfer,
    Transfer,
    Subscribe,
}

impl Op {
    fn is_write(&self) -> bool {
        !matches!(
            self,
            Op::GetRoom | Op::ListMemberships | Op::ListTransfers | Op::Subscribe
        )
    }
}

/// A [Gateway] that calls straight into a [Simulator].
#[derive(Clone, Default)]
pub struct LocalGateway {
    simulator: Arc<Simulator>,
    /// Successful calls left before the operation fails once
    faults: Arc<Mutex<HashMap<Op, usize>>>,
    writes: Arc<AtomicUsize>,
}

impl LocalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simulator(&self) -> &Arc<Simulator> {
        &self.simulator
    }

    /// Fail the next call of `op`.
    pub fn fail_next(&self, op: Op) {
        self.fail_after(op, 0);
    }

    /// Let `successes` calls of `op` through, then fail the one after.
    pub fn fail_after(&self, op: Op, successes: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(op, successes);
        }
    }

    /// Number of write operations attempted so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, op: Op) -> Result<()> {
        if op.is_write() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        let Ok(mut faults) = self.faults.lock() else {
            return Ok(());
        };
        match faults.get_mut(&op) {
            Some(0) => {
                faults.remove(&op);
                Err(Error::Failed {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    message: format!("injected failure: {op:?}"),
                })
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn convert(err: chipledger_simulator::Error) -> Error {
    let status = reqwest::StatusCode::from_u16(err.status().as_u16())
        .unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    Error::Failed {
        status,
        message: err.to_string(),
    }
}

impl Gateway for LocalGateway {
    type Feed = BoxStream<'static, Result<ChangeEvent>>;

    async fn insert_room(&self, code: &str) -> Result<(Room, bool)> {
        self.check(Op::InsertRoom)?;
        self.simulator.insert_room(code).map_err(convert)
    }

    async fn get_room(&self, code: &str) -> Result<Option<Room>> {
        self.check(Op::GetRoom)?;
        self.simulator.get_room(code).map_err(convert)
    }

    async fn upsert_player(&self, player: &Participant) -> Result<Participant> {
        self.check(Op::UpsertPlayer)?;
        self.simulator
            .upsert_player(player.clone())
            .map_err(convert)
    }

    async fn rename_player(&self, id: ParticipantId, name: &str) -> Result<Affected> {
        self.check(Op::RenamePlayer)?;
        self.simulator.rename_player(id, name).map_err(convert)
    }

    async fn list_memberships(
        &self,
        room: &str,
        participant: Option<ParticipantId>,
    ) -> Result<Vec<MembershipView>> {
        self.check(Op::ListMemberships)?;
        self.simulator
            .list_memberships(room, participant)
            .map_err(convert)
    }

    async fn upsert_membership(&self, room: &str, upsert: &MembershipUpsert) -> Result<Membership> {
        self.check(Op::UpsertMembership)?;
        self.simulator
            .upsert_membership(room, upsert.clone())
            .map_err(convert)
    }

    async fn update_chips(
        &self,
        room: &str,
        participant: ParticipantId,
        chips: i64,
    ) -> Result<Affected> {
        self.check(Op::UpdateChips)?;
        self.simulator
            .update_chips(room, participant, chips)
            .map_err(convert)
    }

    async fn delete_membership(&self, room: &str, participant: ParticipantId) -> Result<Affected> {
        self.check(Op::DeleteMembership)?;
        self.simulator
            .delete_membership(room, participant)
            .map_err(convert)
    }

    async fn list_transfers(&self, room: &str) -> Result<Vec<TransferRecord>> {
        self.check(Op::ListTransfers)?;
        self.simulator.list_transfers(room).map_err(convert)
    }

    async fn insert_transfer(
        &self,
        room: &str,
        request: &TransferRequest,
    ) -> Result<TransferRecord> {
        self.check(Op::InsertTransfer)?;
        self.simulator
            .insert_transfer(room, request.clone())
            .map_err(convert)
    }

    async fn transfer(&self, room: &str, request: &TransferRequest) -> Result<TransferReceipt> {
        self.check(Op::Transfer)?;
        self.simulator
            .transfer(room, request.clone())
            .map_err(convert)
    }

    async fn subscribe(&self, filter: &ChangeFilter) -> Result<Self::Feed> {
        self.check(Op::Subscribe)?;
        let receiver = self.simulator.change_subscriber();
        let feed = stream::unfold(
            (receiver, filter.clone()),
            |(mut receiver, filter)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if filter.matches(&event) => {
                            return Some((Ok(event), (receiver, filter)))
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "local change feed lagged");
                            let event = ChangeEvent {
                                table: filter.table,
                                kind: ChangeKind::Update,
                                room_id: filter.room_id.clone(),
                            };
                            return Some((Ok(event), (receiver, filter)));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );
        Ok(feed.boxed())
    }
}
