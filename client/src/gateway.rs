use crate::{Client, Result};
use chipledger_types::{
    api::{Affected, ChangeEvent, ChangeFilter, MembershipUpsert, TransferRequest},
    ledger::{
        Membership, MembershipView, Participant, ParticipantId, Room, TransferReceipt,
        TransferRecord,
    },
};
use futures::Stream;
use std::future::Future;

/// Remote data gateway: the tables a room session reads and writes, plus a
/// change feed.
///
/// Constructed once and handed to every component that needs it. Clones
/// share the same underlying connection.
pub trait Gateway: Clone + Send + Sync + 'static {
    /// Change notifications for one [ChangeFilter]. Dropping the feed
    /// releases the subscription.
    type Feed: Stream<Item = Result<ChangeEvent>> + Send + Unpin + 'static;

    /// Insert a room. Returns the stored room and whether it was created;
    /// an existing room with the same code is returned as-is.
    fn insert_room(&self, code: &str) -> impl Future<Output = Result<(Room, bool)>> + Send;

    fn get_room(&self, code: &str) -> impl Future<Output = Result<Option<Room>>> + Send;

    fn upsert_player(
        &self,
        player: &Participant,
    ) -> impl Future<Output = Result<Participant>> + Send;

    /// Update a participant's name by id.
    fn rename_player(
        &self,
        id: ParticipantId,
        name: &str,
    ) -> impl Future<Output = Result<Affected>> + Send;

    fn list_memberships(
        &self,
        room: &str,
        participant: Option<ParticipantId>,
    ) -> impl Future<Output = Result<Vec<MembershipView>>> + Send;

    fn upsert_membership(
        &self,
        room: &str,
        upsert: &MembershipUpsert,
    ) -> impl Future<Output = Result<Membership>> + Send;

    fn update_chips(
        &self,
        room: &str,
        participant: ParticipantId,
        chips: i64,
    ) -> impl Future<Output = Result<Affected>> + Send;

    fn delete_membership(
        &self,
        room: &str,
        participant: ParticipantId,
    ) -> impl Future<Output = Result<Affected>> + Send;

    fn list_transfers(&self, room: &str)
        -> impl Future<Output = Result<Vec<TransferRecord>>> + Send;

    /// Append a transfer record without moving chips.
    fn insert_transfer(
        &self,
        room: &str,
        request: &TransferRequest,
    ) -> impl Future<Output = Result<TransferRecord>> + Send;

    /// Validate and apply a transfer in one indivisible step.
    fn transfer(
        &self,
        room: &str,
        request: &TransferRequest,
    ) -> impl Future<Output = Result<TransferReceipt>> + Send;

    fn subscribe(&self, filter: &ChangeFilter) -> impl Future<Output = Result<Self::Feed>> + Send;
}

impl Gateway for Client {
    type Feed = crate::Stream<ChangeEvent>;

    async fn insert_room(&self, code: &str) -> Result<(Room, bool)> {
        self.insert_room(code).await
    }

    async fn get_room(&self, code: &str) -> Result<Option<Room>> {
        self.get_room(code).await
    }

    async fn upsert_player(&self, player: &Participant) -> Result<Participant> {
        self.upsert_player(player).await
    }

    async fn rename_player(&self, id: ParticipantId, name: &str) -> Result<Affected> {
        self.rename_player(id, name).await
    }

    async fn list_memberships(
        &self,
        room: &str,
        participant: Option<ParticipantId>,
    ) -> Result<Vec<MembershipView>> {
        self.list_memberships(room, participant).await
    }

    async fn upsert_membership(&self, room: &str, upsert: &MembershipUpsert) -> Result<Membership> {
        self.upsert_membership(room, upsert).await
    }

    async fn update_chips(
        &self,
        room: &str,
        participant: ParticipantId,
        chips: i64,
    ) -> Result<Affected> {
        self.update_chips(room, participant, chips).await
    }

    async fn delete_membership(&self, room: &str, participant: ParticipantId) -> Result<Affected> {
        self.delete_membership(room, participant).await
    }

    async fn list_transfers(&self, room: &str) -> Result<Vec<TransferRecord>> {
        self.list_transfers(room).await
    }

    async fn insert_transfer(
        &self,
        room: &str,
        request: &TransferRequest,
    ) -> Result<TransferRecord> {
        self.insert_transfer(room, request).await
    }

    async fn transfer(&self, room: &str, request: &TransferRequest) -> Result<TransferReceipt> {
        self.transfer(room, request).await
    }

    async fn subscribe(&self, filter: &ChangeFilter) -> Result<Self::Feed> {
        self.connect_changes(filter).await
    }
}
