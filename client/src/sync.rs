//! Live view of the active room.
//!
//! Two live queries are kept per room: all memberships and all transfer
//! records. Each is backed by a change feed subscription filtered on the room
//! id; any notification re-runs the full read and replaces the collection
//! wholesale. Results are tagged with the view's generation, which changes on
//! every attach and detach, so reads that finish after the room changed are
//! dropped.

use crate::{Error, Gateway, Result};
use chipledger_types::{
    api::{ChangeEvent, ChangeFilter, ChangeKind, Table},
    ledger::{MembershipView, ParticipantId, TransferRecord},
};
use futures::StreamExt;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay between reconnection attempts when a change feed fails
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Tables kept live for the active room
const LIVE_TABLES: [Table; 2] = [Table::RoomPlayers, Table::Transactions];

/// Snapshot of the active room.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomView {
    pub room_id: Option<String>,
    /// Oldest membership first
    pub members: Vec<MembershipView>,
    pub transfers: Vec<TransferRecord>,
    pub generation: u64,
}

impl RoomView {
    pub fn member(&self, participant: ParticipantId) -> Option<&MembershipView> {
        self.members
            .iter()
            .find(|m| m.participant_id() == participant)
    }

    /// Resolve a member by participant id or, failing that, by display name
    /// (case-insensitive).
    pub fn find(&self, query: &str) -> Option<&MembershipView> {
        if let Ok(id) = Uuid::parse_str(query) {
            return self.member(id);
        }
        self.members
            .iter()
            .find(|m| m.display_name().eq_ignore_ascii_case(query))
    }

    pub fn total_chips(&self) -> i64 {
        self.members.iter().map(|m| m.chips()).sum()
    }
}

/// Handle to a change feed subscription. Dropping it cancels the
/// subscription.
pub struct Subscription {
    filter: ChangeFilter,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Release the subscription.
    pub fn unsubscribe(self) {
        debug!(table = %self.filter.table, room = %self.filter.room_id, "unsubscribing");
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Subscribe to changes matching `filter`, calling `on_change` for each one.
///
/// Callbacks run one at a time in delivery order. If the feed fails it is
/// re-established and `on_change` is called once more with a synthetic update
/// so the subscriber can resynchronize.
pub async fn subscribe<G, F, Fut>(
    gateway: &G,
    filter: ChangeFilter,
    mut on_change: F,
) -> Result<Subscription>
where
    G: Gateway,
    F: FnMut(ChangeEvent) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut feed = gateway.subscribe(&filter).await?;
    let gateway = gateway.clone();
    let task_filter = filter.clone();
    let handle = tokio::spawn(async move {
        loop {
            while let Some(event) = feed.next().await {
                match event {
                    Ok(event) if task_filter.matches(&event) => on_change(event).await,
                    Ok(event) => debug!(?event, "ignoring change outside filter"),
                    Err(Error::InvalidData(e)) => warn!(error = %e, "skipping malformed change"),
                    Err(e) => {
                        warn!(error = %e, table = %task_filter.table, "change feed failed");
                        break;
                    }
                }
            }

            // Feed ended: reconnect, then resynchronize
            loop {
                sleep(RECONNECT_DELAY).await;
                match gateway.subscribe(&task_filter).await {
                    Ok(next) => {
                        info!(table = %task_filter.table, room = %task_filter.room_id, "change feed reconnected");
                        feed = next;
                        break;
                    }
                    Err(e) => warn!(error = %e, "failed to reconnect change feed"),
                }
            }
            on_change(ChangeEvent {
                table: task_filter.table,
                kind: ChangeKind::Update,
                room_id: task_filter.room_id.clone(),
            })
            .await;
        }
    });
    Ok(Subscription { filter, handle })
}

/// Apply `update` to the view unless it has moved on to another generation.
fn apply(
    view: &watch::Sender<RoomView>,
    generation: u64,
    update: impl FnOnce(&mut RoomView),
) -> bool {
    view.send_if_modified(|current| {
        if current.generation != generation {
            debug!(
                stale = generation,
                current = current.generation,
                "dropping stale read"
            );
            return false;
        }
        update(current);
        true
    })
}

/// Re-read one live table of `room` and store it in the view.
async fn reload<G: Gateway>(
    gateway: &G,
    view: &watch::Sender<RoomView>,
    room: &str,
    table: Table,
    generation: u64,
) -> Result<()> {
    match table {
        Table::RoomPlayers => {
            let members = gateway.list_memberships(room, None).await?;
            apply(view, generation, |v| v.members = members);
        }
        Table::Transactions => {
            let transfers = gateway.list_transfers(room).await?;
            apply(view, generation, |v| v.transfers = transfers);
        }
        Table::Rooms | Table::Players => {}
    }
    Ok(())
}

/// Live view synchronizer for one client.
pub struct LiveView<G: Gateway> {
    gateway: G,
    view: Arc<watch::Sender<RoomView>>,
    subscriptions: Vec<Subscription>,
}

impl<G: Gateway> LiveView<G> {
    pub fn new(gateway: G) -> Self {
        let (view, _) = watch::channel(RoomView::default());
        Self {
            gateway,
            view: Arc::new(view),
            subscriptions: Vec::new(),
        }
    }

    /// Current snapshot.
    pub fn view(&self) -> RoomView {
        self.view.borrow().clone()
    }

    /// Receiver notified whenever the snapshot changes.
    pub fn watch(&self) -> watch::Receiver<RoomView> {
        self.view.subscribe()
    }

    pub fn room(&self) -> Option<String> {
        self.view.borrow().room_id.clone()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Subscribe to `filter` for as long as the returned handle lives.
    pub async fn subscribe<F, Fut>(&self, filter: ChangeFilter, on_change: F) -> Result<Subscription>
    where
        F: FnMut(ChangeEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        subscribe(&self.gateway, filter, on_change).await
    }

    /// Point the view at `room`: cancel the old subscriptions, subscribe to
    /// the room's live tables and read both collections.
    ///
    /// Subscriptions are established before the first read so that no change
    /// committed in between is missed.
    pub async fn attach(&mut self, room: &str) -> Result<()> {
        self.subscriptions.clear();
        let mut generation = 0;
        self.view.send_modify(|v| {
            v.generation += 1;
            v.room_id = Some(room.to_string());
            v.members.clear();
            v.transfers.clear();
            generation = v.generation;
        });

        if let Err(e) = self.establish(room, generation).await {
            self.detach();
            return Err(e);
        }
        info!(room, generation, "live view attached");
        Ok(())
    }

    async fn establish(&mut self, room: &str, generation: u64) -> Result<()> {
        for table in LIVE_TABLES {
            let gateway = self.gateway.clone();
            let view = self.view.clone();
            let room_id = room.to_string();
            let on_change = move |event: ChangeEvent| {
                let gateway = gateway.clone();
                let view = view.clone();
                let room_id = room_id.clone();
                async move {
                    debug!(?event, "change received");
                    if let Err(e) = reload(&gateway, &view, &room_id, table, generation).await {
                        warn!(error = %e, %table, room = %room_id, "failed to reload after change");
                    }
                }
            };
            let subscription = self
                .subscribe(ChangeFilter::new(table, room), on_change)
                .await?;
            self.subscriptions.push(subscription);
        }
        self.refresh().await
    }

    /// Re-read both collections of the active room now.
    pub async fn refresh(&self) -> Result<()> {
        let (room, generation) = {
            let view = self.view.borrow();
            (view.room_id.clone(), view.generation)
        };
        let Some(room) = room else {
            return Ok(());
        };
        let (members, transfers) = tokio::try_join!(
            self.gateway.list_memberships(&room, None),
            self.gateway.list_transfers(&room)
        )?;
        apply(&self.view, generation, |v| {
            v.members = members;
            v.transfers = transfers;
        });
        Ok(())
    }

    /// Cancel all subscriptions and clear the view.
    pub fn detach(&mut self) {
        let cancelled = self.subscriptions.len();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.view.send_modify(|v| {
            v.generation += 1;
            v.room_id = None;
            v.members.clear();
            v.transfers.clear();
        });
        debug!(cancelled, "live view detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::LocalGateway;
    use chipledger_types::{
        api::{MembershipUpsert, OnConflict},
        ledger::{Participant, STARTING_CHIPS},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    fn seat(gateway: &LocalGateway, room: &str, name: &str) -> ParticipantId {
        let id = Uuid::new_v4();
        let simulator = gateway.simulator();
        simulator.upsert_player(Participant::new(id, name)).unwrap();
        simulator
            .upsert_membership(
                room,
                MembershipUpsert {
                    participant_id: id,
                    chips: STARTING_CHIPS,
                    on_conflict: OnConflict::Ignore,
                },
            )
            .unwrap();
        id
    }

    async fn settle(gateway: &LocalGateway, subscribers: usize) {
        timeout(Duration::from_secs(5), async {
            while gateway.simulator().change_subscribers() != subscribers {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_attach_reads_and_follows_changes() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        let alice = seat(&gateway, "ab12cd", "Alice");

        let mut live = LiveView::new(gateway.clone());
        live.attach("ab12cd").await.unwrap();
        let view = live.view();
        assert_eq!(view.room_id.as_deref(), Some("ab12cd"));
        assert_eq!(view.members.len(), 1);
        assert_eq!(view.member(alice).unwrap().display_name(), "Alice");
        assert_eq!(live.subscriptions().len(), 2);

        // Another participant joins and transfers
        let bob = seat(&gateway, "ab12cd", "Bob");
        gateway
            .simulator()
            .transfer(
                "ab12cd",
                chipledger_types::api::TransferRequest {
                    from_player: bob,
                    to_player: alice,
                    amount: 50,
                },
            )
            .unwrap();

        let mut watch = live.watch();
        let settled = |v: &RoomView| {
            v.transfers.len() == 1 && v.member(bob).map(|m| m.chips()) == Some(950)
        };
        timeout(Duration::from_secs(5), watch.wait_for(settled))
            .await
            .unwrap()
            .unwrap();
        let view = live.view();
        assert_eq!(view.member(alice).unwrap().chips(), 1050);
        assert_eq!(view.total_chips(), 2 * STARTING_CHIPS);
        assert_eq!(view.find("bob").unwrap().participant_id(), bob);
        assert_eq!(view.find(&alice.to_string()).unwrap().display_name(), "Alice");
    }

    #[tokio::test]
    async fn test_room_change_tears_down_subscriptions() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        gateway.simulator().insert_room("other1").unwrap();

        let mut live = LiveView::new(gateway.clone());
        live.attach("ab12cd").await.unwrap();
        settle(&gateway, 2).await;

        // Re-attaching replaces rather than adds subscriptions
        live.attach("other1").await.unwrap();
        settle(&gateway, 2).await;
        assert!(live.subscriptions().iter().all(|s| s.filter().room_id == "other1"));

        // Changes in the old room no longer reach the view
        seat(&gateway, "ab12cd", "Alice");
        live.refresh().await.unwrap();
        assert!(live.view().members.is_empty());

        live.detach();
        settle(&gateway, 0).await;
        let view = live.view();
        assert_eq!(view.room_id, None);
        assert!(view.members.is_empty() && view.transfers.is_empty());
        assert!(live.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_stale_reads_are_dropped() {
        let (view, _) = watch::channel(RoomView::default());
        view.send_modify(|v| {
            v.generation = 3;
            v.room_id = Some("other1".to_string());
        });

        // A read started for generation 2 finishes late
        assert!(!apply(&view, 2, |v| v.transfers.clear()));
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        seat(&gateway, "ab12cd", "Alice");
        reload(&gateway, &view, "ab12cd", Table::RoomPlayers, 2)
            .await
            .unwrap();
        assert!(view.borrow().members.is_empty());

        // The current generation is applied
        reload(&gateway, &view, "ab12cd", Table::RoomPlayers, 3)
            .await
            .unwrap();
        assert_eq!(view.borrow().members.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_callback_and_unsubscribe() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let subscription = subscribe(
            &gateway,
            ChangeFilter::new(Table::RoomPlayers, "ab12cd"),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .await
        .unwrap();
        assert!(subscription.is_active());

        seat(&gateway, "ab12cd", "Alice");
        timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        subscription.unsubscribe();
        settle(&gateway, 0).await;
        let seen = calls.load(Ordering::SeqCst);
        seat(&gateway, "ab12cd", "Bob");
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_only_its_feed() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();

        let players = subscribe(
            &gateway,
            ChangeFilter::new(Table::RoomPlayers, "ab12cd"),
            |_| async {},
        )
        .await
        .unwrap();
        let transfers = subscribe(
            &gateway,
            ChangeFilter::new(Table::Transactions, "ab12cd"),
            |_| async {},
        )
        .await
        .unwrap();
        settle(&gateway, 2).await;

        players.unsubscribe();
        settle(&gateway, 1).await;
        assert!(transfers.is_active());
        assert_eq!(transfers.filter().table, Table::Transactions);
    }
}
