use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State as AxumState},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use chipledger_types::{
    api::{
        Affected, ChangeEvent, ChangeFilter, ChangeKind, ChipsUpdate, ErrorBody, MembersQuery,
        MembershipUpsert, NewRoom, OnConflict, PlayerRename, Table, TransferRequest,
        CHANGE_BUFFER,
    },
    ledger::{
        normalize_room_code, validate_name, validate_transfer, Membership, MembershipView,
        Participant, ParticipantId, Room, TransferReceipt, TransferRecord, ValidationError,
    },
};
use futures::{SinkExt, StreamExt};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// Errors raised by gateway operations. Each maps to one HTTP status.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("participant not found: {0}")]
    ParticipantNotFound(ParticipantId),
    #[error("participant {participant} is not a member of room {room}")]
    NotMember {
        room: String,
        participant: ParticipantId,
    },
    #[error("insufficient chips: balance {balance}, requested {amount}")]
    InsufficientChips { balance: i64, amount: i64 },
    #[error("invalid request: {0}")]
    Invalid(#[from] ValidationError),
    #[error("state lock poisoned")]
    Poisoned,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::RoomNotFound(_) | Error::ParticipantNotFound(_) | Error::NotMember { .. } => {
                StatusCode::NOT_FOUND
            }
            Error::InsufficientChips { .. } => StatusCode::CONFLICT,
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::Poisoned => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Default)]
pub struct State {
    rooms: BTreeMap<String, Room>,
    players: HashMap<ParticipantId, Participant>,
    memberships: BTreeMap<(String, ParticipantId), Membership>,
    transfers: Vec<TransferRecord>,
}

impl State {
    fn require_room(&self, room: &str) -> Result<()> {
        if !self.rooms.contains_key(room) {
            return Err(Error::RoomNotFound(room.to_string()));
        }
        Ok(())
    }

    fn view(&self, membership: &Membership) -> MembershipView {
        MembershipView {
            membership: membership.clone(),
            name: self
                .players
                .get(&membership.participant_id)
                .map(|p| p.name.clone()),
        }
    }
}

/// In-memory relational backend with a change feed.
///
/// Rows live in four keyed tables (`rooms`, `players`, `room_players`,
/// `transactions`). Every successful mutation is announced on a broadcast
/// channel as a [ChangeEvent] after the write lock is released.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<RwLock<State>>,
    change_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_BUFFER);
        let state = Arc::new(RwLock::new(State::default()));

        Self { state, change_tx }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|e| {
            tracing::error!("Failed to acquire read lock: {}", e);
            Error::Poisoned
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|e| {
            tracing::error!("Failed to acquire write lock: {}", e);
            Error::Poisoned
        })
    }

    fn publish(&self, table: Table, kind: ChangeKind, room_id: &str) {
        let event = ChangeEvent {
            table,
            kind,
            room_id: room_id.to_string(),
        };
        if let Err(e) = self.change_tx.send(event) {
            tracing::trace!("No change subscribers: {}", e);
        }
    }

    /// Insert a room. Returns the stored room and whether it was created;
    /// an existing room with the same code is returned unchanged.
    pub fn insert_room(&self, code: &str) -> Result<(Room, bool)> {
        let code = normalize_room_code(code)?;
        let mut state = self.write()?;
        if let Some(existing) = state.rooms.get(&code) {
            return Ok((existing.clone(), false));
        }
        let room = Room {
            id: code.clone(),
            created_at: now_millis(),
        };
        state.rooms.insert(code.clone(), room.clone());
        drop(state); // Release lock before broadcasting
        tracing::info!(room = %code, "room created");
        self.publish(Table::Rooms, ChangeKind::Insert, &code);
        Ok((room, true))
    }

    pub fn get_room(&self, code: &str) -> Result<Option<Room>> {
        Ok(self.read()?.rooms.get(code).cloned())
    }

    pub fn upsert_player(&self, player: Participant) -> Result<Participant> {
        let name = validate_name(&player.name)?;
        let player = Participant::new(player.id, name);
        let rooms = {
            let mut state = self.write()?;
            state.players.insert(player.id, player.clone());
            Self::rooms_of(&state, player.id)
        };
        // The joined name of every membership changed
        for room in rooms {
            self.publish(Table::RoomPlayers, ChangeKind::Update, &room);
        }
        Ok(player)
    }

    /// Update a participant's name. Touches zero rows when the participant
    /// has never been upserted.
    pub fn rename_player(&self, id: ParticipantId, name: &str) -> Result<Affected> {
        let name = validate_name(name)?;
        let rooms = {
            let mut state = self.write()?;
            let Some(player) = state.players.get_mut(&id) else {
                return Ok(Affected { rows: 0 });
            };
            player.name = name;
            Self::rooms_of(&state, id)
        };
        for room in rooms {
            self.publish(Table::RoomPlayers, ChangeKind::Update, &room);
        }
        Ok(Affected { rows: 1 })
    }

    fn rooms_of(state: &State, id: ParticipantId) -> Vec<String> {
        state
            .memberships
            .values()
            .filter(|m| m.participant_id == id)
            .map(|m| m.room_id.clone())
            .collect()
    }

    /// Memberships of `room`, oldest first, joined with display names.
    pub fn list_memberships(
        &self,
        room: &str,
        participant: Option<ParticipantId>,
    ) -> Result<Vec<MembershipView>> {
        let state = self.read()?;
        let mut members: Vec<_> = state
            .memberships
            .values()
            .filter(|m| m.room_id == room)
            .filter(|m| participant.map_or(true, |p| m.participant_id == p))
            .map(|m| state.view(m))
            .collect();
        members.sort_by(|a, b| {
            (a.membership.joined_at, a.membership.id).cmp(&(b.membership.joined_at, b.membership.id))
        });
        Ok(members)
    }

    pub fn upsert_membership(&self, room: &str, upsert: MembershipUpsert) -> Result<Membership> {
        let mut state = self.write()?;
        state.require_room(room)?;
        if !state.players.contains_key(&upsert.participant_id) {
            return Err(Error::ParticipantNotFound(upsert.participant_id));
        }
        let key = (room.to_string(), upsert.participant_id);
        let (membership, kind) = match state.memberships.get(&key).cloned() {
            Some(existing) if upsert.on_conflict == OnConflict::Ignore => return Ok(existing),
            Some(mut existing) => {
                existing.chips = upsert.chips;
                (existing, ChangeKind::Update)
            }
            None => {
                let membership = Membership {
                    id: Uuid::new_v4(),
                    participant_id: upsert.participant_id,
                    room_id: room.to_string(),
                    chips: upsert.chips,
                    joined_at: now_millis(),
                };
                (membership, ChangeKind::Insert)
            }
        };
        state.memberships.insert(key, membership.clone());
        drop(state);
        self.publish(Table::RoomPlayers, kind, room);
        Ok(membership)
    }

    /// Blind write of a membership's balance.
    pub fn update_chips(
        &self,
        room: &str,
        participant: ParticipantId,
        chips: i64,
    ) -> Result<Affected> {
        let mut state = self.write()?;
        let Some(membership) = state.memberships.get_mut(&(room.to_string(), participant)) else {
            return Ok(Affected { rows: 0 });
        };
        membership.chips = chips;
        drop(state);
        self.publish(Table::RoomPlayers, ChangeKind::Update, room);
        Ok(Affected { rows: 1 })
    }

    pub fn delete_membership(&self, room: &str, participant: ParticipantId) -> Result<Affected> {
        let removed = self
            .write()?
            .memberships
            .remove(&(room.to_string(), participant));
        if removed.is_none() {
            return Ok(Affected { rows: 0 });
        }
        tracing::info!(room, %participant, "membership deleted");
        self.publish(Table::RoomPlayers, ChangeKind::Delete, room);
        Ok(Affected { rows: 1 })
    }

    pub fn list_transfers(&self, room: &str) -> Result<Vec<TransferRecord>> {
        let state = self.read()?;
        Ok(state
            .transfers
            .iter()
            .filter(|t| t.room_id == room)
            .cloned()
            .collect())
    }

    /// Append a transfer record without touching balances.
    pub fn insert_transfer(&self, room: &str, request: TransferRequest) -> Result<TransferRecord> {
        validate_transfer(request.from_player, request.to_player, request.amount)?;
        let mut state = self.write()?;
        state.require_room(room)?;
        let record = Self::record(room, &request);
        state.transfers.push(record.clone());
        drop(state);
        self.publish(Table::Transactions, ChangeKind::Insert, room);
        Ok(record)
    }

    /// Atomic transfer procedure: validates membership and balance, appends
    /// the record and applies both balance changes under one write lock.
    /// The debit only happens while `chips >= amount`.
    pub fn transfer(&self, room: &str, request: TransferRequest) -> Result<TransferReceipt> {
        validate_transfer(request.from_player, request.to_player, request.amount)?;
        let mut state = self.write()?;
        state.require_room(room)?;
        let sender_key = (room.to_string(), request.from_player);
        let receiver_key = (room.to_string(), request.to_player);
        let balance = |key: &(String, ParticipantId)| {
            state
                .memberships
                .get(key)
                .map(|m| m.chips)
                .ok_or_else(|| Error::NotMember {
                    room: room.to_string(),
                    participant: key.1,
                })
        };
        let sender_balance = balance(&sender_key)?;
        let receiver_balance = balance(&receiver_key)?;
        if sender_balance < request.amount {
            return Err(Error::InsufficientChips {
                balance: sender_balance,
                amount: request.amount,
            });
        }

        let sender_chips = sender_balance - request.amount;
        let receiver_chips = receiver_balance.saturating_add(request.amount);
        for (key, chips) in [(&sender_key, sender_chips), (&receiver_key, receiver_chips)] {
            if let Some(membership) = state.memberships.get_mut(key) {
                membership.chips = chips;
            }
        }
        let record = Self::record(room, &request);
        state.transfers.push(record.clone());
        drop(state);

        tracing::info!(
            room,
            from = %request.from_player,
            to = %request.to_player,
            amount = request.amount,
            "transfer applied"
        );
        self.publish(Table::Transactions, ChangeKind::Insert, room);
        self.publish(Table::RoomPlayers, ChangeKind::Update, room);
        self.publish(Table::RoomPlayers, ChangeKind::Update, room);
        Ok(TransferReceipt {
            record,
            sender_chips,
            receiver_chips,
        })
    }

    fn record(room: &str, request: &TransferRequest) -> TransferRecord {
        TransferRecord {
            id: Uuid::new_v4(),
            room_id: room.to_string(),
            from_player: request.from_player,
            to_player: request.to_player,
            amount: request.amount,
            timestamp: now_millis(),
        }
    }

    pub fn change_subscriber(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }

    /// Number of live change feed receivers.
    pub fn change_subscribers(&self) -> usize {
        self.change_tx.receiver_count()
    }
}

pub struct Api {
    simulator: Arc<Simulator>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    pub fn router(&self) -> Router {
        // Configure CORS
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE]);

        let mut router = Router::new()
            .route("/rooms", post(create_room))
            .route("/rooms/:room", get(get_room))
            .route("/players", put(upsert_player))
            .route("/players/:id", patch(rename_player))
            .route("/rooms/:room/members", get(list_members).put(upsert_member))
            .route(
                "/rooms/:room/members/:participant",
                patch(update_chips).delete(delete_member),
            )
            .route(
                "/rooms/:room/transfers",
                get(list_transfers).post(insert_transfer),
            )
            .route("/rooms/:room/transfer", post(transfer))
            .route("/changes/:table/:room", get(changes_ws))
            .layer(cors);

        // Configure Rate Limiting
        // Effectively unlimited for local play (~1B req/s with a large burst)
        match GovernorConfigBuilder::default()
            .per_nanosecond(1)
            .burst_size(2_000_000)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
        {
            Some(config) => {
                router = router.layer(GovernorLayer {
                    config: Arc::new(config),
                });
            }
            None => tracing::warn!("Invalid rate limit configuration, serving without limits"),
        }

        router.with_state(self.simulator.clone())
    }
}

async fn create_room(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(body): Json<NewRoom>,
) -> Result<impl IntoResponse> {
    let (room, created) = simulator.insert_room(&body.id)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(room)))
}

async fn get_room(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(room): Path<String>,
) -> Result<Json<Room>> {
    simulator
        .get_room(&room)?
        .map(Json)
        .ok_or(Error::RoomNotFound(room))
}

async fn upsert_player(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(player): Json<Participant>,
) -> Result<Json<Participant>> {
    Ok(Json(simulator.upsert_player(player)?))
}

async fn rename_player(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(id): Path<ParticipantId>,
    Json(body): Json<PlayerRename>,
) -> Result<Json<Affected>> {
    Ok(Json(simulator.rename_player(id, &body.name)?))
}

async fn list_members(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(room): Path<String>,
    Query(query): Query<MembersQuery>,
) -> Result<Json<Vec<MembershipView>>> {
    Ok(Json(simulator.list_memberships(&room, query.participant)?))
}

async fn upsert_member(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(room): Path<String>,
    Json(body): Json<MembershipUpsert>,
) -> Result<Json<Membership>> {
    Ok(Json(simulator.upsert_membership(&room, body)?))
}

async fn update_chips(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path((room, participant)): Path<(String, ParticipantId)>,
    Json(body): Json<ChipsUpdate>,
) -> Result<Json<Affected>> {
    Ok(Json(simulator.update_chips(&room, participant, body.chips)?))
}

async fn delete_member(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path((room, participant)): Path<(String, ParticipantId)>,
) -> Result<Json<Affected>> {
    Ok(Json(simulator.delete_membership(&room, participant)?))
}

async fn list_transfers(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(room): Path<String>,
) -> Result<Json<Vec<TransferRecord>>> {
    Ok(Json(simulator.list_transfers(&room)?))
}

async fn insert_transfer(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(room): Path<String>,
    Json(body): Json<TransferRequest>,
) -> Result<impl IntoResponse> {
    let record = simulator.insert_transfer(&room, body)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn transfer(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(room): Path<String>,
    Json(body): Json<TransferRequest>,
) -> Result<Json<TransferReceipt>> {
    Ok(Json(simulator.transfer(&room, body)?))
}

async fn changes_ws(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path((table, room)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let table = match table.parse::<Table>() {
        Ok(table) => table,
        Err(e) => {
            tracing::warn!("Rejecting change subscription: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let filter = ChangeFilter::new(table, room);

    // Subscribe before the upgrade completes so that no change committed after
    // the handshake is missed.
    let changes = simulator.change_subscriber();
    ws.on_upgrade(move |socket| handle_changes_ws(socket, changes, filter))
}

async fn handle_changes_ws(
    socket: axum::extract::ws::WebSocket,
    mut changes: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
) {
    tracing::info!(table = %filter.table, room = %filter.room_id, "Change WebSocket connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // Handle incoming WebSocket messages (ping/pong/close)
            msg = receiver.next() => {
                match msg {
                    Some(Ok(axum::extract::ws::Message::Close(_))) => {
                        tracing::info!("Client closed WebSocket connection");
                        break;
                    }
                    Some(Ok(axum::extract::ws::Message::Ping(data))) => {
                        if sender.send(axum::extract::ws::Message::Pong(data)).await.is_err() {
                            tracing::warn!("Failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {:?}", e);
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                    _ => {} // Ignore other message types
                }
            }
            // Handle broadcast changes
            change = changes.recv() => {
                match change {
                    Ok(event) => {
                        if !filter.matches(&event) {
                            continue;
                        }
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!("Failed to encode change event: {}", e);
                                continue;
                            }
                        };
                        tracing::debug!(?event, "Sending change to WebSocket client");
                        if sender
                            .send(axum::extract::ws::Message::Text(text))
                            .await
                            .is_err()
                        {
                            tracing::warn!("Failed to send change, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "WebSocket client lagged behind, skipped {} changes",
                            skipped
                        );
                        // Subscribers re-read whole collections, so one
                        // synthetic event is enough to resynchronize them.
                        let event = ChangeEvent {
                            table: filter.table,
                            kind: ChangeKind::Update,
                            room_id: filter.room_id.clone(),
                        };
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender
                            .send(axum::extract::ws::Message::Text(text))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Broadcast channel closed");
                        break;
                    }
                }
            }
        }
    }
    tracing::info!("Change WebSocket handler exiting");
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use futures::executor::block_on;
    use tower::ServiceExt;

    fn join(simulator: &Simulator, room: &str, name: &str) -> ParticipantId {
        let id = Uuid::new_v4();
        simulator
            .upsert_player(Participant::new(id, name))
            .unwrap();
        simulator
            .upsert_membership(
                room,
                MembershipUpsert {
                    participant_id: id,
                    chips: 1000,
                    on_conflict: OnConflict::Ignore,
                },
            )
            .unwrap();
        id
    }

    fn chips(simulator: &Simulator, room: &str, id: ParticipantId) -> i64 {
        simulator.list_memberships(room, Some(id)).unwrap()[0].chips()
    }

    #[test]
    fn test_insert_room_reuses_existing_code() {
        let simulator = Simulator::new();
        let mut changes = simulator.change_subscriber();

        let (room, created) = simulator.insert_room("ab12cd").unwrap();
        assert!(created);
        let received = block_on(async { changes.recv().await.unwrap() });
        assert_eq!(received.table, Table::Rooms);
        assert_eq!(received.kind, ChangeKind::Insert);

        let (again, created) = simulator.insert_room("ab12cd").unwrap();
        assert!(!created);
        assert_eq!(again, room);
        assert!(changes.try_recv().is_err());

        assert!(simulator.get_room("ab12cd").unwrap().is_some());
        assert!(simulator.get_room("zz99zz").unwrap().is_none());
        assert!(matches!(
            simulator.insert_room("no spaces"),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_upsert_membership_ignore_preserves_balance() {
        let simulator = Simulator::new();
        simulator.insert_room("ab12cd").unwrap();
        let alice = join(&simulator, "ab12cd", "Alice");
        simulator.update_chips("ab12cd", alice, 640).unwrap();

        let rejoined = simulator
            .upsert_membership(
                "ab12cd",
                MembershipUpsert {
                    participant_id: alice,
                    chips: 1000,
                    on_conflict: OnConflict::Ignore,
                },
            )
            .unwrap();
        assert_eq!(rejoined.chips, 640);
        assert_eq!(simulator.list_memberships("ab12cd", None).unwrap().len(), 1);

        let merged = simulator
            .upsert_membership(
                "ab12cd",
                MembershipUpsert {
                    participant_id: alice,
                    chips: 1000,
                    on_conflict: OnConflict::Merge,
                },
            )
            .unwrap();
        assert_eq!(merged.chips, 1000);
        assert_eq!(merged.id, rejoined.id);
    }

    #[test]
    fn test_upsert_membership_requires_room_and_player() {
        let simulator = Simulator::new();
        let upsert = MembershipUpsert {
            participant_id: Uuid::new_v4(),
            chips: 1000,
            on_conflict: OnConflict::Ignore,
        };
        assert_eq!(
            simulator.upsert_membership("ab12cd", upsert.clone()),
            Err(Error::RoomNotFound("ab12cd".to_string()))
        );
        simulator.insert_room("ab12cd").unwrap();
        assert_eq!(
            simulator.upsert_membership("ab12cd", upsert.clone()),
            Err(Error::ParticipantNotFound(upsert.participant_id))
        );
    }

    #[test]
    fn test_rename_is_visible_in_memberships() {
        let simulator = Simulator::new();
        simulator.insert_room("ab12cd").unwrap();
        let alice = join(&simulator, "ab12cd", "Alice");
        let mut changes = simulator.change_subscriber();

        assert_eq!(
            simulator.rename_player(alice, "Alicia").unwrap(),
            Affected { rows: 1 }
        );
        let members = simulator.list_memberships("ab12cd", None).unwrap();
        assert_eq!(members[0].display_name(), "Alicia");

        // Members of the room are told their joined view changed
        let received = block_on(async { changes.recv().await.unwrap() });
        assert_eq!(received.table, Table::RoomPlayers);
        assert_eq!(received.room_id, "ab12cd");

        assert_eq!(
            simulator.rename_player(Uuid::new_v4(), "Nobody").unwrap(),
            Affected { rows: 0 }
        );
    }

    #[test]
    fn test_delete_membership_only_touches_caller() {
        let simulator = Simulator::new();
        simulator.insert_room("ab12cd").unwrap();
        simulator.insert_room("other1").unwrap();
        let alice = join(&simulator, "ab12cd", "Alice");
        let bob = join(&simulator, "ab12cd", "Bob");
        simulator
            .upsert_membership(
                "other1",
                MembershipUpsert {
                    participant_id: alice,
                    chips: 1000,
                    on_conflict: OnConflict::Ignore,
                },
            )
            .unwrap();

        assert_eq!(
            simulator.delete_membership("ab12cd", alice).unwrap(),
            Affected { rows: 1 }
        );
        let remaining = simulator.list_memberships("ab12cd", None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].participant_id(), bob);
        assert_eq!(simulator.list_memberships("other1", None).unwrap().len(), 1);
        assert!(simulator.get_room("ab12cd").unwrap().is_some());

        assert_eq!(
            simulator.delete_membership("ab12cd", alice).unwrap(),
            Affected { rows: 0 }
        );
    }

    #[test]
    fn test_atomic_transfer() {
        let simulator = Simulator::new();
        simulator.insert_room("ab12cd").unwrap();
        let alice = join(&simulator, "ab12cd", "Alice");
        let bob = join(&simulator, "ab12cd", "Bob");

        let receipt = simulator
            .transfer(
                "ab12cd",
                TransferRequest {
                    from_player: alice,
                    to_player: bob,
                    amount: 100,
                },
            )
            .unwrap();
        assert_eq!(receipt.sender_chips, 900);
        assert_eq!(receipt.receiver_chips, 1100);
        assert_eq!(chips(&simulator, "ab12cd", alice), 900);
        assert_eq!(chips(&simulator, "ab12cd", bob), 1100);

        // Conditional debit rejects overdraft and writes nothing
        let err = simulator
            .transfer(
                "ab12cd",
                TransferRequest {
                    from_player: alice,
                    to_player: bob,
                    amount: 901,
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::InsufficientChips {
                balance: 900,
                amount: 901
            }
        );
        assert_eq!(simulator.list_transfers("ab12cd").unwrap().len(), 1);
        assert_eq!(chips(&simulator, "ab12cd", alice), 900);

        // Receiver must be a member
        let stranger = Uuid::new_v4();
        assert!(matches!(
            simulator.transfer(
                "ab12cd",
                TransferRequest {
                    from_player: alice,
                    to_player: stranger,
                    amount: 10,
                },
            ),
            Err(Error::NotMember { .. })
        ));
    }

    #[test]
    fn test_insert_transfer_does_not_move_chips() {
        let simulator = Simulator::new();
        simulator.insert_room("ab12cd").unwrap();
        let alice = join(&simulator, "ab12cd", "Alice");
        let bob = join(&simulator, "ab12cd", "Bob");

        let record = simulator
            .insert_transfer(
                "ab12cd",
                TransferRequest {
                    from_player: alice,
                    to_player: bob,
                    amount: 50,
                },
            )
            .unwrap();
        assert_eq!(record.amount, 50);
        assert_eq!(chips(&simulator, "ab12cd", alice), 1000);
        assert_eq!(simulator.list_transfers("ab12cd").unwrap(), vec![record]);
        assert!(simulator.list_transfers("other1").unwrap().is_empty());

        assert!(matches!(
            simulator.insert_transfer(
                "ab12cd",
                TransferRequest {
                    from_player: alice,
                    to_player: bob,
                    amount: 0,
                },
            ),
            Err(Error::Invalid(ValidationError::NonPositiveAmount(0)))
        ));
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "127.0.0.1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_router_status_codes() {
        let simulator = Arc::new(Simulator::new());
        let router = Api::new(simulator.clone()).router();

        let (status, body) = call(
            router.clone(),
            json_request(Method::POST, "/rooms", serde_json::json!({ "id": "ab12cd" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "ab12cd");

        let (status, _) = call(
            router.clone(),
            json_request(Method::POST, "/rooms", serde_json::json!({ "id": "ab12cd" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            router.clone(),
            json_request(Method::GET, "/rooms/zz99zz", serde_json::Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "room not found: zz99zz");

        let alice = join(&simulator, "ab12cd", "Alice");
        let bob = join(&simulator, "ab12cd", "Bob");
        let (status, body) = call(
            router.clone(),
            json_request(
                Method::POST,
                "/rooms/ab12cd/transfer",
                serde_json::json!({ "from_player": alice, "to_player": bob, "amount": 5000 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["message"].as_str().unwrap().contains("insufficient"));

        let (status, body) = call(
            router,
            json_request(
                Method::GET,
                &format!("/rooms/ab12cd/members?participant={bob}"),
                serde_json::Value::Null,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["name"], "Bob");
    }
}
