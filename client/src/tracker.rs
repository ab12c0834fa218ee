//! Application facade: identity, room session and ledger behind one set of
//! actions, each reporting failure through a single error slot.

use crate::{
    identity::{IdentityStore, LocalStore},
    ledger::{Ledger, TransferMode},
    session::{RoomSession, SessionState},
    sync::RoomView,
    Error, ErrorKind, Gateway, Result,
};
use chipledger_types::ledger::{ParticipantId, TransferReceipt};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Message shown when a room code does not resolve.
pub const ROOM_NOT_FOUND_MESSAGE: &str =
    "Room not found. Please check the room code or create a new room.";

/// One participant's chip tracker.
///
/// Actions take `&mut self`, so a tracker runs at most one at a time. A
/// failed action logs the cause and replaces the user-visible error; a
/// successful one clears it.
pub struct Tracker<G: Gateway, S: LocalStore> {
    identity: IdentityStore<S>,
    session: RoomSession<G>,
    ledger: Ledger<G>,
    error: Option<String>,
}

impl<G: Gateway, S: LocalStore> Tracker<G, S> {
    pub fn new(gateway: G, store: S, mode: TransferMode) -> Self {
        let identity = IdentityStore::new(store);
        let participant = identity.participant_id();
        let name = identity.display_name();
        Self {
            session: RoomSession::new(gateway.clone(), participant, name),
            ledger: Ledger::new(gateway, mode),
            identity,
            error: None,
        }
    }

    pub fn identity(&self) -> &IdentityStore<S> {
        &self.identity
    }

    pub fn session(&self) -> &RoomSession<G> {
        &self.session
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.session.participant()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn view(&self) -> RoomView {
        self.session.view()
    }

    pub fn watch(&self) -> watch::Receiver<RoomView> {
        self.session.watch()
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.ledger.mode()
    }

    /// The last action's error, if it failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn record<T>(&mut self, action: &'static str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.error = None,
            Err(e) => {
                error!(action, kind = ?e.kind(), error = %e, "action failed");
                self.error = Some(user_message(action, e));
            }
        }
        result
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let result = self.session.set_name(name).map(|name| {
            self.identity.set_display_name(&name);
        });
        self.record("setting name", result)
    }

    pub async fn rename(&mut self, name: &str) -> Result<()> {
        let result = self.session.rename(name).await.map(|name| {
            self.identity.set_display_name(&name);
        });
        self.record("updating name", result)
    }

    /// Create a room and join it. Returns the new room code.
    pub async fn create_room(&mut self) -> Result<String> {
        let result = self.session.create_room().await.map(|code| {
            self.identity.set_active_room(&code);
            code
        });
        self.record("creating room", result)
    }

    pub async fn join_room(&mut self, code: &str) -> Result<()> {
        let was_joined = self.session.room().is_some();
        let result = self.session.join_room(code).await;
        match self.session.room() {
            Some(room) => self.identity.set_active_room(room),
            None if was_joined => self.identity.clear_active_room(),
            None => {}
        }
        self.record("joining room", result)
    }

    pub async fn leave_room(&mut self) -> Result<()> {
        let result = self.session.leave_room().await.map(|_| {
            self.identity.clear_active_room();
        });
        self.record("leaving room", result)
    }

    /// Rejoin the room persisted by a previous run, if any. A room that no
    /// longer resolves is forgotten.
    pub async fn resume(&mut self) -> Result<Option<String>> {
        let Some(room) = self.identity.active_room() else {
            return Ok(None);
        };
        if self.session.name().is_none() {
            warn!(%room, "not resuming room without a display name");
            return Ok(None);
        }
        let result = self.session.join_room(&room).await;
        if let Err(e) = &result {
            if e.kind() == ErrorKind::RoomNotFound {
                self.identity.clear_active_room();
            }
        }
        let result = result.map(|()| {
            info!(%room, "resumed session");
            Some(room)
        });
        self.record("resuming session", result)
    }

    /// Send `amount` chips to `to`, then re-read the room.
    pub async fn transfer(&mut self, to: ParticipantId, amount: i64) -> Result<TransferReceipt> {
        let view = self.session.view();
        let from = self.session.participant();
        let result = self.ledger.transfer(&view, from, to, amount).await;
        if result.is_ok() {
            if let Err(e) = self.session.refresh().await {
                warn!(error = %e, "failed to refresh after transfer");
            }
        }
        self.record("transferring chips", result)
    }

    /// Re-read the active room.
    pub async fn refresh(&mut self) -> Result<()> {
        let result = self.session.refresh().await;
        self.record("loading room", result)
    }
}

/// Text shown to the user for a failed action.
pub fn user_message(action: &str, err: &Error) -> String {
    match err.kind() {
        ErrorKind::RoomNotFound => ROOM_NOT_FOUND_MESSAGE.to_string(),
        _ => format!("Error {action}: {err}"),
    }
}
