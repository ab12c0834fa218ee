//! Room session lifecycle: `NoName -> Named -> Joined`.

use crate::{
    sync::{LiveView, RoomView},
    Error, Gateway, Precondition, Result,
};
use chipledger_types::{
    api::{MembershipUpsert, OnConflict},
    ledger::{
        generate_room_code, normalize_room_code, validate_name, Participant, ParticipantId,
        STARTING_CHIPS,
    },
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    NoName,
    Named,
    Joined { room: String },
}

/// One participant's session against a gateway.
pub struct RoomSession<G: Gateway> {
    gateway: G,
    participant: ParticipantId,
    name: Option<String>,
    room: Option<String>,
    live: LiveView<G>,
}

impl<G: Gateway> RoomSession<G> {
    /// Start a session for `participant`, optionally with a previously
    /// persisted display name.
    pub fn new(gateway: G, participant: ParticipantId, name: Option<String>) -> Self {
        let name = name.and_then(|name| match validate_name(&name) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(error = %e, "ignoring persisted display name");
                None
            }
        });
        Self {
            live: LiveView::new(gateway.clone()),
            gateway,
            participant,
            name,
            room: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.name, &self.room) {
            (_, Some(room)) => SessionState::Joined { room: room.clone() },
            (Some(_), None) => SessionState::Named,
            (None, None) => SessionState::NoName,
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn live(&self) -> &LiveView<G> {
        &self.live
    }

    pub fn view(&self) -> RoomView {
        self.live.view()
    }

    pub fn watch(&self) -> watch::Receiver<RoomView> {
        self.live.watch()
    }

    /// Set the display name locally. The gateway learns it on the next join.
    pub fn set_name(&mut self, name: &str) -> Result<String> {
        let name = validate_name(name)?;
        self.name = Some(name.clone());
        Ok(name)
    }

    /// Update the display name on the gateway, then locally.
    ///
    /// Before the first join there is no participant row yet and only the
    /// local name changes. Once the gateway has accepted the name the rename
    /// succeeds even if re-reading the room fails.
    pub async fn rename(&mut self, name: &str) -> Result<String> {
        let name = validate_name(name)?;
        let affected = self.gateway.rename_player(self.participant, &name).await?;
        if affected.rows == 0 {
            debug!(participant = %self.participant, "no participant row to rename yet");
        }
        self.name = Some(name.clone());
        if self.room.is_some() {
            if let Err(e) = self.live.refresh().await {
                warn!(error = %e, "failed to refresh after rename");
            }
        }
        info!(participant = %self.participant, %name, "renamed");
        Ok(name)
    }

    /// Create a room with a fresh code and join it.
    pub async fn create_room(&mut self) -> Result<String> {
        self.require_joinable(None)?;
        let code = generate_room_code(&mut rand::thread_rng());
        let (_, created) = self.gateway.insert_room(&code).await?;
        if !created {
            // Codes are not checked for collisions: the existing room is joined
            debug!(room = %code, "room code already in use, reusing room");
        }
        self.join_room(&code).await?;
        Ok(code)
    }

    fn require_joinable(&self, code: Option<&str>) -> std::result::Result<(), Precondition> {
        if self.name.is_none() {
            return Err(Precondition::MissingName);
        }
        match (&self.room, code) {
            (None, _) => Ok(()),
            (Some(current), Some(code)) if current == code => Ok(()),
            (Some(current), _) => Err(Precondition::AlreadyInRoom(current.clone())),
        }
    }

    /// Join the room `code`, seating this participant with
    /// [STARTING_CHIPS] unless they already hold a membership there.
    ///
    /// Joining the current room again re-establishes the live view. If that
    /// fails the session is no longer joined.
    pub async fn join_room(&mut self, code: &str) -> Result<()> {
        let code = normalize_room_code(code)?;
        self.require_joinable(Some(code.as_str()))?;
        let name = self.name.clone().ok_or(Precondition::MissingName)?;

        if self.gateway.get_room(&code).await?.is_none() {
            return Err(Error::RoomNotFound(code));
        }
        self.gateway
            .upsert_player(&Participant::new(self.participant, name))
            .await?;
        let membership = self
            .gateway
            .upsert_membership(
                &code,
                &MembershipUpsert {
                    participant_id: self.participant,
                    chips: STARTING_CHIPS,
                    on_conflict: OnConflict::Ignore,
                },
            )
            .await?;

        if let Err(e) = self.live.attach(&code).await {
            if self.room.take().is_some() {
                warn!(room = %code, "lost live view of the active room");
            }
            return Err(e);
        }
        info!(room = %code, participant = %self.participant, chips = membership.chips, "joined room");
        self.room = Some(code);
        Ok(())
    }

    /// Leave the active room: delete this participant's membership and stop
    /// following the room. The room and other memberships are untouched.
    pub async fn leave_room(&mut self) -> Result<String> {
        let room = self.room.clone().ok_or(Precondition::NotInRoom)?;
        self.gateway
            .delete_membership(&room, self.participant)
            .await?;
        self.live.detach();
        self.room = None;
        info!(%room, participant = %self.participant, "left room");
        Ok(room)
    }

    /// Re-read the active room.
    pub async fn refresh(&self) -> Result<()> {
        self.live.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{LocalGateway, Op},
        ErrorKind,
    };
    use chipledger_types::ledger::ValidationError;
    use uuid::Uuid;

    fn session(gateway: &LocalGateway, name: Option<&str>) -> RoomSession<LocalGateway> {
        RoomSession::new(gateway.clone(), Uuid::new_v4(), name.map(str::to_string))
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let gateway = LocalGateway::new();
        let mut session = session(&gateway, None);
        assert_eq!(session.state(), SessionState::NoName);

        // A name is required before any remote call
        let err = session.create_room().await.unwrap_err();
        assert!(matches!(err, Error::Precondition(Precondition::MissingName)));
        assert_eq!(gateway.writes(), 0);

        assert!(matches!(
            session.set_name("   "),
            Err(Error::Precondition(Precondition::Invalid(ValidationError::EmptyName)))
        ));
        assert_eq!(session.set_name(" Alice ").unwrap(), "Alice");
        assert_eq!(session.state(), SessionState::Named);

        let code = session.create_room().await.unwrap();
        assert_eq!(session.state(), SessionState::Joined { room: code.clone() });
        assert_eq!(session.view().members.len(), 1);
        assert_eq!(session.view().members[0].chips(), STARTING_CHIPS);

        assert_eq!(session.leave_room().await.unwrap(), code);
        assert_eq!(session.state(), SessionState::Named);
        assert!(session.view().room_id.is_none());
        assert!(matches!(
            session.leave_room().await,
            Err(Error::Precondition(Precondition::NotInRoom))
        ));
    }

    #[tokio::test]
    async fn test_rejoin_preserves_balance() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        let participant = Uuid::new_v4();

        let mut first = RoomSession::new(gateway.clone(), participant, Some("Alice".into()));
        first.join_room("ab12cd").await.unwrap();
        gateway
            .simulator()
            .update_chips("ab12cd", participant, 420)
            .unwrap();

        // A new process for the same participant reconnects
        drop(first);
        let mut second = RoomSession::new(gateway.clone(), participant, Some("Alice".into()));
        second.join_room("ab12cd").await.unwrap();
        assert_eq!(second.view().member(participant).unwrap().chips(), 420);

        // Rejoining the active room is allowed and changes nothing
        second.join_room("ab12cd").await.unwrap();
        let members = gateway.simulator().list_memberships("ab12cd", None).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].chips(), 420);
    }

    #[tokio::test]
    async fn test_join_errors() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        gateway.simulator().insert_room("other1").unwrap();
        let mut session = session(&gateway, Some("Alice"));

        let err = session.join_room("zz99zz").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoomNotFound);
        assert_eq!(session.state(), SessionState::Named);

        let err = session.join_room("no spaces").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionNotMet);

        // Gateway failures leave the session where it was
        gateway.fail_next(Op::UpsertMembership);
        let err = session.join_room("ab12cd").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteOperationFailed);
        assert_eq!(session.state(), SessionState::Named);

        session.join_room(" ab12cd ").await.unwrap();
        let err = session.join_room("other1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Precondition(Precondition::AlreadyInRoom(ref room)) if room == "ab12cd"
        ));
    }

    #[tokio::test]
    async fn test_leave_deletes_only_own_membership() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        let mut alice = session(&gateway, Some("Alice"));
        let mut bob = session(&gateway, Some("Bob"));
        alice.join_room("ab12cd").await.unwrap();
        bob.join_room("ab12cd").await.unwrap();

        alice.leave_room().await.unwrap();
        let members = gateway.simulator().list_memberships("ab12cd", None).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].participant_id(), bob.participant());
        assert!(gateway.simulator().get_room("ab12cd").unwrap().is_some());

        // A failed delete keeps the session joined
        gateway.fail_next(Op::DeleteMembership);
        assert!(bob.leave_room().await.is_err());
        assert_eq!(bob.room(), Some("ab12cd"));
    }

    #[tokio::test]
    async fn test_rename_is_reflected_in_memberships() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        let mut session = session(&gateway, Some("Alice"));

        // Before joining only the local name changes
        assert_eq!(session.rename("Al").await.unwrap(), "Al");
        assert_eq!(session.name(), Some("Al"));

        session.join_room("ab12cd").await.unwrap();
        session.rename("Alicia").await.unwrap();
        assert_eq!(session.view().members[0].display_name(), "Alicia");
        let members = gateway.simulator().list_memberships("ab12cd", None).unwrap();
        assert_eq!(members[0].display_name(), "Alicia");
    }

    #[tokio::test]
    async fn test_failed_rejoin_leaves_session_unjoined() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        let mut session = session(&gateway, Some("Alice"));
        session.join_room("ab12cd").await.unwrap();
        assert_eq!(session.live().subscriptions().len(), 2);

        // Re-attaching the active room fails half way
        gateway.fail_next(Op::Subscribe);
        let err = session.join_room("ab12cd").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteOperationFailed);
        assert_eq!(session.state(), SessionState::Named);
        assert!(session.view().room_id.is_none());
        assert!(session.live().subscriptions().is_empty());

        // Transfers now fail for the right reason and a plain join recovers
        assert!(matches!(
            crate::ledger::check(&session.view(), session.participant(), Uuid::new_v4(), 10),
            Err(Precondition::NotInRoom)
        ));
        session.join_room("ab12cd").await.unwrap();
        assert_eq!(
            session.state(),
            SessionState::Joined {
                room: "ab12cd".to_string()
            }
        );
        assert_eq!(session.live().subscriptions().len(), 2);
        assert_eq!(session.view().members.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_survives_failed_refresh() {
        let gateway = LocalGateway::new();
        gateway.simulator().insert_room("ab12cd").unwrap();
        let mut session = session(&gateway, Some("Alice"));
        session.join_room("ab12cd").await.unwrap();

        gateway.fail_next(Op::ListMemberships);
        assert_eq!(session.rename("Alicia").await.unwrap(), "Alicia");
        assert_eq!(session.name(), Some("Alicia"));
        let members = gateway.simulator().list_memberships("ab12cd", None).unwrap();
        assert_eq!(members[0].display_name(), "Alicia");

        // The next read catches up
        session.refresh().await.unwrap();
        assert_eq!(session.view().members[0].display_name(), "Alicia");
    }

    #[test]
    fn test_invalid_persisted_name_is_dropped() {
        let gateway = LocalGateway::new();
        let long = "x".repeat(100);
        let session = session(&gateway, Some(long.as_str()));
        assert_eq!(session.state(), SessionState::NoName);
    }
}
