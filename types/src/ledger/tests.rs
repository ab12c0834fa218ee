use super::*;
use crate::api::{ChangeEvent, ChangeFilter, ChangeKind, MembershipUpsert, OnConflict, Table};
use rand::{rngs::StdRng, SeedableRng};
use uuid::Uuid;

#[test]
fn test_generated_codes_use_alphabet() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..100 {
        let code = generate_room_code(&mut rng);
        assert_eq!(code.len(), ROOM_CODE_LENGTH);
        assert!(code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
        assert_eq!(normalize_room_code(&code).unwrap(), code);
    }
}

#[test]
fn test_normalize_room_code() {
    assert_eq!(normalize_room_code("  ab12cd ").unwrap(), "ab12cd");
    assert_eq!(normalize_room_code("Friday-Game").unwrap(), "Friday-Game");
    assert!(normalize_room_code("").is_err());
    assert!(normalize_room_code("   ").is_err());
    assert!(normalize_room_code("ab/cd").is_err());
    assert!(normalize_room_code(&"a".repeat(MAX_ROOM_CODE_LENGTH + 1)).is_err());
}

#[test]
fn test_validate_name() {
    assert_eq!(validate_name(" Alice ").unwrap(), "Alice");
    assert_eq!(validate_name(""), Err(ValidationError::EmptyName));
    assert_eq!(
        validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)),
        Err(ValidationError::NameTooLong {
            max: MAX_NAME_LENGTH,
            got: MAX_NAME_LENGTH + 1
        })
    );
    // Characters, not bytes
    assert!(validate_name(&"é".repeat(MAX_NAME_LENGTH)).is_ok());
}

#[test]
fn test_validate_transfer() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    assert!(validate_transfer(a, b, 1).is_ok());
    assert!(validate_transfer(a, b, 901).is_ok());
    assert_eq!(validate_transfer(a, a, 10), Err(ValidationError::SelfTransfer));
    assert_eq!(
        validate_transfer(a, b, 0),
        Err(ValidationError::NonPositiveAmount(0))
    );
    assert_eq!(
        validate_transfer(a, b, -5),
        Err(ValidationError::NonPositiveAmount(-5))
    );
}

#[test]
fn test_change_filter_matches() {
    let filter = ChangeFilter::new(Table::RoomPlayers, "ab12cd");
    let hit = ChangeEvent {
        table: Table::RoomPlayers,
        kind: ChangeKind::Update,
        room_id: "ab12cd".to_string(),
    };
    assert!(filter.matches(&hit));

    let other_room = ChangeEvent {
        room_id: "zz99zz".to_string(),
        ..hit.clone()
    };
    assert!(!filter.matches(&other_room));

    let other_table = ChangeEvent {
        table: Table::Transactions,
        ..hit
    };
    assert!(!filter.matches(&other_table));
}

#[test]
fn test_table_path_segments() {
    for table in [
        Table::Rooms,
        Table::Players,
        Table::RoomPlayers,
        Table::Transactions,
    ] {
        assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
    }
    assert!("bets".parse::<Table>().is_err());
}

#[test]
fn test_membership_view_wire_shape() {
    let view = MembershipView {
        membership: Membership {
            id: Uuid::nil(),
            participant_id: Uuid::nil(),
            room_id: "ab12cd".to_string(),
            chips: STARTING_CHIPS,
            joined_at: 7,
        },
        name: Some("Alice".to_string()),
    };
    let json = serde_json::to_value(&view).unwrap();
    // The joined name sits next to the row's own columns
    assert_eq!(json["chips"], 1000);
    assert_eq!(json["name"], "Alice");
    assert_eq!(view.display_name(), "Alice");

    let anonymous = MembershipView { name: None, ..view };
    assert_eq!(anonymous.display_name(), "Unknown");
}

#[test]
fn test_upsert_defaults_to_merge() {
    let body = format!(r#"{{"participant_id":"{}","chips":1000}}"#, Uuid::nil());
    let upsert: MembershipUpsert = serde_json::from_str(&body).unwrap();
    assert_eq!(upsert.on_conflict, OnConflict::Merge);
}
