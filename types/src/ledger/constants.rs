/// Maximum display name length, in characters
pub const MAX_NAME_LENGTH: usize = 32;

/// Chips granted to a membership when a participant first joins a room
pub const STARTING_CHIPS: i64 = 1_000;

/// Length of generated room codes
pub const ROOM_CODE_LENGTH: usize = 6;

/// Alphabet generated room codes are drawn from
pub const ROOM_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Longest room code accepted from user input
pub const MAX_ROOM_CODE_LENGTH: usize = 32;

/// Amounts offered by front ends. The ledger accepts any positive amount.
pub const PRESET_AMOUNTS: [i64; 4] = [10, 20, 50, 100];
