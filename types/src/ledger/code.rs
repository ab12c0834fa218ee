use rand::Rng;

use super::{ValidationError, MAX_ROOM_CODE_LENGTH, ROOM_CODE_ALPHABET, ROOM_CODE_LENGTH};

/// Draw a fresh room code of [ROOM_CODE_LENGTH] characters from
/// [ROOM_CODE_ALPHABET].
///
/// Collisions with existing rooms are not checked for: a colliding code
/// simply joins the existing room.
pub fn generate_room_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ROOM_CODE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Trim a user-typed room code and check that it is safe to use as a path
/// segment. Case is preserved.
pub fn normalize_room_code(code: &str) -> Result<String, ValidationError> {
    let code = code.trim();
    let valid = !code.is_empty()
        && code.len() <= MAX_ROOM_CODE_LENGTH
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ValidationError::InvalidRoomCode(code.to_string()));
    }
    Ok(code.to_string())
}
