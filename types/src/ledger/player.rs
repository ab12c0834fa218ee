use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ValidationError, MAX_NAME_LENGTH};

/// Stable anonymous participant identifier.
pub type ParticipantId = Uuid;

/// Row of the `players` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
}

impl Participant {
    pub fn new(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Trim a display name and enforce [MAX_NAME_LENGTH].
pub fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let len = name.chars().count();
    if len > MAX_NAME_LENGTH {
        return Err(ValidationError::NameTooLong {
            max: MAX_NAME_LENGTH,
            got: len,
        });
    }
    Ok(name.to_string())
}
