//! Room naming.
//!
//! Room names are opaque strings. A few conventions are layered on top so
//! that publishers and subscribers agree on where an entity's events go.

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Global broadcast room.
pub const FEED: &str = "feed";

/// Reserved room driving presence tracking.
pub const PRESENCE: &str = "presence";

/// A room identifier.
pub type RoomId = String;

/// Validate a room name supplied by a client.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains control characters");
    }
    Ok(())
}

/// Whether the name is the reserved presence room.
#[must_use]
pub fn is_presence(name: &str) -> bool {
    name == PRESENCE
}

/// Room for a post's comments and likes.
#[must_use]
pub fn post(post_id: impl std::fmt::Display) -> RoomId {
    format!("post:{post_id}")
}

/// Room for a group's chat and events.
#[must_use]
pub fn group(group_id: impl std::fmt::Display) -> RoomId {
    format!("group:{group_id}")
}

/// Per-user notification room.
#[must_use]
pub fn user(user_id: &str) -> RoomId {
    format!("user:{user_id}")
}

/// Direct-message room shared by two users.
///
/// Participants are ordered so both sides compute the same name.
#[must_use]
pub fn direct(a: &str, b: &str) -> RoomId {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{lo}:{hi}")
}
