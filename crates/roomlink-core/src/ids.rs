//! Room and peer identifiers
//!
//! Room ids are short codes meant to be typed or scanned by people, so they
//! use an alphabet without look-alike characters. Peer ids, transfer ids,
//! and scratch names are random hex and only ever handled by software.

/// Length of a room id in characters
pub const ROOM_ID_LENGTH: usize = 6;

/// Characters used in room ids (unambiguous set, 32 symbols)
const ROOM_ID_CHARS: &[u8] = b"23456789abcdefghjklmnpqrstuvwxyz";

/// Generate a random room id of the given length (e.g. "ab3cd7")
pub fn generate_room_id(len: usize) -> Result<String, getrandom::Error> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes)?;

    Ok(bytes
        .iter()
        .map(|b| ROOM_ID_CHARS[(*b as usize) % ROOM_ID_CHARS.len()] as char)
        .collect())
}

/// Normalize a room id as typed by a user (trim, drop dashes, lowercase)
pub fn normalize_room_id(id: &str) -> String {
    id.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Check that a room id only uses the room id alphabet
pub fn validate_room_id(id: &str) -> bool {
    let normalized = normalize_room_id(id);
    normalized.len() >= ROOM_ID_LENGTH && normalized.bytes().all(|b| ROOM_ID_CHARS.contains(&b))
}

/// Random hex string of `len` bytes (`2 * len` chars)
pub fn random_hex(len: usize) -> Result<String, getrandom::Error> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Generate a unique connection id for a peer (16 hex chars)
pub fn generate_peer_id() -> Result<String, getrandom::Error> {
    random_hex(8)
}

/// Generate an id for one direct file transfer (32 hex chars)
pub fn generate_transfer_id() -> Result<String, getrandom::Error> {
    random_hex(16)
}
