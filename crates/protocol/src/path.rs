//! Dynamic submission path derived from the device's key notification.
//!
//! Each handshake posts to `/con_ing_{suffix}` where the suffix is computed
//! from the tail of the notification's `data1` field. The device checks it,
//! so the derivation must match the firmware exactly.

/// Number of trailing characters the suffix is computed from.
pub const PATH_TAIL_LENGTH: usize = 10;

/// Alphabet whose indices become the suffix digits.
pub const PATH_ALPHABET: &str = "ABCDEFGHIJ";

/// Prefix of the handshake submission path.
pub const SUBMISSION_PATH_PREFIX: &str = "con_ing_";

/// Computes the path suffix from the raw notification payload.
///
/// Takes the last 10 characters, splits them into pairs, and for each pair
/// looks up the second character in `ABCDEFGHIJ`. Indices are concatenated
/// as decimal digits; characters outside the alphabet are skipped and a
/// trailing single-character chunk is ignored.
pub fn derive_path_suffix(payload: &str) -> String {
    let chars: Vec<char> = payload.chars().collect();
    let tail = &chars[chars.len().saturating_sub(PATH_TAIL_LENGTH)..];

    tail.chunks_exact(2)
        .filter_map(|pair| PATH_ALPHABET.find(pair[1]))
        .map(|index| char::from(b'0' + index as u8))
        .collect()
}

/// Returns the full submission path segment, e.g. `con_ing_01234`.
pub fn submission_path(payload: &str) -> String {
    format!("{}{}", SUBMISSION_PATH_PREFIX, derive_path_suffix(payload))
}
