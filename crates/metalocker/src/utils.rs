use core::fmt::Write;

/// Converts bytes to a lowercase hexadecimal string representation
///
/// # Examples
///
/// ```
/// # use metalocker::utils::bytes_to_hex_string;
/// let bytes = [0xde, 0xad, 0xbe, 0xef];
/// assert_eq!(bytes_to_hex_string(&bytes), "deadbeef");
/// ```
pub fn bytes_to_hex_string<B: AsRef<[u8]>>(bytes: B) -> String {
    let bytes = bytes.as_ref();
    let mut s = String::with_capacity(2 * bytes.len());
    for byte in bytes {
        write!(s, "{:02x}", byte).expect("writing in a String should never fails");
    }
    s
}

/// Returns the current timestamp, as the number of seconds since UNIX_EPOCH
pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is past the epoch")
        .as_secs()
}

/// Generates a random base58 identifier of `len` random bytes
///
/// Used for lease and locker ids, where the only requirement is uniqueness
/// with overwhelming probability.
pub fn random_id(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::Rng::fill(&mut rand::thread_rng(), bytes.as_mut_slice());
    bs58::encode(bytes).into_string()
}
