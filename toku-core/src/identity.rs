//! Public addresses and key material: 38-byte address (key, nospam, checksum).

use std::fmt;

use crate::emoji;

/// Size of a public or secret key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Size of a secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;
/// Size of the nospam component in bytes.
pub const NOSPAM_SIZE: usize = 4;
/// Size of the trailing checksum in bytes.
pub const CHECKSUM_SIZE: usize = 2;
/// Size of a full shareable address: public key, nospam, checksum.
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// Error parsing an address from bytes, hex, or emoji.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("malformed address")]
    InvalidFormat,
    #[error("address checksum mismatch")]
    InvalidChecksum,
}

/// A peer's long-term public key (32 bytes).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Uppercase hex rendition.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse from hex (case-insensitive).
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let bytes = hex::decode(s).map_err(|_| AddressError::InvalidFormat)?;
        let arr: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| AddressError::InvalidFormat)?;
        Ok(PublicKey(arr))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A peer's long-term secret key. Debug output is redacted.
#[derive(Clone)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        SecretKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Public and secret key of an instance.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

/// XOR-fold the given bytes into a 2-byte accumulator (byte `i` into `i % 2`).
fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut acc = [0u8; CHECKSUM_SIZE];
    for (i, b) in bytes.iter().enumerate() {
        acc[i % CHECKSUM_SIZE] ^= b;
    }
    acc
}

/// Shareable 38-byte address: public key, nospam, checksum over the first 36
/// bytes. Valid by construction; parsing rejects any checksum mismatch.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// Build an address from its components, computing the checksum.
    pub fn new(public_key: PublicKey, nospam: u32) -> Self {
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes[..PUBLIC_KEY_SIZE].copy_from_slice(public_key.as_bytes());
        bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]
            .copy_from_slice(&nospam.to_le_bytes());
        let check = checksum(&bytes[..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..].copy_from_slice(&check);
        Address(bytes)
    }

    /// Parse a raw 38-byte address. The stored checksum must match the
    /// computed one; a mismatch is an error, never a warning.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let arr: [u8; ADDRESS_SIZE] = bytes
            .try_into()
            .map_err(|_| AddressError::InvalidFormat)?;
        let check = checksum(&arr[..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        if check != arr[PUBLIC_KEY_SIZE + NOSPAM_SIZE..] {
            return Err(AddressError::InvalidChecksum);
        }
        Ok(Address(arr))
    }

    /// Parse from hex (case-insensitive), then validate as bytes.
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let bytes = hex::decode(s).map_err(|_| AddressError::InvalidFormat)?;
        Self::from_bytes(&bytes)
    }

    /// Whether `bytes` form a valid address: correct length and checksum.
    pub fn is_valid(bytes: &[u8]) -> bool {
        Self::from_bytes(bytes).is_ok()
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn public_key(&self) -> PublicKey {
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&self.0[..PUBLIC_KEY_SIZE]);
        PublicKey(key)
    }

    pub fn nospam(&self) -> u32 {
        let mut nospam = [0u8; NOSPAM_SIZE];
        nospam.copy_from_slice(&self.0[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        u32::from_le_bytes(nospam)
    }

    pub fn checksum(&self) -> u16 {
        let mut check = [0u8; CHECKSUM_SIZE];
        check.copy_from_slice(&self.0[PUBLIC_KEY_SIZE + NOSPAM_SIZE..]);
        u16::from_le_bytes(check)
    }

    /// Deterministic uppercase hex, reversible via [`Address::from_hex`].
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Emoji rendition: one symbol per byte, fixed output length.
    pub fn to_emoji(&self) -> String {
        emoji::encode(&self.0)
    }

    /// Parse an emoji rendition back into an address. Garbled or truncated
    /// input is rejected, and the checksum is validated again.
    pub fn from_emoji(s: &str) -> Result<Self, AddressError> {
        let bytes = emoji::decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_address() -> Address {
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        Address::new(PublicKey::from_bytes(key), 0xDEAD_BEEF)
    }

    #[test]
    fn new_address_is_valid() {
        let addr = sample_address();
        assert!(Address::is_valid(addr.as_bytes()));
        assert_eq!(addr.nospam(), 0xDEAD_BEEF);
    }

    #[test]
    fn byte_roundtrip() {
        let addr = sample_address();
        let parsed = Address::from_bytes(addr.as_bytes()).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn hex_roundtrip() {
        let addr = sample_address();
        let hex = addr.to_hex();
        assert_eq!(hex.len(), ADDRESS_SIZE * 2);
        let parsed = Address::from_hex(&hex).unwrap();
        assert_eq!(parsed, addr);
        // Case-insensitive on the way in.
        let parsed_lower = Address::from_hex(&hex.to_lowercase()).unwrap();
        assert_eq!(parsed_lower, addr);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let addr = sample_address();
        let mut bytes = *addr.as_bytes();
        bytes[ADDRESS_SIZE - 1] ^= 0xFF;
        assert_eq!(
            Address::from_bytes(&bytes),
            Err(AddressError::InvalidChecksum)
        );
        assert!(!Address::is_valid(&bytes));
    }

    #[test]
    fn corrupted_body_rejected() {
        let addr = sample_address();
        let mut bytes = *addr.as_bytes();
        bytes[0] ^= 0x01;
        assert_eq!(
            Address::from_bytes(&bytes),
            Err(AddressError::InvalidChecksum)
        );
    }

    #[test]
    fn wrong_length_rejected() {
        assert_eq!(Address::from_bytes(&[]), Err(AddressError::InvalidFormat));
        assert_eq!(
            Address::from_bytes(&[0u8; ADDRESS_SIZE - 1]),
            Err(AddressError::InvalidFormat)
        );
        assert_eq!(
            Address::from_bytes(&[0u8; ADDRESS_SIZE + 1]),
            Err(AddressError::InvalidFormat)
        );
    }

    #[test]
    fn bad_hex_rejected() {
        assert_eq!(Address::from_hex(""), Err(AddressError::InvalidFormat));
        assert_eq!(
            Address::from_hex("not hex at all"),
            Err(AddressError::InvalidFormat)
        );
    }

    #[test]
    fn emoji_roundtrip() {
        let addr = sample_address();
        let s = addr.to_emoji();
        assert_eq!(s.chars().count(), ADDRESS_SIZE);
        let parsed = Address::from_emoji(&s).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn garbled_emoji_rejected() {
        let addr = sample_address();
        let mut s = addr.to_emoji();
        s.push('x');
        assert_eq!(Address::from_emoji(&s), Err(AddressError::InvalidFormat));
    }

    #[test]
    fn truncated_emoji_rejected() {
        let addr = sample_address();
        let s: String = addr.to_emoji().chars().take(10).collect();
        assert_eq!(Address::from_emoji(&s), Err(AddressError::InvalidFormat));
    }

    #[test]
    fn display_matches_hex() {
        let addr = sample_address();
        assert_eq!(addr.to_string(), addr.to_hex());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let key = sample_address().public_key();
        let parsed = PublicKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);
    }
}
