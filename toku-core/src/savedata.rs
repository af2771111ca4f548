//! Save-data envelope: opaque serialized engine state, plaintext or encrypted.

/// Magic prefix every passphrase-encrypted save carries. The rest of the
/// layout belongs to the engine and is never interpreted here.
pub const ENCRYPTED_MAGIC: [u8; 8] = *b"tokEsave";

/// An immutable snapshot of full instance state: identity keys, friend list,
/// groups, settings. Produced by `Instance::snapshot*`, consumed by
/// `Instance::restore*` or `Instance::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveData {
    bytes: Vec<u8>,
}

impl SaveData {
    /// Wrap raw bytes, e.g. read back from storage.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        SaveData { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether this envelope requires a passphrase to load.
    pub fn is_encrypted(&self) -> bool {
        self.bytes.starts_with(&ENCRYPTED_MAGIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_not_marked_encrypted() {
        let data = SaveData::from_bytes(vec![1, 2, 3, 4]);
        assert!(!data.is_encrypted());
    }

    #[test]
    fn magic_prefix_marks_encrypted() {
        let mut bytes = ENCRYPTED_MAGIC.to_vec();
        bytes.extend_from_slice(&[9, 9, 9]);
        assert!(SaveData::from_bytes(bytes).is_encrypted());
    }

    #[test]
    fn short_or_empty_is_plaintext() {
        assert!(!SaveData::from_bytes(vec![]).is_encrypted());
        assert!(!SaveData::from_bytes(ENCRYPTED_MAGIC[..4].to_vec()).is_encrypted());
    }
}
