use std::fs;

use camino::Utf8Path;

/// A 32-byte BLAKE3 hash used to fingerprint node inputs.
///
/// A node whose fingerprint matches the one stored next to its previous
/// result is not executed again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Incremental hasher for node fingerprints.
#[derive(Default)]
pub(crate) struct Fingerprint(blake3::Hasher);

impl Fingerprint {
    pub(crate) fn update(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        // length prefix keeps ("ab", "c") apart from ("a", "bc")
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    /// Mixes in the size and modification time of `path`, if it exists.
    ///
    /// Content is not read, neuroimaging inputs are large and rarely touched
    /// in place.
    pub(crate) fn update_file(&mut self, path: &Utf8Path) -> &mut Self {
        self.update(path.as_str());

        if let Ok(meta) = fs::metadata(path) {
            self.update(meta.len().to_le_bytes());
            if let Ok(modified) = meta.modified()
                && let Ok(since) = modified.duration_since(std::time::UNIX_EPOCH)
            {
                self.update(since.as_nanos().to_le_bytes());
            }
        }

        self
    }

    pub(crate) fn finish(&self) -> Hash32 {
        self.0.finalize().into()
    }
}
