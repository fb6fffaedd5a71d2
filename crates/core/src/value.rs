use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, length-tagged property value.
///
/// Values follow flattened-tree conventions: strings are stored with a
/// trailing NUL, numeric cells are big-endian 32-bit words. The accessors
/// decode those conventions; everything else treats the value as raw bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropValue(Vec<u8>);

impl PropValue {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encode a string value with the trailing NUL.
    pub fn from_str(s: &str) -> Self {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        Self(bytes)
    }

    /// Encode a single big-endian cell.
    pub fn from_u32(cell: u32) -> Self {
        Self(cell.to_be_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode as a NUL-terminated string. A missing terminator is accepted
    /// so hand-built values still compare usefully.
    pub fn as_str(&self) -> Option<&str> {
        let bytes = match self.0.split_last() {
            Some((&0, head)) => head,
            _ => &self.0[..],
        };
        std::str::from_utf8(bytes).ok()
    }

    /// Decode the first big-endian cell.
    pub fn as_u32(&self) -> Option<u32> {
        let cell: [u8; 4] = self.0.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(cell))
    }
}

impl fmt::Debug for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) if !s.is_empty() && s.chars().all(|c| !c.is_control()) => {
                write!(f, "PropValue({s:?})")
            }
            _ => write!(f, "PropValue({} bytes)", self.0.len()),
        }
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<u32> for PropValue {
    fn from(cell: u32) -> Self {
        Self::from_u32(cell)
    }
}
