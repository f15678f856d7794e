use std::fmt;

use blake3::Hasher;

use crate::error::{Error, Result};
use crate::ids::AtomId;
use crate::ops::AtomOp;

const ATOM_DOMAIN: &[u8] = b"causaltree/atom/v1";
pub const CONTENT_HASH_WIDTH: usize = 32;

/// BLAKE3 digest used both as atom checksum and as content address in the object store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; CONTENT_HASH_WIDTH]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_WIDTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let mut out = [0u8; CONTENT_HASH_WIDTH];
        hex::decode_to_slice(text, &mut out)
            .map_err(|e| Error::InvalidOperation(format!("invalid content hash: {e}")))?;
        Ok(Self(out))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; CONTENT_HASH_WIDTH] = bytes
            .try_into()
            .map_err(|_| Error::InvalidOperation("expected 32-byte content hash".into()))?;
        Ok(Self(arr))
    }

    pub(crate) fn finish(hasher: Hasher) -> Self {
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        ContentHash::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Immutable, causally linked operation.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Atom<Op> {
    pub id: AtomId,
    pub cause: Option<AtomId>,
    pub op: Op,
    pub checksum: ContentHash,
}

impl<Op: AtomOp> Atom<Op> {
    /// Build an atom and seal it with its checksum.
    pub fn new(id: AtomId, cause: Option<AtomId>, op: Op) -> Self {
        let checksum = compute_checksum(&id, cause.as_ref(), &op);
        Self {
            id,
            cause,
            op,
            checksum,
        }
    }

    /// Recompute the checksum and compare it to the stored one.
    pub fn verify(&self) -> Result<()> {
        let actual = compute_checksum(&self.id, self.cause.as_ref(), &self.op);
        if actual != self.checksum {
            return Err(Error::ChecksumMismatch {
                id: self.id.clone(),
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }
}

impl<Op> Atom<Op> {
    /// Content address of the atom.
    pub fn hash(&self) -> ContentHash {
        self.checksum
    }

    pub fn is_root(&self) -> bool {
        self.cause.is_none()
    }
}

pub(crate) fn hash_atom_id(hasher: &mut Hasher, id: &AtomId) {
    hasher.update(&id.timestamp.to_be_bytes());
    hasher.update(&(id.site.as_bytes().len() as u32).to_be_bytes());
    hasher.update(id.site.as_bytes());
    hasher.update(&id.priority.to_be_bytes());
}

pub fn compute_checksum<Op: AtomOp>(id: &AtomId, cause: Option<&AtomId>, op: &Op) -> ContentHash {
    let mut hasher = Hasher::new();
    hasher.update(ATOM_DOMAIN);
    hash_atom_id(&mut hasher, id);
    match cause {
        Some(cause) => {
            hasher.update(&[1]);
            hash_atom_id(&mut hasher, cause);
        }
        None => {
            hasher.update(&[0]);
        }
    }
    op.hash_into(&mut hasher);
    ContentHash::finish(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SiteId;
    use crate::ops::AppOp;

    #[test]
    fn tampered_atom_fails_verification() {
        let site = SiteId::new(b"a");
        let mut atom = Atom::new(AtomId::new(1, &site, 0), None, AppOp::file("e1"));
        atom.verify().unwrap();

        atom.op = AppOp::file("e2");
        assert!(matches!(atom.verify(), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn checksum_covers_cause_and_priority() {
        let site = SiteId::new(b"a");
        let root = AtomId::new(1, &site, 0);
        let a = Atom::new(AtomId::new(2, &site, 0), Some(root.clone()), AppOp::tag("x"));
        let b = Atom::new(AtomId::new(2, &site, 1), Some(root), AppOp::tag("x"));
        let c = Atom::new(AtomId::new(2, &site, 0), None, AppOp::tag("x"));
        assert_ne!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
    }

    #[test]
    fn hex_round_trip() {
        let site = SiteId::new(b"a");
        let atom = Atom::new(AtomId::new(1, &site, 0), None, AppOp::file("e1"));
        let hex = atom.hash().to_hex();
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), atom.hash());
        assert!(ContentHash::from_hex("abc").is_err());
    }

    #[test]
    fn non_ascii_hex_is_rejected() {
        // 64 bytes long, but not 64 hex digits
        let hex = format!("a{}b", "é".repeat(31));
        assert_eq!(hex.len(), CONTENT_HASH_WIDTH * 2);
        assert!(matches!(
            ContentHash::from_hex(&hex),
            Err(Error::InvalidOperation(_))
        ));
        assert!(ContentHash::from_hex(&"zz".repeat(32)).is_err());
    }
}
