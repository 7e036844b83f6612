use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::id::{ClaimId, ContainerId};

/// Handle to an immutable byte range inside the content store.
///
/// A claim names a container file and the `[offset, offset + length)` range
/// the claim's bytes occupy within it. Claims are reference counted by the
/// content store and never mutated after being sealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentClaim {
    /// Identifier of this claim.
    pub id: ClaimId,
    /// Container file the bytes live in.
    pub container: ContainerId,
    /// Byte offset of the claim within the container.
    pub offset: u64,
    /// Length of the claim in bytes.
    pub length: u64,
}

/// A sub-range view into a claim.
///
/// Several records may share one claim with different windows, e.g. an
/// unmodified pass-through clone or a split of one large claim into many
/// records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentWindow {
    /// Offset relative to the start of the claim.
    pub offset: u64,
    /// Number of bytes visible through this window.
    pub length: u64,
}

impl ContentWindow {
    /// A window covering an entire claim of the given length.
    pub fn full(length: u64) -> Self {
        Self { offset: 0, length }
    }
}

/// A record's content reference: a claim plus the window it sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentPointer {
    pub claim: ContentClaim,
    pub window: ContentWindow,
}

impl ContentPointer {
    /// Build a pointer over the whole claim.
    pub fn whole(claim: ContentClaim) -> Self {
        let window = ContentWindow::full(claim.length);
        Self { claim, window }
    }

    /// Build a pointer with an explicit window, validating bounds.
    ///
    /// The window must lie entirely within the claim.
    pub fn windowed(claim: ContentClaim, window: ContentWindow) -> Result<Self, TypeError> {
        let end = window
            .offset
            .checked_add(window.length)
            .ok_or(TypeError::WindowOutOfBounds {
                claim: claim.id,
                offset: window.offset,
                length: window.length,
                claim_length: claim.length,
            })?;
        if end > claim.length {
            return Err(TypeError::WindowOutOfBounds {
                claim: claim.id,
                offset: window.offset,
                length: window.length,
                claim_length: claim.length,
            });
        }
        Ok(Self { claim, window })
    }

    /// Size of the content visible to the owning record.
    pub fn size(&self) -> u64 {
        self.window.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(length: u64) -> ContentClaim {
        ContentClaim {
            id: ClaimId::new(1),
            container: ContainerId::new(0),
            offset: 128,
            length,
        }
    }

    #[test]
    fn whole_pointer_covers_claim() {
        let ptr = ContentPointer::whole(claim(100));
        assert_eq!(ptr.window.offset, 0);
        assert_eq!(ptr.size(), 100);
    }

    #[test]
    fn windowed_pointer_within_bounds() {
        let ptr =
            ContentPointer::windowed(claim(100), ContentWindow { offset: 10, length: 80 }).unwrap();
        assert_eq!(ptr.size(), 80);
    }

    #[test]
    fn window_past_end_is_rejected() {
        let err = ContentPointer::windowed(claim(100), ContentWindow { offset: 50, length: 51 })
            .unwrap_err();
        assert!(matches!(err, TypeError::WindowOutOfBounds { .. }));
    }

    #[test]
    fn window_overflow_is_rejected() {
        let err = ContentPointer::windowed(
            claim(100),
            ContentWindow {
                offset: u64::MAX,
                length: 2,
            },
        )
        .unwrap_err();
        assert!(matches!(err, TypeError::WindowOutOfBounds { .. }));
    }

    #[test]
    fn empty_window_at_end_is_valid() {
        let ptr =
            ContentPointer::windowed(claim(100), ContentWindow { offset: 100, length: 0 }).unwrap();
        assert_eq!(ptr.size(), 0);
    }

    #[test]
    fn serde_roundtrip() {
        let ptr = ContentPointer::whole(claim(42));
        let bytes = bincode::serialize(&ptr).unwrap();
        let decoded: ContentPointer = bincode::deserialize(&bytes).unwrap();
        assert_eq!(ptr, decoded);
    }
}
