use crate::id::ClaimId;

/// Errors produced while constructing foundation types.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// A content window does not fit inside its claim.
    #[error(
        "content window [{offset}, {offset}+{length}) exceeds claim {claim} of length {claim_length}"
    )]
    WindowOutOfBounds {
        claim: ClaimId,
        offset: u64,
        length: u64,
        claim_length: u64,
    },
}
