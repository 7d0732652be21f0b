//! Near-collision search seam.
//!
//! The chain builder only needs "give me two 128-byte blocks that land on the same chaining
//! state". Where they come from is hidden behind [`CollisionOracle`] so the layout code can be
//! tested against deterministic stubs, while the binary uses [`stevens::StevensOracle`].

pub mod stevens;

use crate::md5_state::ChainingState;

/// Two absorbed MD5 blocks.
pub const COLLISION_BLOCK_SIZE: usize = 128;

pub type CollisionBlock = [u8; COLLISION_BLOCK_SIZE];

/// Raw oracle output. Nothing about it is trusted until the chain builder has validated it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CollisionBlockPair {
    pub a: CollisionBlock,
    pub b: CollisionBlock,
}

impl std::fmt::Debug for CollisionBlockPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = |block: &CollisionBlock| -> String {
            block.iter().map(|byte| format!("{:02x}", byte)).collect()
        };
        f.debug_struct("CollisionBlockPair")
            .field("a", &hex(&self.a))
            .field("b", &hex(&self.b))
            .finish()
    }
}

/// Byte values the search must keep out of the blocks it generates.
#[derive(Clone)]
pub struct ForbiddenBytes([bool; 256]);

impl ForbiddenBytes {
    pub fn new<I: IntoIterator<Item = u8>>(bytes: I) -> Self {
        let mut set = [false; 256];
        for byte in bytes {
            set[byte as usize] = true;
        }
        ForbiddenBytes(set)
    }

    pub fn contains(&self, byte: u8) -> bool {
        self.0[byte as usize]
    }

    /// True if any of the four little-endian bytes of `word` is forbidden.
    pub fn hits_word(&self, word: u32) -> bool {
        word.to_le_bytes().iter().any(|&byte| self.contains(byte))
    }
}

impl std::fmt::Debug for ForbiddenBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries((0..=255u8).filter(|&byte| self.contains(byte)))
            .finish()
    }
}

pub trait CollisionOracle {
    /// Blocks until a pair is found. There is no timeout and no retry: whatever comes back is
    /// handed to the caller for validation as-is.
    fn find_collision(
        &self,
        state: ChainingState,
        forbidden: Option<&ForbiddenBytes>,
    ) -> CollisionBlockPair;
}

impl<O: CollisionOracle + ?Sized> CollisionOracle for &O {
    fn find_collision(
        &self,
        state: ChainingState,
        forbidden: Option<&ForbiddenBytes>,
    ) -> CollisionBlockPair {
        (**self).find_collision(state, forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_bytes_checks_every_byte_of_a_word() {
        let forbidden = ForbiddenBytes::new(vec![0x00, b'(']);
        assert!(forbidden.contains(0));
        assert!(!forbidden.contains(1));
        assert!(forbidden.hits_word(0x01020300));
        assert!(forbidden.hits_word(0x28010101));
        assert!(!forbidden.hits_word(0x01010101));
    }
}
