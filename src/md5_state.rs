//! Running MD5 chaining state.
//!
//! The chain builder never needs a finished MD5 hash until the very end, it needs the internal
//! state after absorbing whole 64-byte blocks so the collision search can start from it. The
//! compression function is kept behind [`BlockTransform`] so tests can drive the builder with a
//! primitive whose collisions are trivial to construct.

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 64;

/// The four 32-bit words (A, B, C, D) of the MD5 internal state.
pub type ChainingState = [u32; 4];

pub const MD5_IV: ChainingState = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

pub trait BlockTransform {
    /// Absorbs exactly one block into `state`.
    fn transform(&self, state: &mut ChainingState, block: &[u8; BLOCK_SIZE]);

    /// Absorbs `bytes` block by block starting from `state`.
    ///
    /// Fails with [`Error::Size`] if `bytes` doesn't end on a block boundary, which always means
    /// the segment geometry upstream is off.
    fn absorb_buffer(&self, state: ChainingState, bytes: &[u8]) -> Result<ChainingState> {
        if bytes.len() % BLOCK_SIZE != 0 {
            return Err(Error::Size(bytes.len()));
        }

        let mut state = state;
        let mut block = [0u8; BLOCK_SIZE];
        for chunk in bytes.chunks_exact(BLOCK_SIZE) {
            block.copy_from_slice(chunk);
            self.transform(&mut state, &block);
        }
        Ok(state)
    }

    /// Full hash of `bytes` (MD5 length padding included) starting from `iv` instead of the
    /// standard initial state.
    fn digest(&self, iv: ChainingState, bytes: &[u8]) -> [u8; 16] {
        let whole = bytes.len() - bytes.len() % BLOCK_SIZE;
        let mut state = iv;
        let mut block = [0u8; BLOCK_SIZE];
        for chunk in bytes[..whole].chunks_exact(BLOCK_SIZE) {
            block.copy_from_slice(chunk);
            self.transform(&mut state, &block);
        }

        let mut tail = bytes[whole..].to_vec();
        tail.push(0x80);
        while tail.len() % BLOCK_SIZE != 56 {
            tail.push(0);
        }
        tail.extend_from_slice(&((bytes.len() as u64).wrapping_mul(8)).to_le_bytes());
        for chunk in tail.chunks_exact(BLOCK_SIZE) {
            block.copy_from_slice(chunk);
            self.transform(&mut state, &block);
        }

        let mut out = [0u8; 16];
        for (i, word) in state.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// The MD5 compression function from RFC 1321.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5;

pub(crate) const SHIFTS: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, //
    5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, //
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, //
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

/// Additive round constants, also used by the collision search.
pub(crate) const K: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
    0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
    0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
    0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
    0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
    0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
    0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];

/// Message word order used by each of the 64 steps.
pub(crate) const fn word_index(step: usize) -> usize {
    match step / 16 {
        0 => step,
        1 => (5 * step + 1) % 16,
        2 => (3 * step + 5) % 16,
        _ => (7 * step) % 16,
    }
}

pub(crate) fn words_from_block(block: &[u8; BLOCK_SIZE]) -> [u32; 16] {
    let mut words = [0u32; 16];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u32::from_le_bytes([
            block[i * 4],
            block[i * 4 + 1],
            block[i * 4 + 2],
            block[i * 4 + 3],
        ]);
    }
    words
}

pub(crate) fn block_from_words(words: &[u32; 16]) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    for (i, word) in words.iter().enumerate() {
        block[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    block
}

/// Boolean function of the round that `step` belongs to.
#[inline(always)]
pub(crate) fn round_function(step: usize, x: u32, y: u32, z: u32) -> u32 {
    match step / 16 {
        0 => z ^ (x & (y ^ z)),
        1 => y ^ (z & (x ^ y)),
        2 => x ^ y ^ z,
        _ => y ^ (x | !z),
    }
}

/// Runs the compression function directly on message words.
pub(crate) fn compress_words(state: &mut ChainingState, m: &[u32; 16]) {
    let [mut a, mut b, mut c, mut d] = *state;

    for step in 0..64 {
        let rotated = a
            .wrapping_add(round_function(step, b, c, d))
            .wrapping_add(K[step])
            .wrapping_add(m[word_index(step)])
            .rotate_left(SHIFTS[step]);
        a = d;
        d = c;
        c = b;
        b = b.wrapping_add(rotated);
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

impl BlockTransform for Md5 {
    fn transform(&self, state: &mut ChainingState, block: &[u8; BLOCK_SIZE]) {
        compress_words(state, &words_from_block(block));
    }
}

/// Formats a chaining state the way md5sum would print it if hashing stopped here.
pub fn state_hex(state: &ChainingState) -> String {
    state
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
