//! Two-block MD5 identical-prefix collision search.
//!
//! Based on M. Stevens, "Fast Collision Attack on MD5" (https://eprint.iacr.org/2006/104), with
//! the four second-block differential paths from his MSc thesis. The first block is pinned so
//! that message word 14 spells a JPEG comment marker, which is what lets the chain builder hide
//! the differential inside a comment segment.
//!
//! Terminology follows the paper: `Q[t]` is the state word written by step `t` (1-based), with
//! `Q[-3..=0]` being the input chaining value. Conditions on `Q[t]` are tabulated per step as
//! `(mask, pmask, inv, cbits)`: random bits, bits copied from `Q[t-1]`, bits forced to one, and
//! bits checked.

use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::{CollisionBlock, CollisionBlockPair, CollisionOracle, ForbiddenBytes};
use crate::md5_state::{
    block_from_words, compress_words, round_function, word_index, ChainingState, K, SHIFTS,
};

const MSB: u32 = 0x8000_0000;

/// Bits of JPEG comment marker forced into message word 14 of the first block: `FF FE 00` and a
/// length byte with `0x50` set, so the smaller of the two comment lengths is at least 80.
const COMMENT_WORD: u32 = 0x5000_feff;
const COMMENT_WORD_KEEP: u32 = 0xff00_0000;

/// Message differences of the first block; the second block uses their negation.
const DIFF_WORDS: [(usize, u32); 3] = [(4, 1 << 31), (11, 1 << 15), (14, 1 << 31)];

/// Chaining value difference left after the first block.
const NEAR_COLLISION_DELTA: ChainingState = [0x8000_0000, 0x8200_0000, 0x8200_0000, 0x8200_0000];

#[derive(Clone, Copy)]
struct QCond {
    mask: u32,
    pmask: u32,
    inv: u32,
    cbits: u32,
}

const fn qc(mask: u32, pmask: u32, inv: u32, cbits: u32) -> QCond {
    QCond {
        mask,
        pmask,
        inv,
        cbits,
    }
}

const NONE: QCond = qc(0, 0, 0, 0);

const BLOCK0_CONDS: [QCond; 25] = [
    NONE,
    qc(0xffffffff, 0x00000000, 0x00000000, 0x00000000),
    qc(0xffffffff, 0x00000000, 0x00000000, 0x00000000),
    qc(0xfe87bc3f, 0x00000000, 0x017841c0, 0x017843c0),
    qc(0x44000033, 0x0287bc00, 0x000002c0, 0x83ffffc8),
    qc(0x00000000, 0x04000033, 0x41ffffc8, 0xffffffff),
    qc(0x00000000, 0x00000000, 0xb84b82d6, 0xffffffff),
    qc(0x68000084, 0x00000000, 0x02401b43, 0x97ffff7b),
    qc(0x2b8f6e04, 0x40000000, 0x405090d3, 0xd47091fb),
    qc(0x00000000, 0x40020000, 0x60040068, 0xf14690e9),
    qc(0x40000000, 0x00000000, 0x1040b089, 0xbfffff9f),
    qc(0x10408008, 0x40002000, 0x4fbb5f16, 0xefbf7ff7),
    qc(0x1ed9df7f, 0x40200000, 0x40222080, 0xe1262080),
    qc(0x5efb4f77, 0x00000000, 0x20049008, 0xa104b088),
    qc(0x1fff5f77, 0x40000000, 0x4000a088, 0xe000a088),
    qc(0x5efe7ff7, 0x00010000, 0x80018000, 0xa1018008),
    qc(0x1ffdffff, 0x40020000, 0xe0020000, 0xe0020000),
    qc(0x3ffd7ff7, 0x40008008, 0xc0000000, 0xc0028008),
    qc(0x5ffdffff, 0x20000000, 0x80020000, 0xa0020000),
    qc(0x7ffdffff, 0x00000000, 0x80000000, 0x80020000),
    qc(0x7ffbffff, 0x00040000, 0x80040000, 0x80040000),
    qc(0x7ffdffff, 0x00020000, 0x80000000, 0x80020000),
    qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
    qc(0x7fffffff, 0x00000000, 0x00000000, 0x80000000),
    qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
];

/// Second-block conditions, indexed by path (bits 0 and 5 of the intermediate state's B word).
const BLOCK1_CONDS: [[QCond; 25]; 4] = [
    [
        NONE,
        qc(0x7dfdf7be, 0x80000000, 0x00020800, 0x82020841),
        qc(0x49a0e73e, 0x80000000, 0x201f0080, 0xb65f18c1),
        qc(0x0000040c, 0x8000e000, 0x3dcc1230, 0xfffffbf3),
        qc(0x00000004, 0x80000008, 0x93af7963, 0xfffffffb),
        qc(0x00000004, 0x00000000, 0xbc429940, 0xfffffffb),
        qc(0x00001044, 0x00000000, 0x22576eb9, 0xffffefbb),
        qc(0x00200806, 0x00000000, 0xbd0430b0, 0xffdff7f9),
        qc(0x60050110, 0x00000004, 0x09581e2a, 0x9ffafeef),
        qc(0x40044000, 0x00000000, 0xb9c20041, 0xbbca92ed),
        qc(0x00000000, 0x00044000, 0xf28aa209, 0xf7ffffdf),
        qc(0x12888008, 0x00012000, 0xa4754f57, 0xed777ff7),
        qc(0x1ed98d7f, 0x00200000, 0x41221200, 0xe1267280),
        qc(0x0efb1d77, 0x00000000, 0x3100c008, 0xf104e288),
        qc(0x0fff5d77, 0x00000000, 0x2000a288, 0xf000a288),
        qc(0x0efe7ff7, 0x00010000, 0xe0010008, 0xf1018008),
        qc(0x0ffdffff, 0x00020000, 0x50020000, 0xf0020000),
        qc(0x7ffd7ff7, 0x00008008, 0x80000000, 0x80028008),
        qc(0x5ffdffff, 0x20000000, 0x00020000, 0xa0020000),
        qc(0x7ffdffff, 0x00000000, 0x00020000, 0x80020000),
        qc(0x7ffbffff, 0x00040000, 0x00040000, 0x80040000),
        qc(0x7ffdffff, 0x00020000, 0x00000000, 0x80020000),
        qc(0x7fffffff, 0x00000000, 0x00000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x00000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
    ],
    [
        NONE,
        qc(0x7dfff39e, 0x80000020, 0x00000020, 0x82000c61),
        qc(0x4db0e03e, 0x80000000, 0x30460400, 0xb24f1fc1),
        qc(0x0c000008, 0x80800002, 0x103c32b0, 0xf3fffff7),
        qc(0x00000000, 0x88000000, 0xd157efd1, 0xffffffff),
        qc(0x82000000, 0x00000000, 0x151900ab, 0x7dffffff),
        qc(0x80000000, 0x00000000, 0x3347f06f, 0x7fffffff),
        qc(0x00010130, 0x00000000, 0x79ea9e46, 0xfffefecf),
        qc(0x40200800, 0x00000000, 0xa548136d, 0xbfdff7ff),
        qc(0x00044000, 0x00000000, 0x394002f1, 0x3bca92fd),
        qc(0x00000000, 0x00044000, 0xb288a208, 0xf7ffffcf),
        qc(0x12808008, 0x00012000, 0xe4754f47, 0xed7f7ff7),
        qc(0x1ef18d7f, 0x00000000, 0x810a1200, 0xe10e7280),
        qc(0x1efb1d77, 0x00000000, 0x6104c008, 0xe104e288),
        qc(0x1fff5d77, 0x00000000, 0xe000a288, 0xe000a288),
        qc(0x1efe7ff7, 0x00010000, 0xa0010008, 0xe1018008),
        qc(0x1ffdffff, 0x00020000, 0x80020000, 0xe0020000),
        qc(0x7ffd7ff7, 0x00008008, 0x00000000, 0x80028008),
        qc(0x5ffdffff, 0x20000000, 0x80020000, 0xa0020000),
        qc(0x7ffdffff, 0x00000000, 0x80020000, 0x80020000),
        qc(0x7ffbffff, 0x00040000, 0x80040000, 0x80040000),
        qc(0x7ffdffff, 0x00020000, 0x80000000, 0x80020000),
        qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x00000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
    ],
    [
        NONE,
        qc(0x7dfdf6be, 0x80000000, 0x00000940, 0x82020941),
        qc(0x79b0c6ba, 0x80000000, 0x004c3800, 0x864f3945),
        qc(0x19300210, 0x80000082, 0x2401012c, 0xe6cffdef),
        qc(0x10300000, 0x01000030, 0x6287dacb, 0xefcfffff),
        qc(0x10000000, 0x00300000, 0x0289955c, 0xefffffff),
        qc(0x00000000, 0x00000000, 0x919b0066, 0xffffffff),
        qc(0x20444000, 0x00000000, 0x41091e65, 0xdfbbbfff),
        qc(0x09040000, 0x00000000, 0xa0d81e79, 0xf6fbffff),
        qc(0x00050000, 0x00000000, 0x508851c1, 0xdb8ad9d5),
        qc(0x00010080, 0x00040000, 0x028aeb11, 0xf7feff7b),
        qc(0x128b8110, 0x20002280, 0x2474446b, 0xed747eef),
        qc(0x3ef38d7f, 0x00080000, 0x81081200, 0xc10c7280),
        qc(0x3efb1d77, 0x00000000, 0x8104c008, 0xc104e288),
        qc(0x5fff5d77, 0x00000000, 0x0000a288, 0xa000a288),
        qc(0x1efe7ff7, 0x00010000, 0xe0010008, 0xe1018008),
        qc(0x5ffdffff, 0x00020000, 0x80020000, 0xa0020000),
        qc(0x7ffd7ff7, 0x00008008, 0x00000000, 0x80028008),
        qc(0x5ffdffff, 0x20000000, 0x80020000, 0xa0020000),
        qc(0x7ffdffff, 0x00000000, 0x80020000, 0x80020000),
        qc(0x7ffbffff, 0x00040000, 0x80040000, 0x80040000),
        qc(0x7ffdffff, 0x00020000, 0x80000000, 0x80020000),
        qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x00000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
    ],
    [
        NONE,
        qc(0x7dfff79e, 0x80000020, 0x00000860, 0x82000861),
        qc(0x75bef63e, 0x80000000, 0x08410000, 0x8a4109c1),
        qc(0x10345614, 0x84000002, 0x0002a1a0, 0xefcba9eb),
        qc(0x00145400, 0x00000014, 0x660aa0ca, 0xffebabff),
        qc(0x80000000, 0x00145400, 0x1423a220, 0x7fffffff),
        qc(0x00000000, 0x80000000, 0x89d40058, 0xffffffff),
        qc(0x40000880, 0x00000000, 0x394bd45b, 0xbffff77f),
        qc(0x00002090, 0x00000000, 0xa1d85c09, 0xffffdf6f),
        qc(0x00044000, 0x00000000, 0x7a803161, 0x7b8ab16d),
        qc(0x00002000, 0x00044000, 0xf28a82c9, 0xf7ffdfdf),
        qc(0x128a8108, 0x00012280, 0x84754c57, 0xed757ef7),
        qc(0x9edb8d7f, 0x00200000, 0x21201200, 0x61247280),
        qc(0x3efb1d77, 0x80000000, 0x4104c008, 0xc104e288),
        qc(0x1fff5d77, 0x00000000, 0x8000a288, 0xe000a288),
        qc(0x1efe7ff7, 0x00010000, 0x20010008, 0xe1018008),
        qc(0x1ffdffff, 0x40020000, 0xc0020000, 0xe0020000),
        qc(0x3ffd7ff7, 0x40008008, 0xc0000000, 0xc0028008),
        qc(0x5ffdffff, 0x20000000, 0x00020000, 0xa0020000),
        qc(0x7ffdffff, 0x00000000, 0x00020000, 0x80020000),
        qc(0x7ffbffff, 0x00040000, 0x00040000, 0x80040000),
        qc(0x7ffdffff, 0x00020000, 0x00000000, 0x80020000),
        qc(0x7fffffff, 0x00000000, 0x00000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x00000000, 0x80000000),
        qc(0x7fffffff, 0x00000000, 0x80000000, 0x80000000),
    ],
];

/// Q[9] bits freely changeable through message word 9 in the first block.
const BLOCK0_Q9_TUNNEL: u32 = 0x0eb9_4f16;

/// Per-path Q[9] -> m[9] tunnel for the second block.
const BLOCK1_Q9_TUNNELS: [u32; 4] = [0x04310d12, 0x44310d02, 0x2470042a, 0x04710c12];

/// Per-path combined Q[9]/Q[10] -> m[10] tunnel for the second block.
const BLOCK1_Q9Q10_TUNNELS: [u32; 4] = [0x08002020, 0x88002030, 0x08002204, 0x880002a0];

/// Part of a [`BLOCK1_Q9Q10_TUNNELS`] mask that lives in Q[10].
const Q10_PART: u32 = 0x0800_0034;

/// `Q[-3..=24]` addressed by paper step number.
#[derive(Clone)]
struct Q([u32; 28]);

impl Q {
    fn new(iv: ChainingState) -> Self {
        let mut q = Q([0; 28]);
        q[-3] = iv[0];
        q[-2] = iv[3];
        q[-1] = iv[2];
        q[0] = iv[1];
        q
    }

    /// Draws Q[t] at random within its conditions, taking copied bits from `Q[prev]`.
    fn draw(&mut self, t: i32, prev: i32, cond: &QCond, rng: &mut StdRng) {
        self[t] = ((rng.gen::<u32>() & cond.mask) | (self[prev] & cond.pmask)) ^ cond.inv;
    }

    fn violates(&self, t: i32, cond: &QCond) -> bool {
        ((self[t] & cond.cbits) ^ (self[t - 1] & cond.pmask)) != cond.inv
    }

    /// Recomputes Q[t + 1] from Q[t - 3..=t] and message word `m` (0-based step `t`).
    fn step(&mut self, t: i32, m: u32) {
        let i = t as usize;
        let sum = self[t - 3]
            .wrapping_add(round_function(i, self[t], self[t - 1], self[t - 2]))
            .wrapping_add(K[i])
            .wrapping_add(m);
        self[t + 1] = self[t].wrapping_add(sum.rotate_left(SHIFTS[i]));
    }

    /// The message word that makes 0-based step `t` produce the current Q[t + 1].
    fn unstep(&self, t: i32) -> u32 {
        let i = t as usize;
        self[t + 1]
            .wrapping_sub(self[t])
            .rotate_right(SHIFTS[i])
            .wrapping_sub(round_function(i, self[t], self[t - 1], self[t - 2]))
            .wrapping_sub(K[i])
            .wrapping_sub(self[t - 3])
    }
}

impl Index<i32> for Q {
    type Output = u32;

    fn index(&self, t: i32) -> &u32 {
        &self.0[(t + 3) as usize]
    }
}

impl IndexMut<i32> for Q {
    fn index_mut(&mut self, t: i32) -> &mut u32 {
        &mut self.0[(t + 3) as usize]
    }
}

/// Distributes the low bits of `index` over the set bits of `mask`, lowest first.
fn spread_bits(index: u32, mask: u32) -> u32 {
    let mut bits = 0;
    let mut remaining = mask;
    let mut index = index;
    while remaining != 0 && index != 0 {
        let lowest = remaining & remaining.wrapping_neg();
        if index & 1 != 0 {
            bits |= lowest;
        }
        index >>= 1;
        remaining &= remaining - 1;
    }
    bits
}

/// Steps 25..=64 starting from Q[21..=24], checking the sufficient conditions of rounds three and
/// four on the way. `step35_carry` is the required value of bit 15 of step 35's sum before
/// rotation, which differs between the two blocks. Returns the final `[a, b, c, d]` registers.
fn finish_steps(
    q21: u32,
    q22: u32,
    q23: u32,
    q24: u32,
    m: &[u32; 16],
    step35_carry: bool,
) -> Option<ChainingState> {
    // window[k] = Q[t - 3 + k] for the step t being computed next
    let mut window = [q21, q22, q23, q24];

    for i in 24..64 {
        let [older, prev2, prev, last] = window;
        let sum = older
            .wrapping_add(round_function(i, last, prev, prev2))
            .wrapping_add(K[i])
            .wrapping_add(m[word_index(i)]);
        if i == 34 && ((sum & (1 << 15)) != 0) != step35_carry {
            return None;
        }
        let next = last.wrapping_add(sum.rotate_left(SHIFTS[i]));

        let t = i + 1;
        if (48..64).contains(&t) {
            let msb_differs = (next ^ prev) & MSB != 0;
            if msb_differs != (t == 50 || t == 60) {
                return None;
            }
        }
        window = [prev2, prev, last, next];
    }

    let [q61, q62, q63, q64] = window;
    Some([q61, q64, q63, q62])
}

fn apply_difference(words: &[u32; 16], negate: bool) -> [u32; 16] {
    let mut out = *words;
    for &(index, delta) in DIFF_WORDS.iter() {
        out[index] = if negate {
            out[index].wrapping_sub(delta)
        } else {
            out[index].wrapping_add(delta)
        };
    }
    out
}

fn add_states(a: &ChainingState, b: &ChainingState) -> ChainingState {
    [
        a[0].wrapping_add(b[0]),
        a[1].wrapping_add(b[1]),
        a[2].wrapping_add(b[2]),
        a[3].wrapping_add(b[3]),
    ]
}

/// Finds the first near-collision block from `iv`, or `None` once `stop` is raised.
pub(crate) fn search_block0(
    iv: ChainingState,
    forbidden: Option<&ForbiddenBytes>,
    rng: &mut StdRng,
    stop: &AtomicBool,
) -> Option<[u32; 16]> {
    let bad = |word: u32| forbidden.map_or(false, |f| f.hits_word(word));
    let conds = &BLOCK0_CONDS;
    let mut q = Q::new(iv);
    let mut m = [0u32; 16];

    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }

        for t in 1..17 {
            q.draw(t, t - 1, &conds[t as usize], rng);
        }
        m[0] = q.unstep(0);
        if bad(m[0]) {
            continue;
        }
        m[6] = q.unstep(6);
        if bad(m[6]) {
            continue;
        }
        m[11] = q.unstep(11);
        if bad(m[11]) || bad(m[11].wrapping_add(1 << 15)) {
            continue;
        }

        m[14] = (q.unstep(14) & COMMENT_WORD_KEEP) | COMMENT_WORD;
        q.step(14, m[14]);
        if q.violates(15, &conds[15]) {
            continue;
        }

        m[15] = q.unstep(15);
        if bad(m[15]) {
            continue;
        }

        // Q[17] is free; Q[18..=21] follow from it. Settles m[1], m[2], m[5].
        let mut found = false;
        for _ in 0..100 {
            q[17] = ((rng.gen::<u32>() & 0x3ffd7ff7) | (q[16] & 0x40008008)) ^ 0xc0000000;

            q.step(17, m[6]);
            if q.violates(18, &conds[18]) {
                continue;
            }
            q.step(18, m[11]);
            if q.violates(19, &conds[19]) {
                continue;
            }
            q.step(19, m[0]);
            if q.violates(20, &conds[20]) {
                continue;
            }

            m[1] = q.unstep(16);
            q.step(1, m[1]);
            if bad(m[1]) {
                continue;
            }

            m[5] = q.unstep(5);
            q.step(20, m[5]);
            if q.violates(21, &conds[21]) || bad(m[5]) {
                continue;
            }

            m[2] = q.unstep(2);
            if bad(m[2]) {
                continue;
            }
            found = true;
            break;
        }
        if !found {
            continue;
        }

        // 3-bit Q[9]/Q[10] tunnel through m[10] for the conditions on Q[22], Q[23].
        for q10ctr in 0..8u32 {
            q[9] = (q[9] & !0x0000_2000) | ((q10ctr << 13) & 0x0000_2000);
            q[10] = (q[10] & !0x0000_0060) | ((q10ctr << 4) & 0x0000_0060);

            m[10] = q.unstep(10);
            if bad(m[10]) {
                continue;
            }
            m[13] = q.unstep(13);
            if bad(m[13]) {
                continue;
            }

            q.step(21, m[10]);
            if q[22] & MSB == 0 {
                continue;
            }
            let step23 = q[19]
                .wrapping_add(round_function(22, q[22], q[21], q[20]))
                .wrapping_add(m[15])
                .wrapping_add(K[22]);
            q.step(22, m[15]);
            if q[23] & MSB != 0 || step23 & (1 << 17) != 0 {
                continue;
            }

            let part8 = round_function(0, q[8], q[7], q[6])
                .wrapping_add(K[8])
                .wrapping_add(q[5]);
            let part9 = K[9].wrapping_add(q[6]);
            let part12 = q[13]
                .wrapping_sub(q[12])
                .rotate_right(7)
                .wrapping_sub(round_function(0, q[12], q[11], q[10]))
                .wrapping_sub(K[12]);
            let q9base = q[9] & !BLOCK0_Q9_TUNNEL;

            // 4-bit Q[4] tunnel through m[4] (needs Q[5] bit clear and Q[6] bit set).
            for q4ctr in 0..16u32 {
                if stop.load(Ordering::Relaxed) {
                    return None;
                }

                q[4] = (q[4] & !0x3800_0004) | (((q4ctr << 2) | (q4ctr << 26)) & 0x3800_0004);

                m[3] = q.unstep(3);
                if bad(m[3]) {
                    continue;
                }
                m[4] = q.unstep(4);
                if bad(m[4]) || bad(m[4].wrapping_add(1 << 31)) {
                    continue;
                }
                m[7] = q.unstep(7);
                if bad(m[7]) {
                    continue;
                }

                q.step(23, m[4]);
                if q[24] & MSB == 0 {
                    continue;
                }

                // 16-bit Q[9] tunnel through m[9]; nearly all of the time goes here.
                for q9ctr in 0..(1u32 << 16) {
                    q[9] = q9base | ((q9ctr ^ (q9ctr << 8) ^ (q9ctr << 14)) & BLOCK0_Q9_TUNNEL);

                    m[8] = q[9].wrapping_sub(q[8]).rotate_right(7).wrapping_sub(part8);
                    if bad(m[8]) {
                        continue;
                    }
                    m[9] = q[10]
                        .wrapping_sub(q[9])
                        .rotate_right(12)
                        .wrapping_sub(round_function(0, q[9], q[8], q[7]))
                        .wrapping_sub(part9);
                    if bad(m[9]) {
                        continue;
                    }
                    m[12] = part12.wrapping_sub(q[9]);
                    if bad(m[12]) {
                        continue;
                    }

                    let out = match finish_steps(q[21], q[22], q[23], q[24], &m, false) {
                        Some(out) => out,
                        None => continue,
                    };

                    let iv1 = iv[1].wrapping_add(out[1]);
                    let iv2 = iv[2].wrapping_add(out[2]);
                    let iv3 = iv[3].wrapping_add(out[3]);
                    if iv1 & 0x0200_0000 != 0
                        || (iv2 ^ iv1) & 0x8200_0000 != 0
                        || (iv3 ^ iv2) & 0x8200_0000 != 0
                        || (iv2 ^ iv1) & 1 != 0
                    {
                        continue;
                    }

                    let mut state_a = iv;
                    let mut state_b = iv;
                    compress_words(&mut state_a, &m);
                    compress_words(&mut state_b, &apply_difference(&m, false));
                    if state_b == add_states(&state_a, &NEAR_COLLISION_DELTA) {
                        return Some(m);
                    }
                }
            }
        }
    }
}

/// Finds the second block from the intermediate state `iv` reached by the first block's A
/// variant, or `None` once `stop` is raised.
pub(crate) fn search_block1(
    iv: ChainingState,
    forbidden: Option<&ForbiddenBytes>,
    rng: &mut StdRng,
    stop: &AtomicBool,
) -> Option<[u32; 16]> {
    let bad = |word: u32| forbidden.map_or(false, |f| f.hits_word(word));
    let path = ((iv[1] & 1) | ((iv[1] >> 5) & 2)) as usize;
    let conds = &BLOCK1_CONDS[path];
    debug!("second block uses differential path ({},{})", path >> 1, path & 1);

    let q9_bits: Vec<u32> = (0..1 << 9)
        .map(|i| spread_bits(i, BLOCK1_Q9_TUNNELS[path]))
        .collect();
    let q9q10_tunnel = BLOCK1_Q9Q10_TUNNELS[path];
    let q9q10_bits: Vec<u32> = (0..1u32 << q9q10_tunnel.count_ones())
        .map(|i| spread_bits(i, q9q10_tunnel))
        .collect();

    let mut q = Q::new(iv);
    let mut m = [0u32; 16];

    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }

        // Q[1] isn't known yet, so Q[2] copies its bits from Q[0].
        q.draw(2, 0, &conds[2], rng);
        for t in 3..17 {
            q.draw(t, t - 1, &conds[t as usize], rng);
        }
        m[5] = q.unstep(5);
        if bad(m[5]) {
            continue;
        }
        m[6] = q.unstep(6);
        if bad(m[6]) {
            continue;
        }
        m[7] = q.unstep(7);
        if bad(m[7]) {
            continue;
        }
        m[11] = q.unstep(11);
        if bad(m[11]) || bad(m[11].wrapping_sub(1 << 15)) {
            continue;
        }
        m[14] = q.unstep(14);
        if bad(m[14]) || bad(m[14].wrapping_sub(1 << 31)) {
            continue;
        }
        m[15] = q.unstep(15);
        if bad(m[15]) {
            continue;
        }

        let mut found = false;
        for _ in 0..2000 {
            q.draw(1, 0, &conds[1], rng);
            m[0] = q.unstep(0);
            if bad(m[0]) {
                continue;
            }
            m[1] = q.unstep(1);
            if bad(m[1]) {
                continue;
            }
            m[3] = q.unstep(3);
            if bad(m[3]) {
                continue;
            }
            m[4] = q.unstep(4);
            if bad(m[4]) || bad(m[4].wrapping_sub(1 << 31)) {
                continue;
            }

            q.step(16, m[1]);
            if q.violates(17, &conds[17]) {
                continue;
            }
            q.step(17, m[6]);
            if q.violates(18, &conds[18]) {
                continue;
            }
            q.step(18, m[11]);
            if q.violates(19, &conds[19]) {
                continue;
            }
            q.step(19, m[0]);
            if q.violates(20, &conds[20]) {
                continue;
            }
            q.step(20, m[5]);
            if q.violates(21, &conds[21]) {
                continue;
            }

            m[2] = q.unstep(2);
            if bad(m[2]) {
                continue;
            }
            found = true;
            break;
        }
        if !found {
            continue;
        }

        let q9base = q[9];
        let q10base = q[10];
        for &bits in q9q10_bits.iter() {
            q[9] = q9base | (bits & !Q10_PART);
            q[10] = q10base | (bits & Q10_PART);
            let q9save = q[9];

            m[10] = q.unstep(10);
            if bad(m[10]) {
                continue;
            }

            q.step(21, m[10]);
            if q[22] & MSB != conds[22].inv {
                continue;
            }
            let step23 = q[19]
                .wrapping_add(round_function(22, q[22], q[21], q[20]))
                .wrapping_add(m[15])
                .wrapping_add(K[22]);
            if step23 & (1 << 17) == 0 {
                continue;
            }
            q.step(22, m[15]);
            if q[23] & MSB != conds[23].inv {
                continue;
            }
            q.step(23, m[4]);
            if q[24] & MSB == 0 {
                continue;
            }

            m[13] = q.unstep(13);
            if bad(m[13]) {
                continue;
            }

            for &tunnel in q9_bits.iter() {
                q[9] = q9save | tunnel;

                m[8] = q.unstep(8);
                if bad(m[8]) {
                    continue;
                }
                m[9] = q.unstep(9);
                if bad(m[9]) {
                    continue;
                }
                m[12] = q.unstep(12);
                if bad(m[12]) {
                    continue;
                }

                if finish_steps(q[21], q[22], q[23], q[24], &m, true).is_none() {
                    continue;
                }

                let mut state_a = iv;
                let mut state_b = add_states(&iv, &NEAR_COLLISION_DELTA);
                compress_words(&mut state_a, &m);
                compress_words(&mut state_b, &apply_difference(&m, true));
                if state_a == state_b {
                    return Some(m);
                }
            }
        }
    }
}

/// Packs both blocks and derives the B variant by applying the differential.
pub(crate) fn assemble_pair(block0: &[u32; 16], block1: &[u32; 16]) -> CollisionBlockPair {
    let mut a: CollisionBlock = [0; 128];
    let mut b: CollisionBlock = [0; 128];
    a[..64].copy_from_slice(&block_from_words(block0));
    a[64..].copy_from_slice(&block_from_words(block1));
    b[..64].copy_from_slice(&block_from_words(&apply_difference(block0, false)));
    b[64..].copy_from_slice(&block_from_words(&apply_difference(block1, true)));
    CollisionBlockPair { a, b }
}

/// Runs the search on every rayon worker at once; the first block found wins.
#[derive(Debug, Clone)]
pub struct StevensOracle {
    workers: usize,
    seed: Option<u64>,
}

impl StevensOracle {
    pub fn new(workers: usize, seed: Option<u64>) -> Self {
        StevensOracle {
            workers: workers.max(1),
            seed,
        }
    }

    /// A reproducible stream per worker and search when seeded, fresh entropy otherwise.
    fn worker_rng(&self, state: &ChainingState, salt: u64, worker: usize) -> StdRng {
        match self.seed {
            Some(seed) => {
                let state_mix = state
                    .iter()
                    .fold(0u64, |acc, &word| acc.rotate_left(17) ^ word as u64);
                StdRng::seed_from_u64(
                    seed ^ salt ^ state_mix ^ (worker as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
                )
            }
            None => StdRng::from_entropy(),
        }
    }

    fn race<F>(&self, state: &ChainingState, salt: u64, search: F) -> [u32; 16]
    where
        F: Fn(&mut StdRng, &AtomicBool) -> Option<[u32; 16]> + Sync,
    {
        loop {
            let stop = AtomicBool::new(false);
            let found = (0..self.workers).into_par_iter().find_map_any(|worker| {
                let mut rng = self.worker_rng(state, salt, worker);
                let found = search(&mut rng, &stop);
                stop.store(true, Ordering::Relaxed);
                found
            });

            if let Some(block) = found {
                return block;
            }
        }
    }
}

impl CollisionOracle for StevensOracle {
    fn find_collision(
        &self,
        state: ChainingState,
        forbidden: Option<&ForbiddenBytes>,
    ) -> CollisionBlockPair {
        let start = Instant::now();
        info!("Searching for a collision from state {:08x?} on {} workers", state, self.workers);

        let block0 = self.race(&state, 0xfeed_face, |rng, stop| {
            search_block0(state, forbidden, rng, stop)
        });
        info!("Found first block after {:.1} s", start.elapsed().as_secs_f32());

        let mut middle = state;
        compress_words(&mut middle, &block0);
        let block1 = self.race(&middle, 0xdead_f00d, |rng, stop| {
            search_block1(middle, forbidden, rng, stop)
        });
        info!("Found second block after {:.1} s", start.elapsed().as_secs_f32());

        assemble_pair(&block0, &block1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md5_state::{BlockTransform, Md5, MD5_IV};

    #[test]
    fn unstep_inverts_step() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut q = Q::new(MD5_IV);
        for t in 1..17 {
            q[t] = rng.gen::<u32>();
        }
        for t in 0..16 {
            let m = q.unstep(t);
            let expected = q[t + 1];
            q.step(t, m);
            assert_eq!(q[t + 1], expected);
        }
    }

    #[test]
    fn unstepped_words_reproduce_the_state_sequence() {
        // Message words recovered from Q[1..=16] must make the real compression function walk
        // through exactly those states.
        let mut rng = StdRng::seed_from_u64(99);
        let mut q = Q::new(MD5_IV);
        for t in 1..17 {
            q[t] = rng.gen::<u32>();
        }
        let mut m = [0u32; 16];
        for t in 0..16 {
            m[t as usize] = q.unstep(t);
        }

        let mut replay = Q::new(MD5_IV);
        for t in 0..16 {
            replay.step(t, m[t as usize]);
        }
        assert_eq!(&replay.0[..20], &q.0[..20]);
    }

    #[test]
    fn spread_bits_fills_mask_from_the_bottom() {
        assert_eq!(spread_bits(0, 0b1011_0000), 0);
        assert_eq!(spread_bits(0b001, 0b1011_0000), 0b0001_0000);
        assert_eq!(spread_bits(0b010, 0b1011_0000), 0b0010_0000);
        assert_eq!(spread_bits(0b111, 0b1011_0000), 0b1011_0000);

        for (&mask, expected) in BLOCK1_Q9Q10_TUNNELS.iter().zip([8, 32, 16, 32].iter()) {
            assert_eq!(1u32 << mask.count_ones(), *expected);
            assert_eq!(spread_bits(u32::MAX, mask), mask);
        }
        for &mask in BLOCK1_Q9_TUNNELS.iter() {
            assert_eq!(mask.count_ones(), 9);
        }
    }

    #[test]
    fn seeded_workers_draw_reproducible_streams() {
        let draw = |oracle: &StevensOracle, salt: u64, worker: usize| -> Vec<u32> {
            let mut rng = oracle.worker_rng(&MD5_IV, salt, worker);
            (0..4).map(|_| rng.gen()).collect()
        };
        let seeded = StevensOracle::new(2, Some(42));
        assert_eq!(draw(&seeded, 1, 0), draw(&seeded, 1, 0));
        assert_ne!(draw(&seeded, 1, 0), draw(&seeded, 1, 1));
        assert_ne!(draw(&seeded, 1, 0), draw(&seeded, 2, 0));
        assert_ne!(
            draw(&seeded, 1, 0),
            draw(&StevensOracle::new(2, Some(43)), 1, 0)
        );

        let unseeded = StevensOracle::new(2, None);
        assert_ne!(draw(&unseeded, 1, 0), draw(&unseeded, 1, 0));
    }

    #[test]
    fn assembled_pair_carries_the_differential() {
        let block0: [u32; 16] = [1; 16];
        let block1: [u32; 16] = [0x8000_8000; 16];
        let pair = assemble_pair(&block0, &block1);

        let differing: Vec<usize> = (0..128).filter(|&i| pair.a[i] != pair.b[i]).collect();
        // top byte of words 4 and 14, byte 1 of word 11, in both halves
        assert_eq!(differing, vec![19, 45, 59, 64 + 19, 64 + 45, 64 + 59]);
    }

    #[test]
    fn stopped_search_gives_up() {
        let stop = AtomicBool::new(true);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(search_block0(MD5_IV, None, &mut rng, &stop).is_none());
        assert!(search_block1(MD5_IV, None, &mut rng, &stop).is_none());
    }

    #[test]
    #[ignore = "full collision search, takes minutes without optimizations"]
    fn finds_a_real_comment_collision() {
        let oracle = StevensOracle::new(num_cpus::get(), Some(1));
        let pair = oracle.find_collision(MD5_IV, None);

        assert_ne!(pair.a[..], pair.b[..]);
        assert_eq!(pair.a[56..59], [0xff, 0xfe, 0x00]);
        assert_eq!(pair.b[56..59], [0xff, 0xfe, 0x00]);
        assert_eq!((pair.a[59] as i32 - pair.b[59] as i32).abs(), 128);
        assert_eq!(
            Md5.absorb_buffer(MD5_IV, &pair.a).unwrap(),
            Md5.absorb_buffer(MD5_IV, &pair.b).unwrap()
        );
    }
}
