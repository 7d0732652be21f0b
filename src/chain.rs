//! Lays out N images behind one shared run of bytes so that every output hashes the same.
//!
//! For each image boundary a comment segment is opened whose body ends exactly where a pair of
//! colliding blocks starts. Both blocks carry `FF FE 00 xx` at offset 56, a second comment whose
//! length byte `xx` differs by 128 between the two variants:
//!
//! ```text
//! [COM][len][align][BLOCKS....][A pad][COM][jump][B pad][image i][next boundary or last image]
//!                        |                   |          ^
//!                        |  variant A -------+ skips -->| past image i
//!                        +- variant B ends here --------^ image i is decoded
//! ```
//!
//! A JPEG reader skips comment segments, so with variant A it lands on the jump comment and
//! carries on past image `i`, while variant B drops it straight into image `i`.

use log::{debug, info};

use crate::error::{Error, Result};
use crate::jpeg::{RawImage, COM, SOI};
use crate::md5_state::{state_hex, BlockTransform, ChainingState, BLOCK_SIZE, MD5_IV};
use crate::oracle::{CollisionBlock, CollisionBlockPair, CollisionOracle, COLLISION_BLOCK_SIZE};

/// Offset inside the collision blocks where the inner comment marker sits.
pub const COMMENT_OFFSET: usize = 56;

/// Inner comment marker plus the high byte of its length, which must be zero.
pub const COMMENT_PATTERN: [u8; 3] = [0xff, 0xfe, 0x00];

/// Difference between the inner comment lengths of the two variants.
pub const SIZE_DELTA: usize = COLLISION_BLOCK_SIZE;

/// The inner comment must at least reach the end of the collision blocks.
pub const MINIMUM_COMMENT_LENGTH: usize = COLLISION_BLOCK_SIZE - (COMMENT_OFFSET + 2);

/// Bytes between the start of the jump comment's length field and the end of variant B's comment.
const JUMP_HEADER: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Chaining state hashing starts from.
    pub iv: ChainingState,
    /// Bytes absorbed before the shared buffer; outputs are meant to be appended to them.
    pub prefix: Vec<u8>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            iv: MD5_IV,
            prefix: Vec::new(),
        }
    }
}

/// A validated collision pair and where it sits in the shared buffer.
///
/// `a` is always the variant with the shorter inner comment; the shared buffer holds `a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub position: usize,
    pub a: CollisionBlock,
    pub b: CollisionBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLayout {
    /// Bytes shared by every output, with every substitution holding its A variant.
    pub buffer: Vec<u8>,
    /// One per image boundary, in image order.
    pub substitutions: Vec<Substitution>,
}

/// Zero bytes needed after the outer comment's length field for the collision blocks to start
/// on a block boundary. `buffer_len` already counts the comment marker. Never zero: an already
/// aligned buffer gets a whole block.
pub fn align_bytes(prefix_len: usize, buffer_len: usize) -> usize {
    BLOCK_SIZE - (prefix_len + 2 + buffer_len) % BLOCK_SIZE
}

/// Length of the jump comment that carries variant A past `image_len` bytes of image.
///
/// Measured from the jump's own length field, which sits `size_a + 2` bytes into the inner
/// comment, to the end of the image that starts `size_b` bytes in. Only the image length
/// matters since `size_b - size_a` is fixed.
pub fn jump_size(image_len: usize) -> usize {
    SIZE_DELTA + image_len - JUMP_HEADER
}

fn read_comment_size(block: &CollisionBlock) -> u8 {
    block[COMMENT_OFFSET + 3]
}

fn has_comment_pattern(block: &CollisionBlock) -> bool {
    block[COMMENT_OFFSET..COMMENT_OFFSET + COMMENT_PATTERN.len()] == COMMENT_PATTERN
}

/// Checks an oracle result against `head` (prefix and buffer so far) and returns it with the
/// shorter comment first. On equal lengths the oracle's order is kept, which then fails the
/// size delta check.
pub fn validate_pair<T: BlockTransform>(
    transform: &T,
    iv: ChainingState,
    head: &[u8],
    pair: CollisionBlockPair,
) -> Result<CollisionBlockPair> {
    if !has_comment_pattern(&pair.a) || !has_comment_pattern(&pair.b) {
        return Err(Error::MissingCommentBlock);
    }

    let mut candidate = head.to_vec();
    candidate.extend_from_slice(&pair.a);
    let digest_a = transform.digest(iv, &candidate);
    candidate.truncate(head.len());
    candidate.extend_from_slice(&pair.b);
    let digest_b = transform.digest(iv, &candidate);
    if digest_a != digest_b {
        return Err(Error::DigestMismatch);
    }

    let pair = if read_comment_size(&pair.a) > read_comment_size(&pair.b) {
        CollisionBlockPair {
            a: pair.b,
            b: pair.a,
        }
    } else {
        pair
    };

    let size_a = read_comment_size(&pair.a);
    let size_b = read_comment_size(&pair.b);
    if (size_b - size_a) as usize != SIZE_DELTA {
        return Err(Error::WrongSizeDelta {
            a: size_a,
            b: size_b,
        });
    }

    if (size_a as usize) < MINIMUM_COMMENT_LENGTH {
        return Err(Error::CommentTooShort {
            size: size_a,
            minimum: MINIMUM_COMMENT_LENGTH as u8,
        });
    }

    Ok(pair)
}

pub struct ChainBuilder<'a, T, O> {
    config: &'a ChainConfig,
    transform: T,
    oracle: O,
}

impl<'a, T: BlockTransform, O: CollisionOracle> ChainBuilder<'a, T, O> {
    pub fn new(config: &'a ChainConfig, transform: T, oracle: O) -> Self {
        ChainBuilder {
            config,
            transform,
            oracle,
        }
    }

    /// Runs one collision search per image boundary. Boundaries are strictly sequential since
    /// each one starts from the state left by everything before it.
    pub fn build(&self, images: &[RawImage]) -> Result<ChainLayout> {
        if images.len() < 2 {
            return Err(Error::InsufficientImages(images.len()));
        }

        // Fail before any collision search rather than halfway through the chain.
        for (index, image) in images[..images.len() - 1].iter().enumerate() {
            let size = jump_size(image.len());
            if size > u16::MAX as usize {
                return Err(Error::JumpTooLong { image: index, size });
            }
        }

        let mut buffer = SOI.to_vec();
        let mut substitutions = Vec::with_capacity(images.len() - 1);

        for (index, image) in images[..images.len() - 1].iter().enumerate() {
            info!(
                "Chaining image {} of {} ({})",
                index + 1,
                images.len(),
                image.name
            );

            self.open_comment(&mut buffer);

            let mut head = self.config.prefix.clone();
            head.extend_from_slice(&buffer);
            let state = self.transform.absorb_buffer(self.config.iv, &head)?;
            debug!(
                "Collision search starts at offset {} from state {}",
                buffer.len(),
                state_hex(&state)
            );

            let pair = self.oracle.find_collision(state, None);
            let pair = validate_pair(&self.transform, self.config.iv, &head, pair)?;

            let substitution = Substitution {
                position: buffer.len(),
                a: pair.a,
                b: pair.b,
            };
            self.append_jump(&mut buffer, &substitution, image);
            substitutions.push(substitution);

            buffer.extend_from_slice(&image.bytes);
        }

        if let Some(last) = images.last() {
            buffer.extend_from_slice(&last.bytes);
        }

        info!(
            "Shared buffer is {} bytes with {} substitutions",
            buffer.len(),
            substitutions.len()
        );
        Ok(ChainLayout {
            buffer,
            substitutions,
        })
    }

    /// Writes the outer comment header and padding so the next byte starts a hash block.
    fn open_comment(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&COM);

        let align = align_bytes(self.config.prefix.len(), buffer.len());
        let comment_size = 2 + align + COMMENT_OFFSET;
        debug!(
            "Aligning with {} bytes, outer comment is {} bytes",
            align, comment_size
        );

        buffer.extend_from_slice(&(comment_size as u16).to_be_bytes());
        buffer.resize(buffer.len() + align, 0);
    }

    /// Appends variant A, the rest of its comment, the jump comment, and the padding that ends
    /// variant B's comment right where `image` starts.
    ///
    /// `build` has already checked that the jump length fits its 16-bit field.
    fn append_jump(&self, buffer: &mut Vec<u8>, substitution: &Substitution, image: &RawImage) {
        let size_a = read_comment_size(&substitution.a) as usize;
        let size_b = read_comment_size(&substitution.b) as usize;

        buffer.extend_from_slice(&substitution.a);
        buffer.resize(buffer.len() + (size_a - MINIMUM_COMMENT_LENGTH), 0);

        buffer.extend_from_slice(&COM);
        buffer.extend_from_slice(&(jump_size(image.len()) as u16).to_be_bytes());

        let start_of_jump = size_a + JUMP_HEADER;
        buffer.resize(buffer.len() + (size_b - (start_of_jump + 2)), 0);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::md5_state::tests::ByteSum;
    use std::cell::RefCell;

    /// Returns the same pair for every state, remembering which states it was asked about.
    pub struct FixedOracle {
        pub pair: CollisionBlockPair,
        pub states: RefCell<Vec<ChainingState>>,
    }

    impl FixedOracle {
        pub fn new(pair: CollisionBlockPair) -> Self {
            FixedOracle {
                pair,
                states: RefCell::new(Vec::new()),
            }
        }
    }

    impl CollisionOracle for FixedOracle {
        fn find_collision(
            &self,
            state: ChainingState,
            _forbidden: Option<&crate::oracle::ForbiddenBytes>,
        ) -> CollisionBlockPair {
            self.states.borrow_mut().push(state);
            self.pair
        }
    }

    /// A pair that collides under [`ByteSum`]: byte 10 compensates the comment length byte, both
    /// in the first 64-byte block.
    pub fn synthetic_pair(size_a: u8, size_b: u8) -> CollisionBlockPair {
        let mut a = [0x11u8; COLLISION_BLOCK_SIZE];
        a[COMMENT_OFFSET..COMMENT_OFFSET + 3].copy_from_slice(&COMMENT_PATTERN);
        let mut b = a;
        a[COMMENT_OFFSET + 3] = size_a;
        a[10] = size_b;
        b[COMMENT_OFFSET + 3] = size_b;
        b[10] = size_a;
        CollisionBlockPair { a, b }
    }

    pub fn image(name: &str, fill: u8, len: usize) -> RawImage {
        let mut bytes = vec![0xff, 0xe0];
        bytes.resize(len, fill);
        RawImage {
            name: name.to_string(),
            bytes,
        }
    }

    fn build(
        images: &[RawImage],
        config: &ChainConfig,
        pair: CollisionBlockPair,
    ) -> (Result<ChainLayout>, Vec<ChainingState>) {
        let oracle = FixedOracle::new(pair);
        let result = ChainBuilder::new(config, ByteSum, &oracle).build(images);
        let states = oracle.states.into_inner();
        (result, states)
    }

    #[test]
    fn two_small_images() {
        let images = [image("a.jpg", 0xaa, 10), image("b.jpg", 0xbb, 10)];
        let (layout, _) = build(&images, &ChainConfig::default(), synthetic_pair(80, 208));
        let layout = layout.unwrap();

        assert_eq!(layout.substitutions.len(), 1);
        let sub = &layout.substitutions[0];
        assert_eq!(sub.position, 64);
        assert_eq!(sub.position % BLOCK_SIZE, 0);

        let buf = &layout.buffer;
        assert_eq!(buf[..6], [0xff, 0xd8, 0xff, 0xfe, 0x00, 2 + 58 + 56]);
        assert!(buf[6..64].iter().all(|&b| b == 0));
        assert_eq!(buf[64..192], sub.a[..]);
        // variant A's comment runs from offset 122 for 80 bytes, then the jump
        assert!(buf[192..202].iter().all(|&b| b == 0));
        assert_eq!(buf[202..206], [0xff, 0xfe, 0x00, 136]);
        assert!(buf[206..330].iter().all(|&b| b == 0));
        // variant B's comment ends at 122 + 208
        assert_eq!(buf[330..340], images[0].bytes[..]);
        assert_eq!(buf[340..], images[1].bytes[..]);
    }

    #[test]
    fn collision_blocks_start_on_block_boundaries() {
        let images = [
            image("a.jpg", 1, 10),
            image("b.jpg", 2, 77),
            image("c.jpg", 3, 300),
            image("d.jpg", 4, 5),
        ];
        let config = ChainConfig::default();
        let (layout, states) = build(&images, &config, synthetic_pair(90, 218));
        let layout = layout.unwrap();

        assert_eq!(layout.substitutions.len(), 3);
        for (sub, state) in layout.substitutions.iter().zip(states.iter()) {
            assert_eq!(sub.position % BLOCK_SIZE, 0);
            assert_eq!(
                ByteSum
                    .absorb_buffer(config.iv, &layout.buffer[..sub.position])
                    .unwrap(),
                *state
            );
        }
    }

    #[test]
    fn prefix_shifts_alignment() {
        let images = [image("a.jpg", 1, 10), image("b.jpg", 2, 10)];
        let config = ChainConfig {
            iv: [1, 2, 3, 4],
            prefix: vec![0x42; 10],
        };
        let (layout, states) = build(&images, &config, synthetic_pair(80, 208));
        let layout = layout.unwrap();

        let position = layout.substitutions[0].position;
        assert_eq!((config.prefix.len() + position) % BLOCK_SIZE, 0);

        let mut head = config.prefix.clone();
        head.extend_from_slice(&layout.buffer[..position]);
        assert_eq!(states, vec![ByteSum.absorb_buffer(config.iv, &head).unwrap()]);
    }

    #[test]
    fn align_bytes_never_zero() {
        assert_eq!(align_bytes(0, 4), 58);
        assert_eq!(align_bytes(0, 62), 64);
        assert_eq!(align_bytes(10, 4), 48);
        for buffer_len in 0..200 {
            let align = align_bytes(3, buffer_len);
            assert!(align >= 1 && align <= BLOCK_SIZE);
            assert_eq!((3 + buffer_len + 2 + align) % BLOCK_SIZE, 0);
        }
    }

    #[test]
    fn same_inputs_same_layout() {
        let images = [
            image("a.jpg", 1, 40),
            image("b.jpg", 2, 50),
            image("c.jpg", 3, 60),
        ];
        let config = ChainConfig::default();
        let (first, _) = build(&images, &config, synthetic_pair(100, 228));
        let (second, _) = build(&images, &config, synthetic_pair(100, 228));
        assert_eq!(first.unwrap(), second.unwrap());
    }

    #[test]
    fn oracle_order_is_canonicalized() {
        let pair = synthetic_pair(80, 208);
        let swapped = CollisionBlockPair {
            a: pair.b,
            b: pair.a,
        };
        let images = [image("a.jpg", 1, 10), image("b.jpg", 2, 10)];
        let (layout, _) = build(&images, &ChainConfig::default(), swapped);
        let layout = layout.unwrap();
        assert_eq!(layout.substitutions[0].a, pair.a);
        assert_eq!(layout.substitutions[0].b, pair.b);
    }

    #[test]
    fn rejects_missing_comment_marker() {
        let images = [image("a.jpg", 1, 10), image("b.jpg", 2, 10)];
        for &broken in [56usize, 57, 58].iter() {
            let mut pair = synthetic_pair(80, 208);
            pair.b[broken] ^= 0x01;
            match build(&images, &ChainConfig::default(), pair).0 {
                Err(Error::MissingCommentBlock) => (),
                other => panic!("expected MissingCommentBlock, got {:?}", other),
            }
        }
    }

    #[test]
    fn rejects_digest_mismatch() {
        let images = [image("a.jpg", 1, 10), image("b.jpg", 2, 10)];
        let mut pair = synthetic_pair(80, 208);
        pair.b[100] = 0x12;
        match build(&images, &ChainConfig::default(), pair).0 {
            Err(Error::DigestMismatch) => (),
            other => panic!("expected DigestMismatch, got {:?}", other),
        }
    }

    #[test]
    fn size_delta_must_be_exactly_128() {
        let images = [image("a.jpg", 1, 10), image("b.jpg", 2, 10)];
        for &size_b in [207u8, 209].iter() {
            match build(&images, &ChainConfig::default(), synthetic_pair(80, size_b)).0 {
                Err(Error::WrongSizeDelta { a: 80, b }) => assert_eq!(b, size_b),
                other => panic!("expected WrongSizeDelta, got {:?}", other),
            }
        }
        assert!(build(&images, &ChainConfig::default(), synthetic_pair(80, 208))
            .0
            .is_ok());
    }

    #[test]
    fn equal_sizes_keep_oracle_order_and_fail() {
        let images = [image("a.jpg", 1, 10), image("b.jpg", 2, 10)];
        match build(&images, &ChainConfig::default(), synthetic_pair(100, 100)).0 {
            Err(Error::WrongSizeDelta { a: 100, b: 100 }) => (),
            other => panic!("expected WrongSizeDelta, got {:?}", other),
        }
    }

    #[test]
    fn comment_must_reach_end_of_blocks() {
        assert_eq!(MINIMUM_COMMENT_LENGTH, 70);
        let images = [image("a.jpg", 1, 10), image("b.jpg", 2, 10)];
        match build(&images, &ChainConfig::default(), synthetic_pair(69, 197)).0 {
            Err(Error::CommentTooShort { size: 69, minimum: 70 }) => (),
            other => panic!("expected CommentTooShort, got {:?}", other),
        }

        let layout = build(&images, &ChainConfig::default(), synthetic_pair(70, 198))
            .0
            .unwrap();
        let sub = &layout.substitutions[0];
        // no padding: the jump comment follows the blocks directly
        assert_eq!(
            layout.buffer[sub.position + 128..sub.position + 130],
            [0xff, 0xfe]
        );
    }

    #[test]
    fn needs_two_images() {
        match build(&[image("a.jpg", 1, 10)], &ChainConfig::default(), synthetic_pair(80, 208)).0 {
            Err(Error::InsufficientImages(1)) => (),
            other => panic!("expected InsufficientImages, got {:?}", other),
        }
    }

    #[test]
    fn oversized_image_fails_before_searching() {
        let largest = u16::MAX as usize - SIZE_DELTA + JUMP_HEADER;
        let images = [
            image("a.jpg", 1, largest),
            image("b.jpg", 2, largest + 1),
            image("c.jpg", 3, 10),
        ];
        let (result, states) = build(&images, &ChainConfig::default(), synthetic_pair(80, 208));
        match result {
            Err(Error::JumpTooLong { image: 1, size }) => assert_eq!(size, 65536),
            other => panic!("expected JumpTooLong, got {:?}", other),
        }
        assert!(states.is_empty());

        // the last image is never jumped over
        let images = [image("a.jpg", 1, largest), image("b.jpg", 2, largest + 1)];
        let layout = build(&images, &ChainConfig::default(), synthetic_pair(80, 208))
            .0
            .unwrap();
        let jump_at = layout.substitutions[0].position + 128 + 10 + 2;
        assert_eq!(layout.buffer[jump_at..jump_at + 2], [0xff, 0xff]);
    }
}
