//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::Error;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;
pub const MAX_DISTANCE: u8 = ID_BITS as u8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id (KUID) or a lookup target.
///
/// Only the XOR metric is meaningful between Ids, the derived [Ord] is the
/// big-endian numeric order which is used to partition the key space into
/// contiguous buckets.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The all-zeros Id.
    pub const MIN: Id = Id([0; ID_SIZE]);
    /// The all-ones Id.
    pub const MAX: Id = Id([u8::MAX; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, Error> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// SHA-1 digest of some bytes, useful to derive primary keys from content.
    pub fn hash<T: AsRef<[u8]>>(bytes: T) -> Id {
        Id(sha1_smol::Sha1::from(bytes).digest().bytes())
    }

    /// Random Id sharing the first `depth` bits with `prefix`.
    pub fn random_with_prefix(prefix: &Id, depth: usize) -> Id {
        let mut id = Id::random();
        let depth = depth.min(ID_BITS);

        let full_bytes = depth / 8;
        id.0[..full_bytes].copy_from_slice(&prefix.0[..full_bytes]);

        let remaining_bits = depth % 8;
        if remaining_bits > 0 {
            let mask = u8::MAX << (8 - remaining_bits);
            id.0[full_bytes] = (prefix.0[full_bytes] & mask) | (id.0[full_bytes] & !mask);
        }

        id
    }

    /// XOR distance between this Id and another as an Id.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Same as [Self::xor], Kademlia's distance metric.
    pub fn distance(&self, other: &Id) -> Id {
        self.xor(other)
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn log_distance(&self, other: &Id) -> u8 {
        MAX_DISTANCE - self.xor(other).leading_zeros() as u8
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Returns `true` if `self` is strictly closer to `target` than `other` is.
    pub fn is_closer_than(&self, other: &Id, target: &Id) -> bool {
        self.xor(target) < other.xor(target)
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        if index >= ID_BITS {
            return false;
        }

        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy with the bit at `index` set to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Id {
        let mut id = *self;

        if index < ID_BITS {
            let mask = 0x80 >> (index % 8);
            if value {
                id.0[index / 8] |= mask;
            } else {
                id.0[index / 8] &= !mask;
            }
        }

        id
    }

    /// Returns `true` if the first `depth` bits of `self` and `other` match.
    pub fn shares_prefix(&self, other: &Id, depth: usize) -> bool {
        self.xor(other).leading_zeros() >= depth
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id, Error> {
        if !s.is_ascii() || s.len() % 2 != 0 {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let bytes = s
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            })
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| Error::InvalidIdEncoding(s.to_string()))?;

        let array: [u8; ID_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidIdSize(bytes.len()))?;

        Ok(Id(array))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(first: u8) -> Id {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = first;
        Id(bytes)
    }

    #[test]
    fn distance_is_symmetric_and_zero_to_self() {
        for _ in 0..20 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.distance(&a), Id::MIN);
        }
    }

    #[test]
    fn log_distance() {
        let a = Id::MIN;

        assert_eq!(a.log_distance(&a), 0);
        assert_eq!(a.log_distance(&Id::MAX), 160);
        assert_eq!(a.log_distance(&id(0b0000_0100)), 155);
    }

    #[test]
    fn closer_than_is_consistent_with_distance() {
        let target = id(0x81);

        assert!(id(0x80).is_closer_than(&id(0x00), &target));
        assert!(!id(0x00).is_closer_than(&id(0x80), &target));
        assert!(!id(0x80).is_closer_than(&id(0x80), &target));

        for _ in 0..20 {
            let (a, b, c) = (Id::random(), Id::random(), Id::random());

            if a.is_closer_than(&b, &c) {
                assert!(a.distance(&c) < b.distance(&c));
                assert!(!b.is_closer_than(&a, &c));
            }
        }
    }

    #[test]
    fn random_with_prefix() {
        let prefix = id(0b1011_0000);

        for depth in [0, 1, 3, 4, 9, 160] {
            let random = Id::random_with_prefix(&prefix, depth);
            assert!(random.shares_prefix(&prefix, depth));
        }
    }

    #[test]
    fn bits() {
        let id = id(0b0100_0000);

        assert!(!id.bit(0));
        assert!(id.bit(1));
        assert!(!id.bit(200));

        assert_eq!(id.with_bit(0, true).0[0], 0b1100_0000);
        assert_eq!(id.with_bit(1, false), Id::MIN);
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::random();
        let parsed: Id = id.to_string().parse().unwrap();

        assert_eq!(parsed, id);
        assert!("abc".parse::<Id>().is_err());
    }

    #[test]
    fn non_ascii_hex_is_an_error() {
        let input = format!("0\u{e9}{}", "0".repeat(37));
        assert_eq!(input.len(), 40);

        assert!(matches!(
            input.parse::<Id>(),
            Err(Error::InvalidIdEncoding(_))
        ));
        assert!("zz".repeat(20).parse::<Id>().is_err());
    }

    #[test]
    fn hash() {
        assert_eq!(
            Id::hash(b"hello").to_string(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }
}
