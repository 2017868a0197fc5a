//! On-disk encoding of quads into the four index key permutations.
//!
//! A key is 28 bytes: the 20-byte position permutation (four 5-byte
//! big-endian atom counters) plus an 8-byte discriminator, which is the
//! order-preserving encoding of `valid_from` for the validity-keyed trees
//! and the transaction id prefix for TGSPO. The payload is a uniform
//! 24 bytes (`valid_from`, `valid_to`, `tx`), identical in all four trees.

use crate::storage::atoms::{AtomId, AtomStore};
use crate::storage::error::StorageError;
use crate::temporal::{Interval, Timestamp};

pub const KEY_LEN: usize = 28;
pub const PAYLOAD_LEN: usize = 24;

pub type IndexKey = [u8; KEY_LEN];
pub type IndexPayload = [u8; PAYLOAD_LEN];

/// A quad at the index level: atom ids plus validity and transaction time.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub struct EncodedQuad {
    pub graph: AtomId,
    pub subject: AtomId,
    pub predicate: AtomId,
    pub object: AtomId,
    pub validity: Interval,
    pub tx: u64,
}

/// Which key permutation a tree stores.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum QuadEncoding {
    Gspo,
    Gpos,
    Gosp,
    Tgspo,
}

impl QuadEncoding {
    pub fn encode_key(self, quad: &EncodedQuad) -> IndexKey {
        let mut key = [0_u8; KEY_LEN];
        match self {
            Self::Gspo => {
                write_counter(&mut key[0..5], quad.graph);
                write_counter(&mut key[5..10], quad.subject);
                write_counter(&mut key[10..15], quad.predicate);
                write_counter(&mut key[15..20], quad.object);
                key[20..28].copy_from_slice(&encode_timestamp(quad.validity.start));
            }
            Self::Gpos => {
                write_counter(&mut key[0..5], quad.graph);
                write_counter(&mut key[5..10], quad.predicate);
                write_counter(&mut key[10..15], quad.object);
                write_counter(&mut key[15..20], quad.subject);
                key[20..28].copy_from_slice(&encode_timestamp(quad.validity.start));
            }
            Self::Gosp => {
                write_counter(&mut key[0..5], quad.graph);
                write_counter(&mut key[5..10], quad.object);
                write_counter(&mut key[10..15], quad.subject);
                write_counter(&mut key[15..20], quad.predicate);
                key[20..28].copy_from_slice(&encode_timestamp(quad.validity.start));
            }
            Self::Tgspo => {
                key[0..8].copy_from_slice(&quad.tx.to_be_bytes());
                write_counter(&mut key[8..13], quad.graph);
                write_counter(&mut key[13..18], quad.subject);
                write_counter(&mut key[18..23], quad.predicate);
                write_counter(&mut key[23..28], quad.object);
            }
        }
        key
    }

    pub fn decode(
        self,
        key: &IndexKey,
        payload: &IndexPayload,
        atoms: &AtomStore,
    ) -> Result<EncodedQuad, StorageError> {
        let (g, s, p, o) = match self {
            Self::Gspo => (
                read_counter(&key[0..5]),
                read_counter(&key[5..10]),
                read_counter(&key[10..15]),
                read_counter(&key[15..20]),
            ),
            Self::Gpos => {
                let g = read_counter(&key[0..5]);
                let p = read_counter(&key[5..10]);
                let o = read_counter(&key[10..15]);
                let s = read_counter(&key[15..20]);
                (g, s, p, o)
            }
            Self::Gosp => {
                let g = read_counter(&key[0..5]);
                let o = read_counter(&key[5..10]);
                let s = read_counter(&key[10..15]);
                let p = read_counter(&key[15..20]);
                (g, s, p, o)
            }
            Self::Tgspo => (
                read_counter(&key[8..13]),
                read_counter(&key[13..18]),
                read_counter(&key[18..23]),
                read_counter(&key[23..28]),
            ),
        };
        let (validity, tx) = decode_payload(payload);
        Ok(EncodedQuad {
            graph: atoms.atom_id(g)?,
            subject: atoms.atom_id(s)?,
            predicate: atoms.atom_id(p)?,
            object: atoms.atom_id(o)?,
            validity,
            tx,
        })
    }
}

pub fn encode_payload(quad: &EncodedQuad) -> IndexPayload {
    let mut payload = [0_u8; PAYLOAD_LEN];
    payload[0..8].copy_from_slice(&quad.validity.start.to_be_bytes());
    payload[8..16].copy_from_slice(&quad.validity.end.to_be_bytes());
    payload[16..24].copy_from_slice(&quad.tx.to_be_bytes());
    payload
}

pub fn decode_payload(payload: &IndexPayload) -> (Interval, u64) {
    (
        Interval {
            start: Timestamp::from_be_bytes(payload[0..8].try_into().unwrap()),
            end: Timestamp::from_be_bytes(payload[8..16].try_into().unwrap()),
        },
        u64::from_be_bytes(payload[16..24].try_into().unwrap()),
    )
}

/// Writes the 40-bit counter of an atom, big-endian.
fn write_counter(target: &mut [u8], atom: AtomId) {
    let counter = atom.counter();
    target.copy_from_slice(&counter.to_be_bytes()[3..8]);
}

fn read_counter(source: &[u8]) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes[3..8].copy_from_slice(source);
    u64::from_be_bytes(bytes)
}

/// Order-preserving timestamp encoding: the sign bit is flipped so that the
/// unsigned byte order of the result matches the signed order of the input.
pub fn encode_timestamp(t: Timestamp) -> [u8; 8] {
    ((t as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_timestamp(bytes: [u8; 8]) -> Timestamp {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}

/// The inclusive lower and exclusive upper key of a scan whose first
/// `prefix_len` bytes are fixed. `None` upper means "to the end".
pub fn prefix_bounds(prefix: &[u8]) -> (IndexKey, Option<IndexKey>) {
    debug_assert!(prefix.len() <= KEY_LEN);
    let mut lower = [0_u8; KEY_LEN];
    lower[..prefix.len()].copy_from_slice(prefix);
    let mut upper = lower;
    for i in (0..prefix.len()).rev() {
        if upper[i] != u8::MAX {
            upper[i] += 1;
            for slot in &mut upper[i + 1..] {
                *slot = 0;
            }
            return (lower, Some(upper));
        }
    }
    (lower, None)
}

/// Builds the scan prefix of bound positions for a permutation. The slice
/// holds the atoms in that permutation's order; only a contiguous bound
/// prefix contributes.
pub fn scan_prefix(atoms_in_order: &[Option<AtomId>]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(20);
    for atom in atoms_in_order {
        let Some(atom) = atom else { break };
        let mut field = [0_u8; 5];
        write_counter(&mut field, *atom);
        prefix.extend_from_slice(&field);
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::atoms::AtomKind;
    use crate::temporal::TIMESTAMP_MAX;

    fn quad(g: u64, s: u64, p: u64, o: u64, vf: i64, vt: i64, tx: u64) -> EncodedQuad {
        EncodedQuad {
            graph: AtomId::new(AtomKind::NamedNode, g),
            subject: AtomId::new(AtomKind::NamedNode, s),
            predicate: AtomId::new(AtomKind::NamedNode, p),
            object: AtomId::new(AtomKind::Literal, o),
            validity: Interval { start: vf, end: vt },
            tx,
        }
    }

    #[test]
    fn timestamp_encoding_preserves_order() {
        let samples = [i64::MIN, -1_000_000, -1, 0, 1, 1_000_000, TIMESTAMP_MAX];
        for window in samples.windows(2) {
            assert!(encode_timestamp(window[0]) < encode_timestamp(window[1]));
            assert_eq!(decode_timestamp(encode_timestamp(window[0])), window[0]);
        }
    }

    #[test]
    fn payload_round_trips() {
        let q = quad(1, 2, 3, 4, -5, TIMESTAMP_MAX, 9);
        let (validity, tx) = decode_payload(&encode_payload(&q));
        assert_eq!(validity, q.validity);
        assert_eq!(tx, 9);
    }

    #[test]
    fn same_positions_order_by_valid_from() {
        let a = QuadEncoding::Gspo.encode_key(&quad(1, 2, 3, 4, 10, 20, 1));
        let b = QuadEncoding::Gspo.encode_key(&quad(1, 2, 3, 4, 30, TIMESTAMP_MAX, 2));
        assert!(a < b);
        assert_eq!(a[..20], b[..20]);
    }

    #[test]
    fn tgspo_orders_by_transaction() {
        let a = QuadEncoding::Tgspo.encode_key(&quad(1, 2, 3, 4, 0, 1, 5));
        let b = QuadEncoding::Tgspo.encode_key(&quad(1, 1, 1, 1, 0, 1, 6));
        assert!(a < b);
    }

    #[test]
    fn prefix_bounds_cover_exactly_the_prefix() {
        let q = quad(1, 2, 3, 4, 10, 20, 1);
        let key = QuadEncoding::Gspo.encode_key(&q);
        let prefix = scan_prefix(&[Some(q.graph), Some(q.subject), None, Some(q.object)]);
        assert_eq!(prefix.len(), 10); // the bound prefix stops at the hole
        let (lower, upper) = prefix_bounds(&prefix);
        assert!(lower <= key);
        assert!(upper.is_some_and(|u| key < u));
        let other = QuadEncoding::Gspo.encode_key(&quad(1, 3, 3, 4, 10, 20, 1));
        assert!(upper.is_some_and(|u| other >= u));
    }
}
