use bytemuck::{Pod, Zeroable};

/// Length of the sort key at the front of every record.
pub const KEY_LEN: usize = 10;
/// Length of the opaque payload following the key.
pub const PAYLOAD_LEN: usize = 90;
/// Size of one record on disk and on the wire.
pub const RECORD_SIZE: usize = KEY_LEN + PAYLOAD_LEN;

pub type Key = [u8; KEY_LEN];

/// The all-`0xFF` key, upper bound of the key space.
pub const MAX_KEY: Key = [0xFF; KEY_LEN];

/// A fixed-size record. Ordering is by `key` bytes only; payloads never take part in comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Record {
    pub key: Key,
    pub payload: [u8; PAYLOAD_LEN],
}

impl Record {
    pub fn new(key: Key, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self { key, payload }
    }
}

/// Reinterprets a byte run as records. The caller guarantees `bytes.len()` is a multiple of [`RECORD_SIZE`].
pub fn records(bytes: &[u8]) -> &[Record] {
    bytemuck::cast_slice(bytes)
}

pub fn records_mut(bytes: &mut [u8]) -> &mut [Record] {
    bytemuck::cast_slice_mut(bytes)
}

/// Stable sort by key, so equal keys keep their arrival order and re-sorting is a no-op.
pub fn sort_records(records: &mut [Record]) {
    records.sort_by(|a, b| a.key.cmp(&b.key))
}

pub fn is_sorted(records: &[Record]) -> bool {
    records.windows(2).all(|w| w[0].key <= w[1].key)
}

/// Builds a key whose leading bytes are `prefix` and the rest zero.
pub fn key_with_prefix(prefix: &[u8]) -> Key {
    let mut key = [0; KEY_LEN];
    let n = prefix.len().min(KEY_LEN);
    key[..n].copy_from_slice(&prefix[..n]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_packed() {
        assert_eq!(std::mem::size_of::<Record>(), RECORD_SIZE);
        assert_eq!(std::mem::align_of::<Record>(), 1);
    }

    #[test]
    fn sort_ignores_payload_and_is_stable() {
        let mut recs = vec![
            Record::new(key_with_prefix(&[2]), [1; PAYLOAD_LEN]),
            Record::new(key_with_prefix(&[1]), [9; PAYLOAD_LEN]),
            Record::new(key_with_prefix(&[2]), [0; PAYLOAD_LEN]),
        ];
        sort_records(&mut recs);
        assert!(is_sorted(&recs));
        assert_eq!(recs[0].payload, [9; PAYLOAD_LEN]);
        assert_eq!(recs[1].payload, [1; PAYLOAD_LEN]);
        assert_eq!(recs[2].payload, [0; PAYLOAD_LEN]);
    }

    #[test]
    fn byte_view_round_trips() {
        let mut bytes = vec![0u8; 2 * RECORD_SIZE];
        bytes[RECORD_SIZE] = 0xAB;
        let recs = records(&bytes);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].key[0], 0xAB);
        records_mut(&mut bytes)[0].key = MAX_KEY;
        assert_eq!(&bytes[..KEY_LEN], &MAX_KEY);
    }
}
