//! Hash slot arithmetic and ownership tracking.
//!
//! Key routing uses the standard 16384-slot scheme: CRC16-CCITT (XMODEM,
//! polynomial 0x1021) of the key, masked to 14 bits, with `{...}` hash tags
//! so related keys can be pinned to one slot.
//!
//! Ownership is tracked twice: each node carries a [`SlotBitmap`] of the
//! slots it claims, and the cluster keeps one [`SlotTable`] mapping every
//! slot to its owner. The two views must always agree; the mutation paths
//! in `ClusterState` keep them in sync.

use std::fmt;

use crate::node::NodeId;

/// Total number of hash slots.
pub const SLOT_COUNT: usize = 16384;

const WORDS: usize = SLOT_COUNT / 64;

/// Fixed 16384-bit set of slot indices (2048 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap([u64; WORDS]);

impl SlotBitmap {
    pub fn new() -> Self {
        Self([0; WORDS])
    }

    pub fn get(&self, slot: u16) -> bool {
        let slot = slot as usize;
        debug_assert!(slot < SLOT_COUNT);
        self.0[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Sets the bit. Returns the previous value.
    pub fn set(&mut self, slot: u16) -> bool {
        let prev = self.get(slot);
        let slot = slot as usize;
        self.0[slot / 64] |= 1 << (slot % 64);
        prev
    }

    /// Clears the bit. Returns the previous value.
    pub fn clear(&mut self, slot: u16) -> bool {
        let prev = self.get(slot);
        let slot = slot as usize;
        self.0[slot / 64] &= !(1 << (slot % 64));
        prev
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Iterates the set slot indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().enumerate().flat_map(|(wi, &word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| (wi * 64 + bit) as u16)
        })
    }

    /// The 64-bit words backing the bitmap, for the wire codec.
    pub fn words(&self) -> &[u64; WORDS] {
        &self.0
    }

    pub fn from_words(words: [u64; WORDS]) -> Self {
        Self(words)
    }
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotBitmap({} slots)", self.count())
    }
}

/// Global slot → owner mapping. At most one owner per slot.
#[derive(Debug, Clone)]
pub struct SlotTable {
    owners: Box<[Option<NodeId>]>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            owners: vec![None; SLOT_COUNT].into_boxed_slice(),
        }
    }

    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        self.owners[slot as usize]
    }

    pub fn set_owner(&mut self, slot: u16, node: NodeId) {
        self.owners[slot as usize] = Some(node);
    }

    /// Clears the entry. Returns the previous owner, if any.
    pub fn clear_owner(&mut self, slot: u16) -> Option<NodeId> {
        self.owners[slot as usize].take()
    }

    /// Number of slots with an owner.
    pub fn assigned_count(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a bitmap as the space-separated range list used by the nodes
/// listing and the saved configuration, e.g. `0-5460 9000 9002-9005`.
pub fn format_slot_ranges(slots: &SlotBitmap) -> String {
    let mut out = String::new();
    let mut run: Option<(u16, u16)> = None;
    for slot in slots.iter() {
        match run {
            Some((start, end)) if slot == end + 1 => run = Some((start, slot)),
            Some((start, end)) => {
                push_range(&mut out, start, end);
                run = Some((slot, slot));
            }
            None => run = Some((slot, slot)),
        }
    }
    if let Some((start, end)) = run {
        push_range(&mut out, start, end);
    }
    out
}

fn push_range(out: &mut String, start: u16, end: u16) {
    if !out.is_empty() {
        out.push(' ');
    }
    if start == end {
        out.push_str(&start.to_string());
    } else {
        out.push_str(&format!("{start}-{end}"));
    }
}

/// Maps a key to its hash slot.
///
/// If the key contains a `{...}` section with a non-empty interior, only
/// that interior is hashed, so clients can force related keys onto the same
/// slot. An empty tag (`foo{}bar`) hashes the whole key.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    let mut key = key;
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(off) = key[start + 1..].iter().position(|&b| b == b'}') {
            let end = start + 1 + off;
            if end > start + 1 {
                key = &key[start + 1..end];
            }
        }
    }
    crc16(key) & 16383
}

fn crc16(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in buf {
        crc = (crc << 8) ^ CRC16_TABLE[((crc >> 8) ^ (byte as u16)) as usize];
    }
    crc
}

// Precomputed table for CRC16 (XMODEM)
const CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7, 0x8108, 0x9129, 0xa14a, 0xb16b,
    0xc18c, 0xd1ad, 0xe1ce, 0xf1ef, 0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de, 0x2462, 0x3443, 0x0420, 0x1401,
    0x64e6, 0x74c7, 0x44a4, 0x5485, 0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4, 0xb75b, 0xa77a, 0x9719, 0x8738,
    0xf7df, 0xe7fe, 0xd79d, 0xc7bc, 0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b, 0x5af5, 0x4ad4, 0x7ab7, 0x6a96,
    0x1a71, 0x0a50, 0x3a33, 0x2a12, 0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41, 0xedae, 0xfd8f, 0xcdec, 0xddcd,
    0xad2a, 0xbd0b, 0x8d68, 0x9d49, 0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78, 0x9188, 0x81a9, 0xb1ca, 0xa1eb,
    0xd10c, 0xc12d, 0xf14e, 0xe16f, 0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e, 0x02b1, 0x1290, 0x22f3, 0x32d2,
    0x4235, 0x5214, 0x6277, 0x7256, 0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405, 0xa7db, 0xb7fa, 0x8799, 0x97b8,
    0xe75f, 0xf77e, 0xc71d, 0xd73c, 0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab, 0x5844, 0x4865, 0x7806, 0x6827,
    0x18c0, 0x08e1, 0x3882, 0x28a3, 0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92, 0xfd2e, 0xed0f, 0xdd6c, 0xcd4d,
    0xbdaa, 0xad8b, 0x9de8, 0x8dc9, 0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8, 0x6e17, 0x7e36, 0x4e55, 0x5e74,
    0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

#[cfg(test)]
mod tests {
    use super::*;

    // Known vectors from the reference CRC16 slot mapping.
    #[test]
    fn known_slot_values() {
        assert_eq!(key_hash_slot(b""), 0);
        assert_eq!(key_hash_slot(b"foo"), 12182);
        assert_eq!(key_hash_slot(b"bar"), 5061);
        assert_eq!(key_hash_slot(b"hello"), 866);
        assert_eq!(key_hash_slot(b"123456789"), 12739);
        // hits the high table indices the short vectors above never touch
        assert_eq!(key_hash_slot(b"np"), 5810);
    }

    // The precomputed table must match the 0x1021 polynomial bit for bit;
    // a single wrong entry misroutes every key whose hash path crosses it.
    #[test]
    fn crc16_table_matches_polynomial() {
        for (i, &entry) in CRC16_TABLE.iter().enumerate() {
            let mut crc = (i as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ 0x1021
                } else {
                    crc << 1
                };
            }
            assert_eq!(entry, crc, "table entry {i} diverges from the polynomial");
        }
    }

    #[test]
    fn hash_tag_pins_slot() {
        assert_eq!(key_hash_slot(b"foo{bar}baz"), key_hash_slot(b"bar"));
        assert_eq!(key_hash_slot(b"{user1}:name"), key_hash_slot(b"user1"));
        assert_eq!(
            key_hash_slot(b"{user1}:name"),
            key_hash_slot(b"{user1}:age")
        );
    }

    #[test]
    fn empty_hash_tag_uses_whole_key() {
        assert_eq!(key_hash_slot(b"foo{}bar"), crc16(b"foo{}bar") & 16383);
        assert_ne!(key_hash_slot(b"foo{}bar"), key_hash_slot(b"foo{}baz"));
    }

    #[test]
    fn unterminated_tag_uses_whole_key() {
        assert_eq!(key_hash_slot(b"foo{bar"), crc16(b"foo{bar") & 16383);
    }

    #[test]
    fn only_first_tag_counts() {
        assert_eq!(key_hash_slot(b"{a}{b}"), key_hash_slot(b"a"));
    }

    #[test]
    fn slots_stay_in_range() {
        for key in [&b"a"[..], b"some:key", b"\x00\xff\x7f"] {
            assert!((key_hash_slot(key) as usize) < SLOT_COUNT);
        }
    }

    #[test]
    fn bitmap_set_clear_count() {
        let mut bm = SlotBitmap::new();
        assert!(bm.is_empty());
        assert!(!bm.set(0));
        assert!(!bm.set(63));
        assert!(!bm.set(64));
        assert!(!bm.set(16383));
        assert!(bm.set(0), "second set reports previous value");
        assert_eq!(bm.count(), 4);
        assert!(bm.clear(63));
        assert!(!bm.clear(63));
        assert_eq!(bm.count(), 3);
        assert!(bm.get(16383));
        assert!(!bm.get(1));
    }

    #[test]
    fn bitmap_iter_ascending() {
        let mut bm = SlotBitmap::new();
        for slot in [5u16, 100, 64, 16383, 0] {
            bm.set(slot);
        }
        let collected: Vec<u16> = bm.iter().collect();
        assert_eq!(collected, vec![0, 5, 64, 100, 16383]);
    }

    #[test]
    fn table_single_owner_per_slot() {
        let mut table = SlotTable::new();
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(table.owner(7), None);
        table.set_owner(7, a);
        assert_eq!(table.owner(7), Some(a));
        table.set_owner(7, b);
        assert_eq!(table.owner(7), Some(b));
        assert_eq!(table.clear_owner(7), Some(b));
        assert_eq!(table.clear_owner(7), None);
        assert_eq!(table.assigned_count(), 0);
    }

    #[test]
    fn range_rendering_merges_runs() {
        let mut bm = SlotBitmap::new();
        for slot in 0..=5460u16 {
            bm.set(slot);
        }
        bm.set(9000);
        bm.set(9002);
        bm.set(9003);
        bm.set(9004);
        assert_eq!(format_slot_ranges(&bm), "0-5460 9000 9002-9004");
        assert_eq!(format_slot_ranges(&SlotBitmap::new()), "");
    }
}
