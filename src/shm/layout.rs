//! Shared region layout
//!
//! Every offset in the region is derived from a validated [`RegionLayout`];
//! nothing outside this module does offset arithmetic.
//!
//! ```text
//! +--------------------+ 0
//! | header             |  magic, version, total length, slot geometry
//! +--------------------+ 48
//! | canary 0           |
//! +--------------------+
//! | online bitmask u16 |
//! +--------------------+
//! | canary 1           |
//! +--------------------+
//! | camera: last index |
//! |   slot 0..N        |  each: sequence u64, len u32, pad, data
//! +--------------------+
//! | canary 2           |
//! +--------------------+
//! | processed binary   |
//! +--------------------+
//! | canary 3           |
//! +--------------------+
//! | top-down           |
//! +--------------------+
//! | canary 4           |
//! +--------------------+
//! ```
//!
//! All sections start on 8-byte boundaries so guard and sequence words can
//! be accessed atomically.

use crate::error::ShmError;
use crate::protocol::MessageId;

/// Region header magic ("MBSH")
pub const REGION_MAGIC: u32 = 0x4D42_5348;

/// Region format version
pub const REGION_VERSION: u32 = 1;

pub(crate) const HEADER_LEN: usize = 48;
pub(crate) const CANARY_LEN: usize = 8;
const MEMBERS_LEN: usize = 8;
const KIND_HEADER_LEN: usize = 8;
pub(crate) const SLOT_HEADER_LEN: usize = 16;

/// Upper bound on slots per kind
pub const MAX_SLOTS_PER_KIND: u32 = 64;

/// Large-payload kinds carried in the region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Raw camera frames
    Camera,
    /// Thresholded / processed binary images
    ProcessedBinary,
    /// Top-down projected images
    TopDown,
}

impl SlotKind {
    pub const ALL: [SlotKind; 3] = [SlotKind::Camera, SlotKind::ProcessedBinary, SlotKind::TopDown];

    pub fn index(self) -> usize {
        match self {
            SlotKind::Camera => 0,
            SlotKind::ProcessedBinary => 1,
            SlotKind::TopDown => 2,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Message id used to announce a published slot of this kind
    pub fn message_id(self) -> MessageId {
        match self {
            SlotKind::Camera => MessageId::CAMERA_FRAME,
            SlotKind::ProcessedBinary => MessageId::PROCESSED_BINARY_FRAME,
            SlotKind::TopDown => MessageId::TOP_DOWN_FRAME,
        }
    }
}

/// Slot geometry of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindLayout {
    pub slot_count: u32,
    /// Usable bytes per slot
    pub slot_capacity: u32,
}

impl KindLayout {
    fn slot_stride(&self) -> usize {
        SLOT_HEADER_LEN + align8(self.slot_capacity as usize)
    }

    fn section_len(&self) -> usize {
        KIND_HEADER_LEN + self.slot_count as usize * self.slot_stride()
    }
}

/// Validated description of the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    kinds: [KindLayout; 3],
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self {
            kinds: [
                // 640x480 RGB
                KindLayout {
                    slot_count: 4,
                    slot_capacity: 640 * 480 * 3,
                },
                // 640x480, one byte per pixel
                KindLayout {
                    slot_count: 4,
                    slot_capacity: 640 * 480,
                },
                // 400x400, one byte per cell
                KindLayout {
                    slot_count: 4,
                    slot_capacity: 400 * 400,
                },
            ],
        }
    }
}

impl RegionLayout {
    /// Set the slot geometry for one kind
    pub fn slots(mut self, kind: SlotKind, count: u32, capacity: u32) -> Self {
        self.kinds[kind.index()] = KindLayout {
            slot_count: count,
            slot_capacity: capacity,
        };
        self
    }

    pub fn kind(&self, kind: SlotKind) -> KindLayout {
        self.kinds[kind.index()]
    }

    /// Check geometry limits and that every offset fits in 32 bits
    pub fn validate(&self) -> Result<(), ShmError> {
        for kind in SlotKind::ALL {
            let k = self.kind(kind);
            if k.slot_count == 0 || k.slot_count > MAX_SLOTS_PER_KIND {
                return Err(ShmError::InvalidLayout(format!(
                    "{:?} slot count {} outside 1..={}",
                    kind, k.slot_count, MAX_SLOTS_PER_KIND
                )));
            }
            if k.slot_capacity == 0 {
                return Err(ShmError::InvalidLayout(format!(
                    "{:?} slot capacity is zero",
                    kind
                )));
            }
        }
        let total = self.total_len();
        if total > u32::MAX as usize {
            return Err(ShmError::InvalidLayout(format!(
                "region of {} bytes does not fit 32-bit offsets",
                total
            )));
        }
        Ok(())
    }

    pub(crate) fn canary_offset(&self, index: usize) -> usize {
        match index {
            0 => HEADER_LEN,
            1 => HEADER_LEN + CANARY_LEN + MEMBERS_LEN,
            n => self.kind_offset(SlotKind::ALL[n - 2]) + self.kinds[n - 2].section_len(),
        }
    }

    /// Offsets of every guard word, in address order
    pub fn canary_offsets(&self) -> Vec<usize> {
        (0..SlotKind::ALL.len() + 2)
            .map(|i| self.canary_offset(i))
            .collect()
    }

    pub(crate) fn members_offset(&self) -> usize {
        HEADER_LEN + CANARY_LEN
    }

    pub(crate) fn kind_offset(&self, kind: SlotKind) -> usize {
        // Each kind section starts right after the canary that precedes it
        self.canary_offset(kind.index() + 1) + CANARY_LEN
    }

    /// Offset of the "last written slot index" word
    pub(crate) fn last_written_offset(&self, kind: SlotKind) -> usize {
        self.kind_offset(kind)
    }

    pub(crate) fn slot_offset(&self, kind: SlotKind, index: usize) -> Result<usize, ShmError> {
        let k = self.kind(kind);
        if index >= k.slot_count as usize {
            return Err(ShmError::SlotOutOfRange {
                index,
                count: k.slot_count as usize,
            });
        }
        Ok(self.kind_offset(kind) + KIND_HEADER_LEN + index * k.slot_stride())
    }

    /// Offset of the first data byte of a slot
    pub fn slot_data_offset(&self, kind: SlotKind, index: usize) -> Result<usize, ShmError> {
        Ok(self.slot_offset(kind, index)? + SLOT_HEADER_LEN)
    }

    /// Total bytes the region occupies
    pub fn total_len(&self) -> usize {
        self.canary_offset(SlotKind::ALL.len() + 1) + CANARY_LEN
    }

    pub(crate) fn from_header_words(words: [(u32, u32); 3]) -> Self {
        let mut kinds = [KindLayout {
            slot_count: 0,
            slot_capacity: 0,
        }; 3];
        for (kind, (count, capacity)) in kinds.iter_mut().zip(words) {
            *kind = KindLayout {
                slot_count: count,
                slot_capacity: capacity,
            };
        }
        Self { kinds }
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> RegionLayout {
        RegionLayout::default()
            .slots(SlotKind::Camera, 2, 10)
            .slots(SlotKind::ProcessedBinary, 3, 16)
            .slots(SlotKind::TopDown, 1, 1)
    }

    #[test]
    fn test_default_layout_valid() {
        assert!(RegionLayout::default().validate().is_ok());
    }

    #[test]
    fn test_offsets_aligned_and_ordered() {
        let layout = small();
        let canaries = layout.canary_offsets();
        assert_eq!(canaries.len(), 5);

        for window in canaries.windows(2) {
            assert!(window[0] < window[1]);
        }
        for offset in &canaries {
            assert_eq!(offset % 8, 0);
        }
        assert_eq!(layout.members_offset(), canaries[0] + CANARY_LEN);
        assert_eq!(canaries[1], layout.members_offset() + MEMBERS_LEN);
        assert_eq!(layout.total_len(), canaries[4] + CANARY_LEN);
    }

    #[test]
    fn test_slots_sit_between_guards() {
        let layout = small();
        let canaries = layout.canary_offsets();

        for kind in SlotKind::ALL {
            let k = layout.kind(kind);
            let before = canaries[kind.index() + 1];
            let after = canaries[kind.index() + 2];
            for i in 0..k.slot_count as usize {
                let data = layout.slot_data_offset(kind, i).unwrap();
                assert_eq!(data % 8, 0);
                assert!(data > before);
                assert!(data + k.slot_capacity as usize <= after);
            }
        }
    }

    #[test]
    fn test_capacity_rounded_to_stride() {
        let layout = small();
        // 10 bytes of capacity pad to 16, plus the 16-byte slot header
        let s0 = layout.slot_offset(SlotKind::Camera, 0).unwrap();
        let s1 = layout.slot_offset(SlotKind::Camera, 1).unwrap();
        assert_eq!(s1 - s0, 32);
    }

    #[test]
    fn test_slot_out_of_range() {
        let layout = small();
        assert_eq!(
            layout.slot_offset(SlotKind::TopDown, 1),
            Err(ShmError::SlotOutOfRange { index: 1, count: 1 })
        );
    }

    #[test]
    fn test_invalid_geometry() {
        let zero = RegionLayout::default().slots(SlotKind::Camera, 0, 10);
        assert!(matches!(zero.validate(), Err(ShmError::InvalidLayout(_))));

        let too_many = RegionLayout::default().slots(SlotKind::Camera, MAX_SLOTS_PER_KIND + 1, 10);
        assert!(too_many.validate().is_err());

        let empty = RegionLayout::default().slots(SlotKind::TopDown, 1, 0);
        assert!(empty.validate().is_err());

        let huge = RegionLayout::default().slots(SlotKind::Camera, 64, u32::MAX - 64);
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_kind_round_trip_index() {
        for kind in SlotKind::ALL {
            assert_eq!(SlotKind::from_index(kind.index() as u8), Some(kind));
        }
        assert_eq!(SlotKind::from_index(3), None);
    }
}
