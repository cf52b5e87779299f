//! Shared region
//!
//! A file-backed `MAP_SHARED` mapping created once by the broker and
//! attached by every member. Access goes through typed accessors computed
//! from the [`RegionLayout`] stored in the region header.
//!
//! # Publication
//!
//! Each kind has a single writer. The writer rotates through its slots,
//! brackets every write with the slot's sequence word (odd while writing,
//! even when stable) and then stores the slot index into the kind's "last
//! written" word. Readers copy a slot and compare the sequence word before
//! and after; a mismatch reports [`ShmError::TornRead`] instead of handing
//! out a half-written frame. There is no lock; a reader that loses the race
//! simply retries or waits for the next announcement.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memmap2::MmapRaw;

use super::layout::{RegionLayout, SlotKind, HEADER_LEN, REGION_MAGIC, REGION_VERSION, SLOT_HEADER_LEN};
use crate::buffer::ByteBuffer;
use crate::error::{ProtocolError, Result, ShmError};
use crate::protocol::{MemberId, MAX_MEMBER_ID};

const NONE_WRITTEN: u32 = u32::MAX;

/// Path of the region file for `id` inside `dir`
pub fn region_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("membus-{:08x}", id))
}

/// Points a consumer at a freshly published slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAnnouncement {
    pub kind: SlotKind,
    pub index: u16,
    /// Byte offset of the slot data from the start of the region
    pub offset: u32,
    pub len: u32,
    /// Slot sequence word after the write completed
    pub sequence: u64,
}

impl SlotAnnouncement {
    pub const ENCODED_LEN: usize = 20;

    /// Frame payload announcing the slot
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u8(self.kind.index() as u8);
        buf.put_u8(0);
        buf.put_u16_le(self.index);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.len);
        buf.put_u64_le(self.sequence);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let malformed = |reason: &'static str| ProtocolError::MalformedPayload {
            message_id: 0,
            reason,
        };
        if payload.len() != Self::ENCODED_LEN {
            return Err(malformed("slot announcement must be 20 bytes"));
        }
        let kind = SlotKind::from_index(payload.get_u8()).ok_or_else(|| malformed("unknown slot kind"))?;
        payload.advance(1);
        Ok(Self {
            kind,
            index: payload.get_u16_le(),
            offset: payload.get_u32_le(),
            len: payload.get_u32_le(),
            sequence: payload.get_u64_le(),
        })
    }
}

/// Mapped shared region
pub struct SharedRegion {
    map: MmapRaw,
    // Keeps the mapping's backing file open
    _file: File,
    id: u32,
    path: PathBuf,
    layout: RegionLayout,
    owner: bool,
}

impl SharedRegion {
    /// Create and initialize the region file (broker side).
    ///
    /// An existing file with the same id is replaced. The file is removed
    /// when the returned region is dropped.
    pub fn create(dir: &Path, id: u32, layout: RegionLayout) -> Result<Self> {
        layout.validate()?;
        let path = region_path(dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(layout.total_len() as u64)?;
        let map = MmapRaw::map_raw(&file)?;

        let region = Self {
            map,
            _file: file,
            id,
            path,
            layout,
            owner: true,
        };
        region.write_header();
        for kind in SlotKind::ALL {
            region
                .atomic_u32(layout.last_written_offset(kind))
                .store(NONE_WRITTEN, Ordering::Release);
        }

        tracing::info!(
            region_id = format_args!("{:08x}", id),
            path = %region.path.display(),
            bytes = layout.total_len(),
            "Shared region created"
        );
        Ok(region)
    }

    /// Attach to a region created by the broker (member side)
    pub fn attach(dir: &Path, id: u32) -> Result<Self> {
        let path = region_path(dir, id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let actual = file.metadata()?.len() as usize;
        if actual < HEADER_LEN {
            return Err(ShmError::TooSmall {
                required: HEADER_LEN,
                actual,
            }
            .into());
        }
        let map = MmapRaw::map_raw(&file)?;

        let mut header = [0u8; HEADER_LEN];
        // SAFETY: the mapping is at least HEADER_LEN bytes
        unsafe { std::ptr::copy_nonoverlapping(map.as_ptr(), header.as_mut_ptr(), HEADER_LEN) };
        let layout = parse_header(&header)?;
        layout.validate()?;
        if actual < layout.total_len() {
            return Err(ShmError::TooSmall {
                required: layout.total_len(),
                actual,
            }
            .into());
        }

        tracing::debug!(
            region_id = format_args!("{:08x}", id),
            path = %path.display(),
            "Shared region attached"
        );
        Ok(Self {
            map,
            _file: file,
            id,
            path,
            layout,
            owner: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_header(&self) {
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u32_le(REGION_MAGIC);
        header.put_u32_le(REGION_VERSION);
        header.put_u64_le(self.layout.total_len() as u64);
        for kind in SlotKind::ALL {
            let k = self.layout.kind(kind);
            header.put_u32_le(k.slot_count);
            header.put_u32_le(k.slot_capacity);
        }
        header.resize(HEADER_LEN, 0);
        // SAFETY: the mapping holds at least total_len >= HEADER_LEN bytes
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), self.map.as_mut_ptr(), HEADER_LEN);
        }
    }

    fn check_span(&self, offset: usize, len: usize) {
        assert!(
            offset + len <= self.len(),
            "region access {}..{} outside {} bytes",
            offset,
            offset + len,
            self.len()
        );
    }

    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check_span(offset, 8);
        debug_assert_eq!(offset % 8, 0);
        // SAFETY: in bounds, 8-aligned (page-aligned base, layout offsets are
        // multiples of 8) and only ever accessed atomically
        unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU64) }
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check_span(offset, 4);
        debug_assert_eq!(offset % 4, 0);
        // SAFETY: see atomic_u64
        unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU32) }
    }

    fn atomic_u16(&self, offset: usize) -> &AtomicU16 {
        self.check_span(offset, 2);
        // SAFETY: see atomic_u64
        unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU16) }
    }

    pub(crate) fn read_guard(&self, offset: usize) -> u64 {
        self.atomic_u64(offset).load(Ordering::Acquire)
    }

    pub(crate) fn write_guard(&self, offset: usize, value: u64) {
        self.atomic_u64(offset).store(value, Ordering::Release);
    }

    /// Set or clear a member's online bit
    pub fn set_online(&self, member: MemberId, online: bool) -> Result<()> {
        let bit = member_bit(member)?;
        let word = self.atomic_u16(self.layout.members_offset());
        if online {
            word.fetch_or(bit, Ordering::AcqRel);
        } else {
            word.fetch_and(!bit, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Online bitmask; bit n is member n
    pub fn online_members(&self) -> u16 {
        self.atomic_u16(self.layout.members_offset())
            .load(Ordering::Acquire)
    }

    pub fn is_online(&self, member: MemberId) -> bool {
        member_bit(member)
            .map(|bit| self.online_members() & bit != 0)
            .unwrap_or(false)
    }

    /// Index of the most recently published slot of `kind`
    pub fn last_written(&self, kind: SlotKind) -> Option<usize> {
        match self
            .atomic_u32(self.layout.last_written_offset(kind))
            .load(Ordering::Acquire)
        {
            NONE_WRITTEN => None,
            index => Some(index as usize),
        }
    }

    /// Write `data` into the next slot of `kind` and publish it.
    ///
    /// Only the single producer of `kind` may call this.
    pub fn write_slot(&self, kind: SlotKind, data: &[u8]) -> Result<SlotAnnouncement> {
        let k = self.layout.kind(kind);
        if data.len() > k.slot_capacity as usize {
            return Err(ShmError::PayloadTooLarge {
                len: data.len(),
                capacity: k.slot_capacity as usize,
            }
            .into());
        }

        let index = match self.last_written(kind) {
            Some(last) => (last + 1) % k.slot_count as usize,
            None => 0,
        };
        let slot = self.layout.slot_offset(kind, index)?;
        let data_offset = slot + SLOT_HEADER_LEN;
        self.check_span(data_offset, data.len());

        let seq = self.atomic_u64(slot);
        // Round up so a write interrupted by a crashed producer cannot leave us odd
        let base = (seq.load(Ordering::Relaxed) + 1) & !1;
        seq.store(base + 1, Ordering::Relaxed);
        fence(Ordering::Release);

        self.atomic_u32(slot + 8)
            .store(data.len() as u32, Ordering::Relaxed);
        // SAFETY: bounds checked above; this process is the only writer of the slot
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.as_mut_ptr().add(data_offset),
                data.len(),
            );
        }

        let sequence = base + 2;
        seq.store(sequence, Ordering::Release);
        self.atomic_u32(self.layout.last_written_offset(kind))
            .store(index as u32, Ordering::Release);

        Ok(SlotAnnouncement {
            kind,
            index: index as u16,
            offset: data_offset as u32,
            len: data.len() as u32,
            sequence,
        })
    }

    /// Copy one slot into `out`, returning its sequence word
    pub fn read_slot(&self, kind: SlotKind, index: usize, out: &mut ByteBuffer) -> Result<u64> {
        let k = self.layout.kind(kind);
        let slot = self.layout.slot_offset(kind, index)?;
        let seq = self.atomic_u64(slot);

        let before = seq.load(Ordering::Acquire);
        if before == 0 {
            return Err(ShmError::NothingPublished.into());
        }
        if before & 1 == 1 {
            return Err(ShmError::TornRead.into());
        }

        let len = self.atomic_u32(slot + 8).load(Ordering::Relaxed) as usize;
        if len > k.slot_capacity as usize {
            return Err(ShmError::TornRead.into());
        }
        let data_offset = slot + SLOT_HEADER_LEN;
        self.check_span(data_offset, len);

        out.clear();
        let dst = out.put_zeroed(len)?;
        // SAFETY: bounds checked; concurrent writes are detected by the sequence check
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(data_offset),
                dst.as_mut_ptr(),
                len,
            );
        }

        fence(Ordering::Acquire);
        if seq.load(Ordering::Relaxed) != before {
            out.clear();
            return Err(ShmError::TornRead.into());
        }
        Ok(before)
    }

    /// Copy the most recently published slot of `kind`
    pub fn read_latest(&self, kind: SlotKind, out: &mut ByteBuffer) -> Result<SlotAnnouncement> {
        let index = self.last_written(kind).ok_or(ShmError::NothingPublished)?;
        let sequence = self.read_slot(kind, index, out)?;
        Ok(SlotAnnouncement {
            kind,
            index: index as u16,
            offset: self.layout.slot_data_offset(kind, index)? as u32,
            len: out.len() as u32,
            sequence,
        })
    }

    /// Copy the slot an announcement points at.
    ///
    /// Fails with [`ShmError::TornRead`] when the slot has been rewritten
    /// since it was announced.
    pub fn read_announced(&self, announcement: &SlotAnnouncement, out: &mut ByteBuffer) -> Result<()> {
        let index = announcement.index as usize;
        let expected_offset = self.layout.slot_data_offset(announcement.kind, index)?;
        if announcement.offset as usize != expected_offset {
            return Err(ShmError::BadAnnouncement(format!(
                "offset {} is not slot {} of {:?}",
                announcement.offset, index, announcement.kind
            ))
            .into());
        }
        let capacity = self.layout.kind(announcement.kind).slot_capacity;
        if announcement.len > capacity {
            return Err(ShmError::BadAnnouncement(format!(
                "length {} exceeds capacity {}",
                announcement.len, capacity
            ))
            .into());
        }

        let sequence = self.read_slot(announcement.kind, index, out)?;
        if sequence != announcement.sequence || out.len() != announcement.len as usize {
            out.clear();
            return Err(ShmError::TornRead.into());
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove shared region");
            }
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("len", &self.len())
            .field("owner", &self.owner)
            .finish()
    }
}

fn member_bit(member: MemberId) -> std::result::Result<u16, ShmError> {
    if member.0 > MAX_MEMBER_ID {
        return Err(ShmError::MemberOutOfRange(member.0));
    }
    Ok(1 << member.0)
}

fn parse_header(mut header: &[u8]) -> std::result::Result<RegionLayout, ShmError> {
    let magic = header.get_u32_le();
    if magic != REGION_MAGIC {
        return Err(ShmError::BadMagic(magic));
    }
    let version = header.get_u32_le();
    if version != REGION_VERSION {
        return Err(ShmError::VersionMismatch {
            expected: REGION_VERSION,
            found: version,
        });
    }
    let _total = header.get_u64_le();
    let mut words = [(0u32, 0u32); 3];
    for word in words.iter_mut() {
        *word = (header.get_u32_le(), header.get_u32_le());
    }
    Ok(RegionLayout::from_header_words(words))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn layout() -> RegionLayout {
        RegionLayout::default()
            .slots(SlotKind::Camera, 3, 32)
            .slots(SlotKind::ProcessedBinary, 2, 16)
            .slots(SlotKind::TopDown, 1, 8)
    }

    #[test]
    fn test_create_and_attach_share_memory() {
        let dir = tempfile::tempdir().unwrap();
        let owner = SharedRegion::create(dir.path(), 7, layout()).unwrap();
        let member = SharedRegion::attach(dir.path(), 7).unwrap();

        assert_eq!(member.layout(), owner.layout());
        assert_eq!(member.len(), owner.len());

        let ann = member.write_slot(SlotKind::Camera, b"frame-0").unwrap();
        let mut out = ByteBuffer::new(64);
        owner.read_announced(&ann, &mut out).unwrap();
        assert_eq!(out.as_slice(), b"frame-0");
    }

    #[test]
    fn test_owner_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let region = SharedRegion::create(dir.path(), 1, layout()).unwrap();
            let _attached = SharedRegion::attach(dir.path(), 1).unwrap();
            region.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_attach_missing_or_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(SharedRegion::attach(dir.path(), 9), Err(Error::Io(_))));

        std::fs::write(region_path(dir.path(), 9), vec![0u8; 256]).unwrap();
        assert!(matches!(
            SharedRegion::attach(dir.path(), 9),
            Err(Error::Shm(ShmError::BadMagic(0)))
        ));
    }

    #[test]
    fn test_slots_rotate_and_publish_index() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), 2, layout()).unwrap();
        assert_eq!(region.last_written(SlotKind::Camera), None);

        let indices: Vec<u16> = (0..4)
            .map(|i| region.write_slot(SlotKind::Camera, &[i]).unwrap().index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
        assert_eq!(region.last_written(SlotKind::Camera), Some(0));

        let mut out = ByteBuffer::new(64);
        let latest = region.read_latest(SlotKind::Camera, &mut out).unwrap();
        assert_eq!(latest.index, 0);
        assert_eq!(out.as_slice(), &[3]);
    }

    #[test]
    fn test_nothing_published() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), 3, layout()).unwrap();
        let mut out = ByteBuffer::new(64);

        assert!(matches!(
            region.read_latest(SlotKind::TopDown, &mut out),
            Err(Error::Shm(ShmError::NothingPublished))
        ));
    }

    #[test]
    fn test_payload_larger_than_slot() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), 4, layout()).unwrap();

        assert!(matches!(
            region.write_slot(SlotKind::TopDown, &[0u8; 9]),
            Err(Error::Shm(ShmError::PayloadTooLarge { len: 9, capacity: 8 }))
        ));
    }

    #[test]
    fn test_stale_announcement_detected() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), 5, layout()).unwrap();

        let first = region.write_slot(SlotKind::TopDown, b"old").unwrap();
        // Single slot, so this overwrites the announced one
        region.write_slot(SlotKind::TopDown, b"new").unwrap();

        let mut out = ByteBuffer::new(64);
        assert!(matches!(
            region.read_announced(&first, &mut out),
            Err(Error::Shm(ShmError::TornRead))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_write_in_progress_detected() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), 6, layout()).unwrap();
        region.write_slot(SlotKind::ProcessedBinary, b"ok").unwrap();

        // Simulate a producer caught between its two sequence stores
        let slot = region.layout().slot_offset(SlotKind::ProcessedBinary, 0).unwrap();
        let seq = region.atomic_u64(slot);
        seq.store(seq.load(Ordering::Relaxed) + 1, Ordering::Relaxed);

        let mut out = ByteBuffer::new(64);
        assert!(matches!(
            region.read_slot(SlotKind::ProcessedBinary, 0, &mut out),
            Err(Error::Shm(ShmError::TornRead))
        ));

        // The next write recovers an even sequence
        let ann = region.write_slot(SlotKind::ProcessedBinary, b"again").unwrap();
        assert_eq!(ann.sequence % 2, 0);
    }

    #[test]
    fn test_bad_announcement_offset() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), 8, layout()).unwrap();
        let mut ann = region.write_slot(SlotKind::Camera, b"abc").unwrap();
        ann.offset += 4;

        let mut out = ByteBuffer::new(64);
        assert!(matches!(
            region.read_announced(&ann, &mut out),
            Err(Error::Shm(ShmError::BadAnnouncement(_)))
        ));
    }

    #[test]
    fn test_online_bitmask() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), 10, layout()).unwrap();
        let member = SharedRegion::attach(dir.path(), 10).unwrap();

        region.set_online(MemberId(1), true).unwrap();
        region.set_online(MemberId(15), true).unwrap();
        assert_eq!(member.online_members(), 0b1000_0000_0000_0010);
        assert!(member.is_online(MemberId(15)));

        region.set_online(MemberId(1), false).unwrap();
        assert!(!member.is_online(MemberId(1)));
        assert!(region.set_online(MemberId(16), true).is_err());
        assert!(!region.is_online(MemberId(16)));
    }

    #[test]
    fn test_announcement_payload() {
        let ann = SlotAnnouncement {
            kind: SlotKind::ProcessedBinary,
            index: 3,
            offset: 4096,
            len: 1000,
            sequence: 42,
        };
        let payload = ann.encode();
        assert_eq!(payload.len(), SlotAnnouncement::ENCODED_LEN);
        assert_eq!(SlotAnnouncement::decode(&payload).unwrap(), ann);

        let mut bad = payload.to_vec();
        bad[0] = 9;
        assert!(SlotAnnouncement::decode(&bad).is_err());
        assert!(SlotAnnouncement::decode(&payload[..19]).is_err());
    }
}
