// https://doc.dovecot.org/developer_manual/design/indexes/mail_index_api/ - Mail index API
//
// A Map is one self-consistent snapshot of a mailbox index: a fixed-layout header plus an array of
// fixed-size records, strictly ascending by UID. Several Maps may share one RecordMap (the record
// array) while readers hold older snapshots; the first write promotes the writer to a private
// copy. The RecordMap keeps weak back-references to every sharing Map so that flag-counter updates
// can fan out to all of them.

use byteorder::ByteOrder as _;
use std::{cell, rc};

// Record flag bits. DIRTY is internal bookkeeping: the flags couldn't be written to the backend
// yet and the record's flags override whatever the backend says.
pub const ANSWERED: u8 = 0x01;
pub const FLAGGED: u8 = 0x02;
pub const DELETED: u8 = 0x04;
pub const SEEN: u8 = 0x08;
pub const DRAFT: u8 = 0x10;
pub const DIRTY: u8 = 0x80;

// Header flag bits.
pub const HDR_HAVE_DIRTY: u32 = 0x01;
pub const HDR_FSCKD: u32 = 0x02;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
  pub indexid: u32,
  pub flags: u32,
  pub base_header_size: u32,
  pub header_size: u32,
  pub record_size: u32,
  pub messages_count: u32,
  pub next_uid: u32,
  pub seen_messages_count: u32,
  pub deleted_messages_count: u32,
  pub first_unseen_uid_lowwater: u32,
  pub first_deleted_uid_lowwater: u32,
  pub log_file_seq: u32,
  pub log_file_head_offset: u32,
  pub log_file_tail_offset: u32,
}

impl Header {
  // Encoded size of the fixed little-endian layout below. base_header_size may exceed it on disk;
  // the extra bytes only ever live in hdr_copy_buf and are reachable through header updates.
  pub const SIZE: u32 = 56;

  // Byte offsets of the fields writers patch through HEADER_UPDATE transactions.
  pub const MESSAGES_COUNT_OFFSET: u32 = 20;
  pub const NEXT_UID_OFFSET: u32 = 24;
  pub const LOG_FILE_TAIL_OFFSET_OFFSET: u32 = 52;

  pub fn encode(&self, buffer: &mut [u8]) {
    for (offset, value) in [
      (0, self.indexid),
      (4, self.flags),
      (8, self.base_header_size),
      (12, self.header_size),
      (16, self.record_size),
      (20, self.messages_count),
      (24, self.next_uid),
      (28, self.seen_messages_count),
      (32, self.deleted_messages_count),
      (36, self.first_unseen_uid_lowwater),
      (40, self.first_deleted_uid_lowwater),
      (44, self.log_file_seq),
      (48, self.log_file_head_offset),
      (52, self.log_file_tail_offset),
    ] {
      byteorder::LittleEndian::write_u32(&mut buffer[offset..offset + 4], value);
    }
  }

  pub fn decode(buffer: &[u8]) -> Self {
    let field = |offset: usize| byteorder::LittleEndian::read_u32(&buffer[offset..offset + 4]);
    Self {
      indexid: field(0),
      flags: field(4),
      base_header_size: field(8),
      header_size: field(12),
      record_size: field(16),
      messages_count: field(20),
      next_uid: field(24),
      seen_messages_count: field(28),
      deleted_messages_count: field(32),
      first_unseen_uid_lowwater: field(36),
      first_deleted_uid_lowwater: field(40),
      log_file_seq: field(44),
      log_file_head_offset: field(48),
      log_file_tail_offset: field(52),
    }
  }
}

// The typed prefix of every record; record_size - Record::SIZE trailing bytes belong to
// extensions and are zero-filled on append.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Record {
  pub uid: u32,
  pub flags: u8,
}

impl Record {
  // uid + flags + reserved padding, keeping extension data 4-byte aligned.
  pub const SIZE: u32 = 8;

  pub fn encode(&self, buffer: &mut [u8]) {
    byteorder::LittleEndian::write_u32(&mut buffer[0..4], self.uid);
    buffer[4] = self.flags;
    buffer[5..8].fill(0);
  }

  pub fn decode(buffer: &[u8]) -> Self {
    Self {
      uid: byteorder::LittleEndian::read_u32(&buffer[0..4]),
      flags: buffer[4],
    }
  }
}

fn record_range(record_size: u32, seq: u32) -> std::ops::Range<usize> {
  let start = (seq as usize - 1) * record_size as usize;
  start..start + record_size as usize
}

// The record array, reference-counted separately from Map: appends are visible to every sharing
// Map (each tracks how much of the array it considers synced through messages_count), while
// in-place rewrites require exclusive ownership first.
#[derive(Debug, Default)]
pub struct RecordMap {
  pub buffer: Vec<u8>,
  pub records_count: u32,
  pub last_appended_uid: u32,
  // Per-record modseqs, parallel to the records; empty until modseq tracking is enabled.
  pub modseqs: Vec<u64>,
  // Weak back-references, pruned opportunistically; never ownership.
  maps: Vec<rc::Weak<cell::RefCell<Map>>>,
}

impl RecordMap {
  pub fn record_bytes(&self, record_size: u32, seq: u32) -> &[u8] {
    &self.buffer[record_range(record_size, seq)]
  }

  pub fn record_bytes_mut(&mut self, record_size: u32, seq: u32) -> &mut [u8] {
    &mut self.buffer[record_range(record_size, seq)]
  }

  pub fn record(&self, record_size: u32, seq: u32) -> Record {
    Record::decode(self.record_bytes(record_size, seq))
  }

  pub fn set_flags(&mut self, record_size: u32, seq: u32, flags: u8) {
    self.record_bytes_mut(record_size, seq)[4] = flags;
  }

  // Expunges can shrink records_count without shrinking the buffer, so the append position is
  // derived from the count, never from the buffer length.
  pub fn append(&mut self, record_size: u32, record: &Record) {
    let range = record_range(record_size, self.records_count + 1);
    if self.buffer.len() < range.end {
      self.buffer.resize(range.end, 0);
    }
    let bytes = &mut self.buffer[range];
    bytes.fill(0);
    record.encode(bytes);
    self.records_count += 1;
    self.last_appended_uid = record.uid;
  }

  // A copy for exclusive ownership; the clone starts with no referring maps.
  pub fn private_copy(&self) -> Self {
    Self {
      buffer: self.buffer.clone(),
      records_count: self.records_count,
      last_appended_uid: self.last_appended_uid,
      modseqs: self.modseqs.clone(),
      maps: Vec::new(),
    }
  }

  pub fn register(&mut self, map: &MapRef) {
    self.maps.push(rc::Rc::downgrade(map));
  }

  pub fn unregister(&mut self, map: &MapRef) {
    self
      .maps
      .retain(|weak| weak.as_ptr() != rc::Rc::as_ptr(map));
  }

  // Upgrades the live back-references and prunes the dead ones.
  pub fn referring_maps(&mut self) -> Vec<MapRef> {
    let mut maps = Vec::with_capacity(self.maps.len());
    self.maps.retain(|weak| match weak.upgrade() {
      Some(map) => {
        maps.push(map);
        true
      }
      None => false,
    });
    maps
  }
}

pub type MapRef = rc::Rc<cell::RefCell<Map>>;
pub type RecordMapRef = rc::Rc<cell::RefCell<RecordMap>>;

#[derive(Debug)]
pub struct Map {
  pub hdr: Header,
  // The canonical byte image written back to storage; always header_size bytes. The fixed prefix
  // is refreshed from hdr when a sync finishes, extension header areas are live.
  pub hdr_copy_buf: Vec<u8>,
  pub rec_map: RecordMapRef,
  pub extensions: Vec<crate::extension::MapExtension>,
  pub highest_modseq: u64,
}

impl Map {
  // A fresh map: no messages, no extensions. The low-water marks start at u32::MAX ("no uid of
  // interest known yet") so the first unseen/deleted record pulls them down to its uid; the
  // all-seen and none-deleted transitions later clamp them to next_uid.
  pub fn alloc(indexid: u32) -> Self {
    let hdr = Header {
      indexid,
      flags: 0,
      base_header_size: Header::SIZE,
      header_size: Header::SIZE,
      record_size: Record::SIZE,
      messages_count: 0,
      next_uid: 1,
      seen_messages_count: 0,
      deleted_messages_count: 0,
      first_unseen_uid_lowwater: u32::MAX,
      first_deleted_uid_lowwater: u32::MAX,
      log_file_seq: 0,
      log_file_head_offset: 0,
      log_file_tail_offset: 0,
    };
    let mut hdr_copy_buf = vec![0; Header::SIZE as usize];
    hdr.encode(&mut hdr_copy_buf);
    Self {
      hdr,
      hdr_copy_buf,
      rec_map: rc::Rc::new(cell::RefCell::new(RecordMap::default())),
      extensions: Vec::new(),
      highest_modseq: 0,
    }
  }

  pub fn into_ref(self) -> MapRef {
    let rec_map = self.rec_map.clone();
    let reference = rc::Rc::new(cell::RefCell::new(self));
    rec_map.borrow_mut().register(&reference);
    reference
  }

  pub fn records_count(&self) -> u32 {
    self.rec_map.borrow().records_count
  }

  pub fn record(&self, seq: u32) -> Record {
    self.rec_map.borrow().record(self.hdr.record_size, seq)
  }

  // First and last sequence whose uids fall within uid1..=uid2, clamped to synced messages.
  pub fn lookup_seq_range(&self, uid1: u32, uid2: u32) -> Option<(u32, u32)> {
    let count = self.hdr.messages_count;
    if count == 0 || uid1 > uid2 {
      return None;
    }
    let rec_map = self.rec_map.borrow();
    let uid_at = |seq: u32| rec_map.record(self.hdr.record_size, seq).uid;
    // Smallest seq with uid >= uid1.
    let (mut low, mut high) = (1, count + 1);
    while low < high {
      let middle = low + (high - low) / 2;
      if uid_at(middle) < uid1 {
        low = middle + 1;
      } else {
        high = middle;
      }
    }
    if low > count || uid_at(low) > uid2 {
      return None;
    }
    let seq1 = low;
    // Smallest seq with uid > uid2; the range ends just before it.
    let (mut low, mut high) = (seq1, count + 1);
    while low < high {
      let middle = low + (high - low) / 2;
      if uid_at(middle) <= uid2 {
        low = middle + 1;
      } else {
        high = middle;
      }
    }
    Some((seq1, low - 1))
  }

  pub fn lookup_seq(&self, uid: u32) -> Option<u32> {
    if uid == 0 {
      return None;
    }
    self.lookup_seq_range(uid, uid).map(|(seq1, _)| seq1)
  }

  // Cheap structural validation of the finalized header; a full record scan is
  // check_invariants' job.
  pub fn check_header(&self) -> anyhow::Result<()> {
    let hdr = &self.hdr;
    anyhow::ensure!(
      hdr.base_header_size >= Header::SIZE && hdr.base_header_size <= hdr.header_size,
      "base header size {} out of range (header size {})",
      hdr.base_header_size,
      hdr.header_size,
    );
    anyhow::ensure!(
      self.hdr_copy_buf.len() == hdr.header_size as usize,
      "header copy is {} bytes, header size says {}",
      self.hdr_copy_buf.len(),
      hdr.header_size,
    );
    anyhow::ensure!(
      hdr.record_size >= Record::SIZE && hdr.record_size % 4 == 0,
      "invalid record size {}",
      hdr.record_size,
    );
    anyhow::ensure!(
      hdr.messages_count <= self.records_count(),
      "messages count {} exceeds records count {}",
      hdr.messages_count,
      self.records_count(),
    );
    anyhow::ensure!(
      hdr.seen_messages_count <= hdr.messages_count,
      "seen counter wrong"
    );
    anyhow::ensure!(
      hdr.deleted_messages_count <= hdr.messages_count,
      "deleted counter wrong"
    );
    anyhow::ensure!(hdr.next_uid > 0, "next_uid is zero");
    anyhow::ensure!(
      hdr.log_file_head_offset >= hdr.log_file_tail_offset,
      "head offset {} behind tail offset {}",
      hdr.log_file_head_offset,
      hdr.log_file_tail_offset,
    );
    Ok(())
  }

  // The quiescent-point invariants, by full scan. Debug builds run it after every sync; tests run
  // it after everything.
  pub fn check_invariants(&self, no_dirty: bool) -> anyhow::Result<()> {
    let hdr = &self.hdr;
    anyhow::ensure!(hdr.messages_count <= self.records_count());
    let (mut seen, mut deleted, mut dirty, mut previous_uid) = (0, 0, false, 0);
    for seq in 1..=hdr.messages_count {
      let record = self.record(seq);
      anyhow::ensure!(
        record.uid > previous_uid,
        "uid {} at seq {} is not ascending",
        record.uid,
        seq,
      );
      previous_uid = record.uid;
      anyhow::ensure!(record.uid < hdr.next_uid);
      if record.flags & SEEN != 0 {
        seen += 1;
      } else {
        anyhow::ensure!(
          record.uid >= hdr.first_unseen_uid_lowwater,
          "unseen uid {} below lowwater {}",
          record.uid,
          hdr.first_unseen_uid_lowwater,
        );
      }
      if record.flags & DELETED != 0 {
        deleted += 1;
        anyhow::ensure!(
          record.uid >= hdr.first_deleted_uid_lowwater,
          "deleted uid {} below lowwater {}",
          record.uid,
          hdr.first_deleted_uid_lowwater,
        );
      }
      dirty = dirty || record.flags & DIRTY != 0;
    }
    anyhow::ensure!(seen == hdr.seen_messages_count, "seen counter wrong");
    anyhow::ensure!(
      deleted == hdr.deleted_messages_count,
      "deleted counter wrong"
    );
    if dirty && !no_dirty {
      anyhow::ensure!(hdr.flags & HDR_HAVE_DIRTY != 0, "dirty flag lost");
    }
    Ok(())
  }
}

// A new Map sharing the record array; the record array learns about the newcomer so counter
// updates keep fanning out to it.
pub fn clone_map(map: &MapRef) -> MapRef {
  let cloned = {
    let map = map.borrow();
    Map {
      hdr: map.hdr,
      hdr_copy_buf: map.hdr_copy_buf.clone(),
      rec_map: map.rec_map.clone(),
      extensions: map.extensions.clone(),
      highest_modseq: map.highest_modseq,
    }
  };
  cloned.into_ref()
}
