// The transaction log wire format: every mutation of the index is a log record of
// `Header + payload`, and the map is only ever changed by replaying those records. Payloads are
// 4-byte aligned; variable-length sub-records inside them are padded to 4 bytes too.
//
// The reader side is the `Log`/`LogView` pair; `MemoryLog` is the in-memory implementation
// (indexes can run entirely in memory, and tests drive syncs through it). File-backed readers
// live with the rest of the storage I/O, outside this crate.

use crate::map;
use byteorder::ByteOrder as _;

// Type bits of Header::typ. EXPUNGE_PROT is a protection pattern OR'd into expunge records so
// that a stray write is unlikely to look like one; both forms must be recognized.
pub const EXPUNGE: u32 = 0x00000001;
pub const APPEND: u32 = 0x00000002;
pub const FLAG_UPDATE: u32 = 0x00000004;
pub const HEADER_UPDATE: u32 = 0x00000020;
pub const EXT_INTRO: u32 = 0x00000040;
pub const EXT_RESET: u32 = 0x00000080;
pub const EXT_HDR_UPDATE: u32 = 0x00000100;
pub const EXT_REC_UPDATE: u32 = 0x00000200;
pub const KEYWORD_UPDATE: u32 = 0x00000400;
pub const KEYWORD_RESET: u32 = 0x00000800;
pub const EXT_ATOMIC_INC: u32 = 0x00001000;
pub const MODSEQ_UPDATE: u32 = 0x00002000;
pub const EXT_HDR_UPDATE32: u32 = 0x00004000;
pub const INDEX_DELETED: u32 = 0x00008000;
pub const INDEX_UNDELETED: u32 = 0x00010000;
pub const BOUNDARY: u32 = 0x00020000;
pub const ATTRIBUTE_UPDATE: u32 = 0x00040000;
pub const EXPUNGE_GUID: u32 = 0x00080000;

pub const TYPE_MASK: u32 = 0x0fffffff;
pub const EXPUNGE_PROT: u32 = 0x0000cd90;
// A completed change, as opposed to a request for one.
pub const EXTERNAL: u32 = 0x10000000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
  // Payload length in bytes, always a multiple of 4.
  pub size: u32,
  pub typ: u32,
}

impl Header {
  pub const SIZE: u32 = 8;
}

pub fn pad_to_4(payload: &mut Vec<u8>) {
  while payload.len() % 4 != 0 {
    payload.push(0);
  }
}

fn push_u32(payload: &mut Vec<u8>, value: u32) {
  let mut buffer = [0; 4];
  byteorder::LittleEndian::write_u32(&mut buffer, value);
  payload.extend_from_slice(&buffer);
}

fn push_u16(payload: &mut Vec<u8>, value: u16) {
  let mut buffer = [0; 2];
  byteorder::LittleEndian::write_u16(&mut buffer, value);
  payload.extend_from_slice(&buffer);
}

pub fn read_u32(payload: &[u8], offset: usize) -> u32 {
  byteorder::LittleEndian::read_u32(&payload[offset..offset + 4])
}

pub fn read_u16(payload: &[u8], offset: usize) -> u16 {
  byteorder::LittleEndian::read_u16(&payload[offset..offset + 2])
}

// APPEND payloads are a dense array of record prefixes; extension bytes of the appended records
// start out zero and are filled by later EXT_REC_UPDATEs.
pub fn push_append(payload: &mut Vec<u8>, record: &map::Record) {
  let mut buffer = [0; map::Record::SIZE as usize];
  record.encode(&mut buffer);
  payload.extend_from_slice(&buffer);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expunge {
  pub uid1: u32,
  pub uid2: u32,
}

impl Expunge {
  pub const SIZE: u32 = 8;

  pub fn decode(payload: &[u8]) -> Self {
    Self {
      uid1: read_u32(payload, 0),
      uid2: read_u32(payload, 4),
    }
  }

  pub fn push(&self, payload: &mut Vec<u8>) {
    push_u32(payload, self.uid1);
    push_u32(payload, self.uid2);
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpungeGuid {
  pub uid: u32,
  pub guid: [u8; 16],
}

impl ExpungeGuid {
  pub const SIZE: u32 = 20;

  pub fn decode(payload: &[u8]) -> Self {
    let mut guid = [0; 16];
    guid.copy_from_slice(&payload[4..20]);
    Self {
      uid: read_u32(payload, 0),
      guid,
    }
  }

  pub fn push(&self, payload: &mut Vec<u8>) {
    push_u32(payload, self.uid);
    payload.extend_from_slice(&self.guid);
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagUpdate {
  pub uid1: u32,
  pub uid2: u32,
  pub add_flags: u8,
  pub remove_flags: u8,
}

impl FlagUpdate {
  pub const SIZE: u32 = 12;

  // Internal updates only shuffle the DIRTY bookkeeping bit; they don't advance modseqs.
  pub fn is_internal(&self) -> bool {
    self.add_flags | self.remove_flags == map::DIRTY
  }

  pub fn decode(payload: &[u8]) -> Self {
    Self {
      uid1: read_u32(payload, 0),
      uid2: read_u32(payload, 4),
      add_flags: payload[8],
      remove_flags: payload[9],
    }
  }

  pub fn push(&self, payload: &mut Vec<u8>) {
    push_u32(payload, self.uid1);
    push_u32(payload, self.uid2);
    payload.extend_from_slice(&[self.add_flags, self.remove_flags, 0, 0]);
  }
}

// HEADER_UPDATE sub-record: offset/size prefix followed by the bytes to patch into the base
// header area.
pub fn push_header_update(payload: &mut Vec<u8>, offset: u16, data: &[u8]) {
  push_u16(payload, offset);
  push_u16(payload, data.len() as u16);
  payload.extend_from_slice(data);
  pad_to_4(payload);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtIntro {
  // u32::MAX introduces by name; anything else refers to an already-introduced extension.
  pub ext_id: u32,
  pub reset_id: u32,
  pub hdr_size: u32,
  pub record_size: u32,
  pub record_align: u32,
  pub name_size: u32,
}

impl ExtIntro {
  pub const SIZE: u32 = 24;

  pub fn decode(payload: &[u8]) -> Self {
    Self {
      ext_id: read_u32(payload, 0),
      reset_id: read_u32(payload, 4),
      hdr_size: read_u32(payload, 8),
      record_size: read_u32(payload, 12),
      record_align: read_u32(payload, 16),
      name_size: read_u32(payload, 20),
    }
  }

  pub fn push(&self, payload: &mut Vec<u8>, name: &str) {
    push_u32(payload, self.ext_id);
    push_u32(payload, self.reset_id);
    push_u32(payload, self.hdr_size);
    push_u32(payload, self.record_size);
    push_u32(payload, self.record_align);
    push_u32(payload, name.len() as u32);
    payload.extend_from_slice(name.as_bytes());
    pad_to_4(payload);
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtReset {
  pub new_reset_id: u32,
  pub preserve_data: bool,
}

impl ExtReset {
  pub const SIZE: u32 = 8;
  // Old writers emitted only new_reset_id.
  pub const LEGACY_SIZE: u32 = 4;

  pub fn push(&self, payload: &mut Vec<u8>) {
    push_u32(payload, self.new_reset_id);
    payload.extend_from_slice(&[u8::from(self.preserve_data), 0, 0, 0]);
  }
}

pub fn push_ext_hdr_update(payload: &mut Vec<u8>, offset: u16, data: &[u8]) {
  push_u16(payload, offset);
  push_u16(payload, data.len() as u16);
  payload.extend_from_slice(data);
  pad_to_4(payload);
}

pub fn push_ext_hdr_update32(payload: &mut Vec<u8>, offset: u32, data: &[u8]) {
  push_u32(payload, offset);
  push_u32(payload, data.len() as u32);
  payload.extend_from_slice(data);
  pad_to_4(payload);
}

// data must be exactly the record size declared by the preceding intro.
pub fn push_ext_rec_update(payload: &mut Vec<u8>, uid: u32, data: &[u8]) {
  push_u32(payload, uid);
  payload.extend_from_slice(data);
  pad_to_4(payload);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtAtomicInc {
  pub uid: u32,
  pub diff: i32,
}

impl ExtAtomicInc {
  pub const SIZE: u32 = 8;

  pub fn decode(payload: &[u8]) -> Self {
    Self {
      uid: read_u32(payload, 0),
      diff: read_u32(payload, 4) as i32,
    }
  }

  pub fn push(&self, payload: &mut Vec<u8>) {
    push_u32(payload, self.uid);
    push_u32(payload, self.diff as u32);
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModseqUpdate {
  pub uid: u32,
  pub modseq_low32: u32,
  pub modseq_high32: u32,
}

impl ModseqUpdate {
  pub const SIZE: u32 = 12;

  pub fn decode(payload: &[u8]) -> Self {
    Self {
      uid: read_u32(payload, 0),
      modseq_low32: read_u32(payload, 4),
      modseq_high32: read_u32(payload, 8),
    }
  }

  pub fn modseq(&self) -> u64 {
    (u64::from(self.modseq_high32) << 32) | u64::from(self.modseq_low32)
  }
}

pub fn push_modseq_update(payload: &mut Vec<u8>, uid: u32, modseq: u64) {
  push_u32(payload, uid);
  push_u32(payload, modseq as u32);
  push_u32(payload, (modseq >> 32) as u32);
}

pub const KEYWORD_OP_ADD: u8 = 1;
pub const KEYWORD_OP_REMOVE: u8 = 2;

pub fn push_keyword_update(payload: &mut Vec<u8>, op: u8, keyword: &str, uids: &[(u32, u32)]) {
  payload.extend_from_slice(&[op, 0]);
  push_u16(payload, keyword.len() as u16);
  payload.extend_from_slice(keyword.as_bytes());
  pad_to_4(payload);
  for &(uid1, uid2) in uids {
    push_u32(payload, uid1);
    push_u32(payload, uid2);
  }
}

pub fn push_keyword_reset(payload: &mut Vec<u8>, uids: &[(u32, u32)]) {
  for &(uid1, uid2) in uids {
    push_u32(payload, uid1);
    push_u32(payload, uid2);
  }
}

// Where the reader ended up after positioning: either a usable view (possibly telling the caller
// the log was recreated and the map must be rebuilt from scratch), or a precise reason the
// requested position no longer exists.
pub enum ViewSet<V> {
  Positioned { view: V, reset: bool },
  NotFound(String),
}

pub trait LogView {
  // The next record past the current position, or None at end of log.
  fn next(&mut self) -> anyhow::Result<Option<(Header, Vec<u8>)>>;
  // (file_seq, offset) of the start of the record most recently returned; past the last record
  // once next() has returned None; (0, 0) before any positioning.
  fn prev_pos(&self) -> (u32, u32);
}

#[derive(Clone, Copy, Debug)]
pub struct LogHead {
  pub file_seq: u32,
  pub prev_file_seq: u32,
  // Current write position, i.e. the size of the head file.
  pub last_size: u32,
  pub max_tail_offset: u32,
}

pub trait Log {
  type View<'a>: LogView
  where
    Self: 'a;

  fn view(&self, file_seq: u32, offset: u32) -> anyhow::Result<ViewSet<Self::View<'_>>>;
  fn head(&self) -> LogHead;
}

// Space reserved at the start of a log file for its own header; records start past it.
pub const FILE_HEADER_SIZE: u32 = 24;

#[derive(Debug)]
pub struct MemoryLog {
  file_seq: u32,
  // 0 once the history before file_seq is gone for good.
  prev_file_seq: u32,
  records: Vec<(u32, Header, Vec<u8>)>,
  end_offset: u32,
  max_tail_offset: u32,
}

impl MemoryLog {
  pub fn new(file_seq: u32) -> Self {
    Self {
      file_seq,
      prev_file_seq: 0,
      records: Vec::new(),
      end_offset: FILE_HEADER_SIZE,
      max_tail_offset: FILE_HEADER_SIZE,
    }
  }

  // Appends one transaction and returns its (start, end) offsets.
  pub fn append(&mut self, typ: u32, payload: &[u8]) -> (u32, u32) {
    assert!(payload.len() % 4 == 0, "payload must be 4-byte aligned");
    let offset = self.end_offset;
    self.records.push((
      offset,
      Header {
        size: payload.len() as u32,
        typ,
      },
      payload.to_vec(),
    ));
    self.end_offset = offset + Header::SIZE + payload.len() as u32;
    (offset, self.end_offset)
  }

  // Starts the log over, dropping all history: readers positioned anywhere in the old file learn
  // they must rebuild from scratch.
  pub fn reset(&mut self, file_seq: u32) {
    self.file_seq = file_seq;
    self.prev_file_seq = 0;
    self.records.clear();
    self.end_offset = FILE_HEADER_SIZE;
    self.max_tail_offset = FILE_HEADER_SIZE;
  }

  // Rotates to a new file while remembering the old one existed; readers still positioned in it
  // are told the log is lost.
  pub fn rotate(&mut self) {
    self.prev_file_seq = self.file_seq;
    self.file_seq += 1;
    self.records.clear();
    self.end_offset = FILE_HEADER_SIZE;
    self.max_tail_offset = FILE_HEADER_SIZE;
  }

  pub fn set_max_tail_offset(&mut self, offset: u32) {
    self.max_tail_offset = offset;
  }

  pub fn file_seq(&self) -> u32 {
    self.file_seq
  }

  pub fn end_offset(&self) -> u32 {
    self.end_offset
  }
}

pub struct MemoryView<'a> {
  log: &'a MemoryLog,
  position: usize,
  prev: (u32, u32),
}

impl Log for MemoryLog {
  type View<'a> = MemoryView<'a>
  where
    Self: 'a;

  fn view(&self, file_seq: u32, offset: u32) -> anyhow::Result<ViewSet<MemoryView<'_>>> {
    if file_seq == self.file_seq {
      let position = self
        .records
        .iter()
        .position(|&(record_offset, _, _)| record_offset >= offset)
        .unwrap_or(self.records.len());
      let prev_offset = match self.records.get(position) {
        Some(&(record_offset, _, _)) => record_offset,
        None => self.end_offset,
      };
      Ok(ViewSet::Positioned {
        view: MemoryView {
          log: self,
          position,
          prev: (self.file_seq, prev_offset),
        },
        reset: false,
      })
    } else if file_seq < self.file_seq && self.prev_file_seq == 0 {
      // The history before this file is gone (first sync ever, or the log was recreated); the
      // caller replays the current file from its beginning onto a fresh map.
      Ok(ViewSet::Positioned {
        view: MemoryView {
          log: self,
          position: 0,
          prev: (self.file_seq, FILE_HEADER_SIZE),
        },
        reset: true,
      })
    } else {
      Ok(ViewSet::NotFound(format!(
        "file seq {file_seq} not reachable (head {}, previous {})",
        self.file_seq, self.prev_file_seq,
      )))
    }
  }

  fn head(&self) -> LogHead {
    LogHead {
      file_seq: self.file_seq,
      prev_file_seq: self.prev_file_seq,
      last_size: self.end_offset,
      max_tail_offset: self.max_tail_offset,
    }
  }
}

impl LogView for MemoryView<'_> {
  fn next(&mut self) -> anyhow::Result<Option<(Header, Vec<u8>)>> {
    match self.log.records.get(self.position) {
      Some((offset, header, payload)) => {
        self.prev = (self.log.file_seq, *offset);
        self.position += 1;
        Ok(Some((*header, payload.clone())))
      }
      None => {
        self.prev = (self.log.file_seq, self.log.end_offset);
        Ok(None)
      }
    }
  }

  fn prev_pos(&self) -> (u32, u32) {
    self.prev
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flag_update_roundtrip() {
    let update = FlagUpdate {
      uid1: 3,
      uid2: 9,
      add_flags: map::SEEN,
      remove_flags: map::DRAFT,
    };
    let mut payload = Vec::new();
    update.push(&mut payload);
    assert_eq!(FlagUpdate::SIZE as usize, payload.len());
    assert_eq!(update, FlagUpdate::decode(&payload));
    assert!(!update.is_internal());
    assert!(FlagUpdate {
      uid1: 1,
      uid2: 1,
      add_flags: map::DIRTY,
      remove_flags: 0,
    }
    .is_internal());
  }

  #[test]
  fn ext_intro_pads_name() {
    let intro = ExtIntro {
      ext_id: u32::MAX,
      reset_id: 0,
      hdr_size: 4,
      record_size: 2,
      record_align: 2,
      name_size: 5,
    };
    let mut payload = Vec::new();
    intro.push(&mut payload, "cache");
    assert_eq!(0, payload.len() % 4);
    assert_eq!(intro, ExtIntro::decode(&payload));
    assert_eq!(b"cache", &payload[ExtIntro::SIZE as usize..][..5]);
  }

  #[test]
  fn modseq_update_splits_and_joins() {
    let mut payload = Vec::new();
    push_modseq_update(&mut payload, 7, 0x1_0000_0002);
    let update = ModseqUpdate::decode(&payload);
    assert_eq!(7, update.uid);
    assert_eq!(0x1_0000_0002, update.modseq());
  }

  #[test]
  fn memory_log_positions_and_walks() {
    let mut log = MemoryLog::new(1);
    let (first, _) = log.append(APPEND | EXTERNAL, &[0; 8]);
    let (second, end) = log.append(FLAG_UPDATE, &[0; 12]);
    assert_eq!(FILE_HEADER_SIZE, first);
    assert_eq!(FILE_HEADER_SIZE + Header::SIZE + 8, second);

    let ViewSet::Positioned { mut view, reset } = log.view(1, 0).unwrap() else {
      panic!("expected a positioned view");
    };
    assert!(!reset);
    let (header, payload) = view.next().unwrap().unwrap();
    assert_eq!(APPEND | EXTERNAL, header.typ);
    assert_eq!(8, payload.len());
    assert_eq!((1, first), view.prev_pos());
    view.next().unwrap().unwrap();
    assert_eq!((1, second), view.prev_pos());
    assert!(view.next().unwrap().is_none());
    assert_eq!((1, end), view.prev_pos());

    // Positioning past the first record skips it.
    let ViewSet::Positioned { mut view, .. } = log.view(1, second).unwrap() else {
      panic!("expected a positioned view");
    };
    let (header, _) = view.next().unwrap().unwrap();
    assert_eq!(FLAG_UPDATE, header.typ);
  }

  #[test]
  fn memory_log_reset_and_lost() {
    let mut log = MemoryLog::new(3);
    log.append(BOUNDARY, &[]);
    // A position in a file predating all history means replay from scratch.
    assert!(matches!(
      log.view(1, 100).unwrap(),
      ViewSet::Positioned { reset: true, .. }
    ));
    log.rotate();
    // The previous file is known but gone.
    assert!(matches!(log.view(3, 24).unwrap(), ViewSet::NotFound(_)));
    assert!(matches!(log.view(5, 0).unwrap(), ViewSet::NotFound(_)));
    log.reset(6);
    assert!(matches!(
      log.view(4, 0).unwrap(),
      ViewSet::Positioned { reset: true, .. }
    ));
  }
}
