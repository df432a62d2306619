// Replaying one transaction at a time onto the working map. Corruption never aborts the whole
// sync: each reason is logged and collected, the current transaction is dropped, and the driver
// decides at the end whether the result needs an fsck. The context mediates copy-on-write: the
// working map is cloned away from other holders before the first write, and the record array is
// additionally unshared before anything rewrites records in place.

use crate::sync::SyncKind;
use crate::{extension, map, modseq, transaction};
use std::str;

// The transaction at hand couldn't be applied (the precise reason has already been reported
// through set_corrupted); the sync carries on with the next one.
#[derive(Debug)]
pub struct Corruption;

pub struct SyncContext<'a, V>
where
  V: transaction::LogView,
{
  pub index: &'a mut crate::Index,
  pub map: map::MapRef,
  pub log_view: V,
  pub kind: SyncKind,
  pub modseq: modseq::SyncCtx,
  // Position of the last extension intro, for the back-up rule when finalizing offsets.
  pub ext_intro_seq: u32,
  pub ext_intro_offset: u32,
  pub ext_intro_end_offset: u32,
  // Extension addressed by the latest intro; per-record extension transactions require it.
  pub cur_ext: Option<usize>,
  pub cur_ext_ignore: bool,
  pub unknown_extensions: Vec<String>,
  // (record_offset, record_size, registry index), resolved lazily on the first expunge.
  expunge_handlers: Option<Vec<(u32, u32, usize)>>,
  pub errors: bool,
  pub corruptions: Vec<String>,
}

impl<'a, V> SyncContext<'a, V>
where
  V: transaction::LogView,
{
  pub fn new(index: &'a mut crate::Index, map: map::MapRef, log_view: V, kind: SyncKind) -> Self {
    let modseq = modseq::SyncCtx::begin(index.modseq_enabled);
    Self {
      index,
      map,
      log_view,
      kind,
      modseq,
      ext_intro_seq: 0,
      ext_intro_offset: 0,
      ext_intro_end_offset: 0,
      cur_ext: None,
      cur_ext_ignore: false,
      unknown_extensions: Vec::new(),
      expunge_handlers: None,
      errors: false,
      corruptions: Vec::new(),
    }
  }

  pub fn set_corrupted(&mut self, reason: String) {
    log::error!("index {}: {reason}", self.index.indexid);
    self.errors = true;
    self.corruptions.push(reason);
  }

  fn referring_maps(&self) -> Vec<map::MapRef> {
    self.map.borrow().rec_map.borrow_mut().referring_maps()
  }

  // Swaps the working map; the outgoing map keeps offsets telling where its replay stopped, so
  // views still holding it can resume from there.
  pub fn replace_map(&mut self, new_map: map::MapRef) {
    self.update_log_offset(false);
    self.map = new_map;
    self.modseq.map_replaced();
  }

  // Other holders point at this map: clone it (but not the record array) before writing.
  pub fn private_map(&mut self) {
    if std::rc::Rc::strong_count(&self.map) > 1 {
      let new_map = map::clone_map(&self.map);
      self.replace_map(new_map);
    }
  }

  // For in-place record rewrites the record array must be exclusively ours too.
  pub fn atomic_map(&mut self) -> map::MapRef {
    self.private_map();
    let shared = {
      let map = self.map.borrow();
      std::rc::Rc::strong_count(&map.rec_map) > 1
    };
    if shared {
      let map = self.map.clone();
      let mut map = map.borrow_mut();
      let private = map.rec_map.borrow().private_copy();
      map.rec_map.borrow_mut().unregister(&self.map);
      map.rec_map = std::rc::Rc::new(std::cell::RefCell::new(private));
      map.rec_map.borrow_mut().register(&self.map);
      drop(map);
      self.modseq.map_replaced();
    }
    self.map.clone()
  }

  pub fn update_log_offset(&mut self, eol: bool) {
    let (prev_seq, mut prev_offset) = self.log_view.prev_pos();
    if prev_seq == 0 {
      // Handling lost changes in view syncing.
      return;
    }
    let mut map = self.map.borrow_mut();
    if !eol {
      if prev_offset == self.ext_intro_end_offset && prev_seq == self.ext_intro_seq {
        // The previous transaction was an extension intro; a view resuming from here still
        // needs it to interpret the extension records that follow, so back up over it. Never
        // done at end of log, or the intro would be synced over and over.
        prev_offset = self.ext_intro_offset;
      }
      map.hdr.log_file_seq = prev_seq;
    } else if map.hdr.log_file_seq != prev_seq {
      map.hdr.log_file_seq = prev_seq;
      map.hdr.log_file_tail_offset = 0;
    }
    map.hdr.log_file_head_offset = prev_offset;
  }

  fn header_update_counts(&mut self, uid: u32, old_flags: u8, new_flags: u8) {
    let next_uid = self.map.borrow().hdr.next_uid;
    if uid >= next_uid {
      self.set_corrupted(format!("uid {uid} >= next_uid {next_uid}"));
      return;
    }
    let result = update_counts(&mut self.map.borrow_mut().hdr, old_flags, new_flags);
    if let Err(error) = result {
      self.set_corrupted(error.to_string());
    }
  }

  // Flag changes fan out to every map sharing the record array, except maps that haven't synced
  // this record yet.
  fn header_update_counts_all(&mut self, uid: u32, old_flags: u8, new_flags: u8) {
    for reference in self.referring_maps() {
      let mut shared = reference.borrow_mut();
      if uid >= shared.hdr.next_uid {
        continue;
      }
      let result = update_counts(&mut shared.hdr, old_flags, new_flags);
      drop(shared);
      if let Err(error) = result {
        self.set_corrupted(error.to_string());
      }
    }
  }

  fn header_update_lowwaters(&mut self, uid: u32, flags: u8) {
    for reference in self.referring_maps() {
      let mut shared = reference.borrow_mut();
      if flags & map::SEEN == 0 && uid < shared.hdr.first_unseen_uid_lowwater {
        shared.hdr.first_unseen_uid_lowwater = uid;
      }
      if flags & map::DELETED != 0 && uid < shared.hdr.first_deleted_uid_lowwater {
        shared.hdr.first_deleted_uid_lowwater = uid;
      }
    }
  }

  fn sync_append(&mut self, record: &map::Record) -> Result<(), Corruption> {
    let next_uid = self.map.borrow().hdr.next_uid;
    if record.uid < next_uid {
      self.set_corrupted(format!(
        "Append with UID {}, but next_uid = {next_uid}",
        record.uid,
      ));
      return Err(Corruption);
    }
    self.private_map();
    let reference = self.map.clone();
    let mut appended = false;
    let new_flags = {
      let mut map = reference.borrow_mut();
      let record_size = map.hdr.record_size;
      let messages_count = map.hdr.messages_count;
      let mut rec_map = map.rec_map.borrow_mut();
      if record.uid <= rec_map.last_appended_uid {
        // This record was already staged past messages_count by an earlier partial sync; its
        // flags may have mutated since, so keep them or the flag counters break.
        if messages_count >= rec_map.records_count
          || rec_map.record(record_size, messages_count + 1).uid != record.uid
        {
          drop(rec_map);
          drop(map);
          self.set_corrupted(format!("Append with UID {} lost its staged record", record.uid));
          return Err(Corruption);
        }
        rec_map.record(record_size, messages_count + 1).flags
      } else {
        rec_map.append(record_size, record);
        appended = true;
        record.flags
      }
    };
    if appended {
      self.modseq.append(&reference);
    }
    {
      let mut map = reference.borrow_mut();
      map.hdr.messages_count += 1;
      map.hdr.next_uid = record.uid + 1;
      if new_flags & map::DIRTY != 0 && !self.index.options.no_dirty {
        map.hdr.flags |= map::HDR_HAVE_DIRTY;
      }
    }
    self.header_update_lowwaters(record.uid, new_flags);
    self.header_update_counts(record.uid, 0, new_flags);
    Ok(())
  }

  fn sync_flag_update(&mut self, update: &transaction::FlagUpdate) -> Result<(), Corruption> {
    let Some((seq1, seq2)) = self
      .map
      .borrow()
      .lookup_seq_range(update.uid1, update.uid2)
    else {
      return Ok(());
    };
    if !update.is_internal() {
      self.modseq.update_flags(
        &self.map,
        update.add_flags | update.remove_flags,
        seq1,
        seq2,
      );
    }
    if update.add_flags & map::DIRTY != 0 && !self.index.options.no_dirty {
      self.map.borrow_mut().hdr.flags |= map::HDR_HAVE_DIRTY;
    }
    let flag_mask = !update.remove_flags;
    if (update.add_flags | update.remove_flags) & (map::SEEN | map::DELETED) == 0 {
      // No counted or low-watered flags involved.
      let map = self.map.borrow();
      let record_size = map.hdr.record_size;
      let mut rec_map = map.rec_map.borrow_mut();
      for seq in seq1..=seq2 {
        let flags = rec_map.record(record_size, seq).flags;
        rec_map.set_flags(record_size, seq, (flags & flag_mask) | update.add_flags);
      }
    } else {
      for seq in seq1..=seq2 {
        let (uid, old_flags, new_flags, next_uid) = {
          let map = self.map.borrow();
          let record_size = map.hdr.record_size;
          let mut rec_map = map.rec_map.borrow_mut();
          let record = rec_map.record(record_size, seq);
          let new_flags = (record.flags & flag_mask) | update.add_flags;
          rec_map.set_flags(record_size, seq, new_flags);
          (record.uid, record.flags, new_flags, map.hdr.next_uid)
        };
        if uid >= next_uid {
          self.set_corrupted(format!("uid {uid} >= next_uid {next_uid}"));
          continue;
        }
        self.header_update_lowwaters(uid, new_flags);
        self.header_update_counts_all(uid, old_flags, new_flags);
      }
    }
    Ok(())
  }

  fn sync_header_update(&mut self, offset: u32, data: &[u8]) -> Result<(), Corruption> {
    let base_header_size = self.map.borrow().hdr.base_header_size;
    if u64::from(offset) + data.len() as u64 > u64::from(base_header_size) {
      self.set_corrupted(format!(
        "Header update outside range: {offset} + {} > {base_header_size}",
        data.len(),
      ));
      return Err(Corruption);
    }
    let reference = self.map.clone();
    let mut map = reference.borrow_mut();
    let orig_tail_offset = map.hdr.log_file_tail_offset;
    let orig_next_uid = map.hdr.next_uid;
    map.hdr_copy_buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    // Mirror the patch into the live struct where it overlaps the fixed layout.
    let mut image = [0; map::Header::SIZE as usize];
    map.hdr.encode(&mut image);
    if offset < map::Header::SIZE {
      let end = (offset as usize + data.len()).min(map::Header::SIZE as usize);
      image[offset as usize..end].copy_from_slice(&data[..end - offset as usize]);
    }
    map.hdr = map::Header::decode(&image);
    if map.hdr.next_uid < orig_next_uid {
      // Shrinking next_uid can happen in some race conditions; silently ignore it.
      map.hdr.next_uid = orig_next_uid;
    }
    // Tail offsets are the driver's to update, at the end of the sync.
    map.hdr.log_file_tail_offset = orig_tail_offset;
    Ok(())
  }

  fn call_expunge_handlers(&mut self, ranges: &[(u32, u32)]) {
    // Expunge handlers run only when syncing the index file itself.
    if self.kind != SyncKind::File {
      return;
    }
    if self.expunge_handlers.is_none() {
      let map = self.map.borrow();
      let resolved = self
        .index
        .expunge_handlers
        .iter()
        .enumerate()
        .filter_map(|(handler, (name, _))| {
          map
            .extensions
            .iter()
            .find(|ext| ext.name == *name)
            .map(|ext| (ext.record_offset, ext.record_size, handler))
        })
        .collect();
      drop(map);
      self.expunge_handlers = Some(resolved);
    }
    let handlers = self.expunge_handlers.clone().unwrap_or_default();
    for &(seq1, seq2) in ranges {
      for &(offset, size, handler) in &handlers {
        for seq in seq1..=seq2 {
          let map = self.map.borrow();
          let record_size = map.hdr.record_size;
          let rec_map = map.rec_map.borrow();
          let bytes = rec_map.record_bytes(record_size, seq);
          (self.index.expunge_handlers[handler].1)(
            &bytes[offset as usize..(offset + size) as usize],
          );
        }
      }
    }
  }

  // Compact-expunge: counters drop as if the records' flags were cleared, then the surviving
  // gaps between ranges move down into their final positions, then the tail stragglers.
  fn sync_expunge_ranges(&mut self, ranges: &[(u32, u32)]) -> Result<(), Corruption> {
    if ranges.is_empty() {
      return Ok(());
    }
    let reference = self.atomic_map();
    self.call_expunge_handlers(ranges);
    // Highest range first, so the tracker's parallel storage never sees shifted numbering.
    for &(seq1, seq2) in ranges.iter().rev() {
      self.modseq.expunge(&reference, seq1, seq2);
    }
    let record_size = reference.borrow().hdr.record_size as usize;
    let orig_count = reference.borrow().records_count();
    let (mut prev_seq2, mut dest_seq1) = (0, 1);
    for &(seq1, seq2) in ranges {
      debug_assert!(seq1 > prev_seq2 && seq1 <= seq2);
      for seq in seq1..=seq2 {
        let record = reference.borrow().record(seq);
        self.header_update_counts(record.uid, record.flags, 0);
      }
      if seq1 > prev_seq2 + 1 {
        let move_count = seq1 - 1 - prev_seq2;
        if prev_seq2 + 1 != dest_seq1 {
          let map = reference.borrow();
          let mut rec_map = map.rec_map.borrow_mut();
          let source = prev_seq2 as usize * record_size;
          let length = move_count as usize * record_size;
          let destination = (dest_seq1 as usize - 1) * record_size;
          rec_map.buffer.copy_within(source..source + length, destination);
        }
        dest_seq1 += move_count;
      }
      let seq_count = seq2 - seq1 + 1;
      {
        let map = reference.borrow();
        map.rec_map.borrow_mut().records_count -= seq_count;
      }
      reference.borrow_mut().hdr.messages_count -= seq_count;
      prev_seq2 = seq2;
    }
    if orig_count > prev_seq2 && prev_seq2 + 1 != dest_seq1 {
      let move_count = orig_count - prev_seq2;
      let map = reference.borrow();
      let mut rec_map = map.rec_map.borrow_mut();
      let source = prev_seq2 as usize * record_size;
      let length = move_count as usize * record_size;
      let destination = (dest_seq1 as usize - 1) * record_size;
      rec_map.buffer.copy_within(source..source + length, destination);
    }
    Ok(())
  }

  // True when the position we're replaying falls inside the transaction this process just
  // committed; its own modseq changes being ignored is then worth counting.
  fn update_is_within_commit(&self) -> bool {
    let Some(result) = &self.index.sync_commit_result else {
      return false;
    };
    let (seq, offset) = self.log_view.prev_pos();
    if seq != result.log_file_seq {
      return false;
    }
    let Some(start) = result.log_file_offset.checked_sub(result.commit_size) else {
      return false;
    };
    offset >= start && offset < result.log_file_offset
  }

  fn sync_modseq_updates(&mut self, data: &[u8]) -> Result<(), Corruption> {
    for chunk in data.chunks_exact(transaction::ModseqUpdate::SIZE as usize) {
      let update = transaction::ModseqUpdate::decode(chunk);
      let seq = if update.uid == 0 {
        // A global modseq bump; nothing per-record to set.
        continue;
      } else {
        match self.map.borrow().lookup_seq(update.uid) {
          Some(seq) => seq,
          None => continue,
        }
      };
      match self.modseq.set(&self.map, seq, update.modseq()) {
        modseq::SetOutcome::Applied => (),
        modseq::SetOutcome::Ignored => {
          if self.update_is_within_commit() {
            if let Some(result) = self.index.sync_commit_result.as_mut() {
              result.ignored_modseq_changes += 1;
            }
          }
        }
        modseq::SetOutcome::Disabled => {
          self.set_corrupted("modseqs updated before they were enabled".to_string());
          return Err(Corruption);
        }
      }
    }
    Ok(())
  }

  fn sync_keyword_update(&mut self, data: &[u8]) -> Result<(), Corruption> {
    if data.len() < 4 {
      self.set_corrupted("keyword update: invalid record size".to_string());
      return Err(Corruption);
    }
    let op = match data[0] {
      transaction::KEYWORD_OP_ADD => crate::KeywordOp::Add,
      transaction::KEYWORD_OP_REMOVE => crate::KeywordOp::Remove,
      other => {
        self.set_corrupted(format!("keyword update: invalid modify type {other}"));
        return Err(Corruption);
      }
    };
    let name_size = transaction::read_u16(data, 2) as usize;
    let name_end = 4 + name_size;
    if name_end > data.len() {
      self.set_corrupted("keyword update: invalid name size".to_string());
      return Err(Corruption);
    }
    let Ok(keyword) = str::from_utf8(&data[4..name_end]) else {
      self.set_corrupted("keyword update: name is not UTF-8".to_string());
      return Err(Corruption);
    };
    let keyword = keyword.to_string();
    let uids_start = (name_end + 3) & !3;
    if uids_start > data.len() || (data.len() - uids_start) % 8 != 0 {
      self.set_corrupted("keyword update: invalid uid range size".to_string());
      return Err(Corruption);
    }
    let uids: Vec<(u32, u32)> = data[uids_start..]
      .chunks_exact(8)
      .map(|chunk| (transaction::read_u32(chunk, 0), transaction::read_u32(chunk, 4)))
      .collect();
    if let Some(keywords) = self.index.keywords.as_mut() {
      keywords.update(&mut self.map.borrow_mut(), op, &keyword, &uids);
    }
    Ok(())
  }

  fn sync_keyword_reset(&mut self, data: &[u8]) -> Result<(), Corruption> {
    let uids: Vec<(u32, u32)> = data
      .chunks_exact(8)
      .map(|chunk| (transaction::read_u32(chunk, 0), transaction::read_u32(chunk, 4)))
      .collect();
    if let Some(keywords) = self.index.keywords.as_mut() {
      keywords.reset(&mut self.map.borrow_mut(), &uids);
    }
    Ok(())
  }

  // The central dispatch: one log record in, the map mutated accordingly.
  pub fn sync_record(
    &mut self,
    hdr: &transaction::Header,
    data: &[u8],
  ) -> Result<(), Corruption> {
    debug_assert_eq!(hdr.size as usize, data.len());
    match hdr.typ & transaction::TYPE_MASK {
      transaction::APPEND => {
        for chunk in data.chunks_exact(map::Record::SIZE as usize) {
          self.sync_append(&map::Record::decode(chunk))?;
        }
        Ok(())
      }
      typ
        if typ == transaction::EXPUNGE
          || typ == (transaction::EXPUNGE | transaction::EXPUNGE_PROT) =>
      {
        if hdr.typ & transaction::EXTERNAL == 0 {
          // Simply a request for expunge.
          return Ok(());
        }
        let mut ranges = Vec::new();
        for chunk in data.chunks_exact(transaction::Expunge::SIZE as usize) {
          let expunge = transaction::Expunge::decode(chunk);
          if let Some((seq1, seq2)) =
            self.map.borrow().lookup_seq_range(expunge.uid1, expunge.uid2)
          {
            seq_range_add(&mut ranges, seq1, seq2);
          }
        }
        self.sync_expunge_ranges(&ranges)
      }
      typ
        if typ == transaction::EXPUNGE_GUID
          || typ == (transaction::EXPUNGE_GUID | transaction::EXPUNGE_PROT) =>
      {
        if hdr.typ & transaction::EXTERNAL == 0 {
          return Ok(());
        }
        let mut ranges = Vec::new();
        for chunk in data.chunks_exact(transaction::ExpungeGuid::SIZE as usize) {
          let expunge = transaction::ExpungeGuid::decode(chunk);
          if expunge.uid == 0 {
            self.set_corrupted("expunge-guid: uid is zero".to_string());
            return Err(Corruption);
          }
          if let Some(seq) = self.map.borrow().lookup_seq(expunge.uid) {
            seq_range_add(&mut ranges, seq, seq);
          }
        }
        self.sync_expunge_ranges(&ranges)
      }
      transaction::FLAG_UPDATE => {
        for chunk in data.chunks_exact(transaction::FlagUpdate::SIZE as usize) {
          self.sync_flag_update(&transaction::FlagUpdate::decode(chunk))?;
        }
        Ok(())
      }
      transaction::HEADER_UPDATE => {
        let mut i = 0;
        while i < data.len() {
          if i + 4 > data.len() {
            self.set_corrupted("header update: invalid record size".to_string());
            return Err(Corruption);
          }
          let offset = transaction::read_u16(data, i) as usize;
          let size = transaction::read_u16(data, i + 2) as usize;
          if i + 4 + size > data.len() {
            self.set_corrupted("header update: invalid record size".to_string());
            return Err(Corruption);
          }
          self.sync_header_update(offset as u32, &data[i + 4..i + 4 + size])?;
          i = (i + 4 + size + 3) & !3;
        }
        Ok(())
      }
      transaction::EXT_INTRO => {
        let (seq, offset) = self.log_view.prev_pos();
        self.ext_intro_seq = seq;
        self.ext_intro_offset = offset;
        self.ext_intro_end_offset = offset + transaction::Header::SIZE + hdr.size;
        let mut i = 0;
        while i < data.len() {
          if i + transaction::ExtIntro::SIZE as usize > data.len() {
            // Should be just extra padding.
            break;
          }
          let intro = transaction::ExtIntro::decode(&data[i..]);
          let name_start = i + transaction::ExtIntro::SIZE as usize;
          let name_end = name_start + intro.name_size as usize;
          if name_end > data.len() {
            self.set_corrupted("ext intro: invalid name size".to_string());
            return Err(Corruption);
          }
          extension::sync_ext_intro(self, &intro, &data[name_start..name_end])?;
          i = (name_end + 3) & !3;
        }
        Ok(())
      }
      transaction::EXT_RESET => {
        if hdr.size < transaction::ExtReset::LEGACY_SIZE {
          self.set_corrupted("ext reset: invalid record size".to_string());
          return Err(Corruption);
        }
        // Old writers emitted only new_reset_id; the missing preserve_data byte reads as zero.
        let new_reset_id = transaction::read_u32(data, 0);
        let preserve_data = data.len() >= 5 && data[4] != 0;
        extension::sync_ext_reset(self, new_reset_id, preserve_data)
      }
      transaction::EXT_HDR_UPDATE => {
        let mut i = 0;
        while i < data.len() {
          if i + 4 > data.len() {
            self.set_corrupted("ext hdr update: invalid record size".to_string());
            return Err(Corruption);
          }
          let offset = transaction::read_u16(data, i) as u32;
          let size = transaction::read_u16(data, i + 2) as usize;
          if i + 4 + size > data.len() {
            self.set_corrupted("ext hdr update: invalid record size".to_string());
            return Err(Corruption);
          }
          extension::sync_ext_hdr_update(self, offset, &data[i + 4..i + 4 + size])?;
          i = (i + 4 + size + 3) & !3;
        }
        Ok(())
      }
      transaction::EXT_HDR_UPDATE32 => {
        let mut i = 0;
        while i < data.len() {
          if i + 8 > data.len() {
            self.set_corrupted("ext hdr update: invalid record size".to_string());
            return Err(Corruption);
          }
          let offset = transaction::read_u32(data, i);
          let size = transaction::read_u32(data, i + 4) as usize;
          if i + 8 + size > data.len() {
            self.set_corrupted("ext hdr update: invalid record size".to_string());
            return Err(Corruption);
          }
          extension::sync_ext_hdr_update(self, offset, &data[i + 8..i + 8 + size])?;
          i = (i + 8 + size + 3) & !3;
        }
        Ok(())
      }
      transaction::EXT_REC_UPDATE => {
        let Some(cur_ext) = self.cur_ext else {
          self.set_corrupted("Extension record updated without intro prefix".to_string());
          return Err(Corruption);
        };
        if self.cur_ext_ignore {
          return Ok(());
        }
        let ext_record_size = self.map.borrow().extensions[cur_ext].record_size as usize;
        // Each record is padded to 32 bits in the log.
        let stride = (4 + ext_record_size + 3) & !3;
        let mut i = 0;
        while i < data.len() {
          if i + stride > data.len() {
            self.set_corrupted("ext rec update: invalid record size".to_string());
            return Err(Corruption);
          }
          let uid = transaction::read_u32(data, i);
          extension::sync_ext_rec_update(self, uid, &data[i + 4..i + 4 + ext_record_size])?;
          i += stride;
        }
        Ok(())
      }
      transaction::EXT_ATOMIC_INC => {
        if self.cur_ext.is_none() {
          self.set_corrupted("Extension record updated without intro prefix".to_string());
          return Err(Corruption);
        }
        if self.cur_ext_ignore {
          return Ok(());
        }
        for chunk in data.chunks_exact(transaction::ExtAtomicInc::SIZE as usize) {
          extension::sync_ext_atomic_inc(self, &transaction::ExtAtomicInc::decode(chunk))?;
        }
        Ok(())
      }
      transaction::KEYWORD_UPDATE => self.sync_keyword_update(data),
      transaction::KEYWORD_RESET => self.sync_keyword_reset(data),
      transaction::MODSEQ_UPDATE => self.sync_modseq_updates(data),
      transaction::INDEX_DELETED => {
        if hdr.typ & transaction::EXTERNAL == 0 {
          // The next sync finishes the deletion; external ones are the log reader's business.
          self.index.delete_requested = true;
        }
        Ok(())
      }
      transaction::INDEX_UNDELETED => {
        self.index.delete_requested = false;
        Ok(())
      }
      transaction::BOUNDARY | transaction::ATTRIBUTE_UPDATE => Ok(()),
      unknown => {
        self.set_corrupted(format!("Unknown transaction record type 0x{unknown:x}"));
        Err(Corruption)
      }
    }
  }
}

fn update_counts(
  hdr: &mut map::Header,
  old_flags: u8,
  new_flags: u8,
) -> Result<(), &'static str> {
  if (old_flags ^ new_flags) & map::SEEN != 0 {
    if old_flags & map::SEEN != 0 {
      if hdr.seen_messages_count == 0 {
        return Err("Seen counter wrong");
      }
      hdr.seen_messages_count -= 1;
    } else {
      if hdr.seen_messages_count >= hdr.messages_count {
        return Err("Seen counter wrong");
      }
      hdr.seen_messages_count += 1;
      if hdr.seen_messages_count == hdr.messages_count {
        hdr.first_unseen_uid_lowwater = hdr.next_uid;
      }
    }
  }
  if (old_flags ^ new_flags) & map::DELETED != 0 {
    if old_flags & map::DELETED == 0 {
      hdr.deleted_messages_count += 1;
      if hdr.deleted_messages_count > hdr.messages_count {
        return Err("Deleted counter wrong");
      }
    } else {
      if hdr.deleted_messages_count == 0 || hdr.deleted_messages_count > hdr.messages_count {
        return Err("Deleted counter wrong");
      }
      hdr.deleted_messages_count -= 1;
      if hdr.deleted_messages_count == 0 {
        hdr.first_deleted_uid_lowwater = hdr.next_uid;
      }
    }
  }
  Ok(())
}

// Unions seq1..=seq2 into a sorted list of non-overlapping ranges, merging adjacent ones.
pub fn seq_range_add(ranges: &mut Vec<(u32, u32)>, seq1: u32, seq2: u32) {
  let mut merged = (seq1, seq2);
  let mut result = Vec::with_capacity(ranges.len() + 1);
  let mut inserted = false;
  for &(a, b) in ranges.iter() {
    if b.saturating_add(1) < merged.0 {
      result.push((a, b));
    } else if a > merged.1.saturating_add(1) {
      if !inserted {
        result.push(merged);
        inserted = true;
      }
      result.push((a, b));
    } else {
      merged.0 = merged.0.min(a);
      merged.1 = merged.1.max(b);
    }
  }
  if !inserted {
    result.push(merged);
  }
  *ranges = result;
}
