// The sync driver: position a log view at the right offset, replay every transaction past it,
// then finalize offsets and the header image. Per-record corruption never aborts the replay; the
// driver finishes the map regardless and hands it to fsck when anything was reported. A FILE sync
// advances the index's own map; a VIEW sync advances a reader's older map up to the log head.

use crate::{map, transaction, Index};
use crate::transaction::LogView;
use anyhow::Context as _;

pub mod update;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncKind {
  File,
  View,
}

#[derive(Debug)]
pub struct SyncResult {
  pub map: map::MapRef,
  // Non-fatal: the log no longer reaches the map's position, so nothing was replayed.
  pub lost_log: Option<String>,
  pub corruptions: Vec<String>,
}

fn is_before(seq: u32, offset: u32, than_seq: u32, than_offset: u32) -> bool {
  seq < than_seq || (seq == than_seq && offset < than_offset)
}

// HAVE_DIRTY was cleared for the duration of the sync; put it back iff some record still
// carries DIRTY.
fn restore_dirty_flag(map: &map::MapRef, no_dirty: bool) {
  let mut map = map.borrow_mut();
  if map.hdr.flags & map::HDR_HAVE_DIRTY != 0 || no_dirty {
    return;
  }
  for seq in 1..=map.records_count() {
    if map.record(seq).flags & map::DIRTY != 0 {
      map.hdr.flags |= map::HDR_HAVE_DIRTY;
      break;
    }
  }
}

// Advisory: true when replaying the unread log tail would cost more than re-reading the whole
// index from storage.
pub fn wants_reopen<L>(index: &Index, log: &L, kind: SyncKind) -> bool
where
  L: transaction::Log,
{
  let Some(map) = &index.map else {
    return true;
  };
  let map = map.borrow();
  let head = log.head();
  if head.file_seq != map.hdr.log_file_seq {
    return true;
  }
  let start_offset = u64::from(match kind {
    SyncKind::File => map.hdr.log_file_tail_offset,
    SyncKind::View => map.hdr.log_file_head_offset,
  });
  let index_size = u64::from(map.hdr.header_size)
    + u64::from(map.records_count()) * u64::from(map.hdr.record_size);
  let log_size = u64::from(head.last_size);
  log_size > start_offset && log_size - start_offset > index_size
}

// Replays the log onto the map and returns the updated, self-consistent result. For FILE syncs
// the map is taken out of (and finally installed back into) the index's slot, so the sync view
// is the only strong holder and single-owner promotion stays observable; `view_map` is only for
// VIEW syncs. I/O failures from the log view are hard errors, but even they finalize the map
// first.
pub fn sync_map<L>(
  index: &mut Index,
  log: &L,
  kind: SyncKind,
  view_map: Option<map::MapRef>,
) -> anyhow::Result<SyncResult>
where
  L: transaction::Log,
{
  let map = match kind {
    SyncKind::File => index.map.take().context("index has no map")?,
    SyncKind::View => view_map.context("view sync without a map")?,
  };
  let (file_seq, start_offset) = {
    let map = map.borrow();
    let start_offset = match kind {
      SyncKind::File => map.hdr.log_file_tail_offset,
      SyncKind::View => map.hdr.log_file_head_offset,
    };
    (map.hdr.log_file_seq, start_offset)
  };

  let (view, reset) = match log.view(file_seq, start_offset) {
    Err(error) => {
      if kind == SyncKind::File {
        index.map = Some(map);
      }
      return Err(error.context("opening the log view"));
    }
    Ok(transaction::ViewSet::Positioned { view, reset }) => (view, reset),
    Ok(transaction::ViewSet::NotFound(reason)) => {
      // The seq/offset is probably broken; not fatal, the caller decides what to rebuild.
      let reason = format!("Lost log for seq={file_seq} offset={start_offset}: {reason}");
      log::warn!("index {}: {reason}", index.indexid);
      if kind == SyncKind::File {
        index.map = Some(map.clone());
      }
      return Ok(SyncResult {
        map,
        lost_log: Some(reason),
        corruptions: Vec::new(),
      });
    }
  };

  // Reading much more from the log than the index's own size means we'd prefer the index file
  // rewritten soon.
  let head = log.head();
  {
    let map = map.borrow();
    if head.file_seq != map.hdr.log_file_seq
      || head.last_size.saturating_sub(map.hdr.log_file_tail_offset)
        > index.options.rewrite_min_log_bytes
    {
      index.want_rewrite = true;
    }
  }

  let had_dirty = map.borrow().hdr.flags & map::HDR_HAVE_DIRTY != 0;
  if had_dirty {
    map.borrow_mut().hdr.flags &= !map::HDR_HAVE_DIRTY;
  }

  let mut io_error = None;
  let (final_map, errors, corruptions) = {
    let mut ctx = update::SyncContext::new(index, map, view, kind);
    if reset {
      // The log was recreated: rebuild from scratch, keeping only the identity and the fsck
      // marker, and replay the current file from its beginning.
      let (prev_seq, _) = ctx.log_view.prev_pos();
      let mut fresh = map::Map::alloc(ctx.index.indexid);
      if ctx.map.borrow().hdr.flags & map::HDR_FSCKD != 0 {
        fresh.hdr.flags |= map::HDR_FSCKD;
      }
      fresh.hdr.log_file_seq = prev_seq;
      fresh.hdr.log_file_tail_offset = 0;
      ctx.replace_map(fresh.into_ref());
    }
    loop {
      let (hdr, data) = match ctx.log_view.next() {
        Ok(Some(record)) => record,
        Ok(None) => break,
        Err(error) => {
          io_error = Some(error);
          break;
        }
      };
      let (seq, offset) = ctx.log_view.prev_pos();
      let (map_seq, map_offset) = {
        let map = ctx.map.borrow();
        (map.hdr.log_file_seq, map.hdr.log_file_head_offset)
      };
      if is_before(seq, offset, map_seq, map_offset) {
        // Already synced; file syncs re-read from the tail offset, so this is expected there.
        debug_assert_eq!(SyncKind::File, kind);
        continue;
      }
      // Broken entries are skipped; ctx.errors decides about fsck below.
      let _ = ctx.sync_record(&hdr, &data);
    }
    if had_dirty {
      restore_dirty_flag(&ctx.map, ctx.index.options.no_dirty);
    }
    ctx.modseq.end();
    ctx.update_log_offset(true);
    let corruptions = std::mem::take(&mut ctx.corruptions);
    (ctx.map.clone(), ctx.errors, corruptions)
  };

  {
    let mut map = final_map.borrow_mut();
    debug_assert_eq!(head.file_seq, map.hdr.log_file_seq);
    // The log tracks the tail offset internally too, skipping over external transactions that
    // header updates alone wouldn't.
    if map.hdr.log_file_tail_offset < head.max_tail_offset {
      map.hdr.log_file_tail_offset = head.max_tail_offset;
    }
    let hdr = map.hdr;
    hdr.encode(&mut map.hdr_copy_buf[..map::Header::SIZE as usize]);
  }

  if cfg!(debug_assertions) && !errors {
    if let Err(error) = final_map.borrow().check_invariants(index.options.no_dirty) {
      log::error!("index {}: sync broke the map: {error:#}", index.indexid);
    }
  }

  // Restore the slot we took; also what makes the result visible to fsck.
  if kind == SyncKind::File {
    index.map = Some(final_map.clone());
  }

  let mut result_map = final_map;
  let header_error = result_map.borrow().check_header().err();
  let needs_fsck = match header_error {
    Some(error) => {
      log::error!(
        "index {}: Synchronization corrupted index header: {error:#}",
        index.indexid,
      );
      true
    }
    None => errors,
  };
  if needs_fsck {
    match index.fsck {
      Some(fsck) => {
        if let Err(error) = fsck(index) {
          log::error!("index {}: fsck failed: {error:#}", index.indexid);
        }
        if let Some(fixed) = &index.map {
          result_map = fixed.clone();
        }
      }
      None => log::warn!("index {}: requires fsck, but none is registered", index.indexid),
    }
  }

  if let Some(error) = io_error {
    return Err(error);
  }
  Ok(SyncResult {
    map: result_map,
    lost_log: None,
    corruptions,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transaction::MemoryLog;
  use crate::Options;

  #[test]
  fn positions_compare_by_seq_then_offset() {
    assert!(is_before(1, 100, 2, 0));
    assert!(is_before(2, 10, 2, 11));
    assert!(!is_before(2, 11, 2, 11));
    assert!(!is_before(3, 0, 2, 100));
  }

  #[test]
  fn dirty_flag_restored_only_when_still_dirty() {
    let map = {
      let mut map = map::Map::alloc(1);
      map
        .rec_map
        .borrow_mut()
        .append(map.hdr.record_size, &map::Record { uid: 1, flags: 0 });
      map.hdr.messages_count = 1;
      map.hdr.next_uid = 2;
      map.into_ref()
    };
    restore_dirty_flag(&map, false);
    assert_eq!(0, map.borrow().hdr.flags & map::HDR_HAVE_DIRTY);
    {
      let reference = map.borrow();
      let record_size = reference.hdr.record_size;
      reference
        .rec_map
        .borrow_mut()
        .set_flags(record_size, 1, map::DIRTY);
    }
    restore_dirty_flag(&map, true);
    assert_eq!(0, map.borrow().hdr.flags & map::HDR_HAVE_DIRTY);
    restore_dirty_flag(&map, false);
    assert_ne!(0, map.borrow().hdr.flags & map::HDR_HAVE_DIRTY);
  }

  #[test]
  fn reopen_advised_when_log_tail_dwarfs_index() {
    let mut index = crate::Index::new(1, Options::default());
    let mut log = MemoryLog::new(1);
    {
      let map = index.map.as_ref().unwrap();
      let mut map = map.borrow_mut();
      map.hdr.log_file_seq = 1;
      map.hdr.log_file_tail_offset = transaction::FILE_HEADER_SIZE;
      map.hdr.log_file_head_offset = transaction::FILE_HEADER_SIZE;
    }
    assert!(!wants_reopen(&index, &log, SyncKind::File));
    // An empty index is 56 bytes of header; outgrow it.
    for _ in 0..10 {
      log.append(transaction::BOUNDARY, &[0; 16]);
    }
    assert!(wants_reopen(&index, &log, SyncKind::File));
  }
}
