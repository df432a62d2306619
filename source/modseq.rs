// Per-record modification sequences. The values live next to the records (RecordMap::modseqs,
// compacted together with them on expunge); each Map remembers the highest value it has seen.
// Tracking is off until explicitly enabled, and every hook is a no-op while it is off: setting a
// modseq before enabling is the one hard error, surfaced through SetOutcome::Disabled.

use crate::map;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOutcome {
  Applied,
  // The value was lower than what the record already carries.
  Ignored,
  Disabled,
}

// Fills in per-record storage for the records that predate enabling.
pub fn enable(map: &map::MapRef) {
  let map = map.borrow();
  let mut rec_map = map.rec_map.borrow_mut();
  let count = rec_map.records_count as usize;
  if rec_map.modseqs.len() < count {
    rec_map.modseqs.resize(count, 1);
  }
}

pub fn lookup(map: &map::Map, seq: u32) -> Option<u64> {
  map.rec_map.borrow().modseqs.get(seq as usize - 1).copied()
}

// One sync's modseq subcontext: begun by the sync context, notified on every structural change,
// ended by the driver before offsets are finalized.
#[derive(Debug)]
pub struct SyncCtx {
  enabled: bool,
  finished: bool,
}

impl SyncCtx {
  pub fn begin(enabled: bool) -> Self {
    Self {
      enabled,
      finished: false,
    }
  }

  pub fn enabled(&self) -> bool {
    self.enabled
  }

  // The sync swapped its working map; nothing is cached here, the data moved with the map.
  pub fn map_replaced(&mut self) {}

  pub fn append(&self, map: &map::MapRef) {
    if !self.enabled {
      return;
    }
    let mut map = map.borrow_mut();
    let modseq = map.highest_modseq + 1;
    map.highest_modseq = modseq;
    map.rec_map.borrow_mut().modseqs.push(modseq);
  }

  // Ranges use pre-compaction sequence numbers; the caller notifies highest range first so
  // earlier removals don't shift later ones.
  pub fn expunge(&self, map: &map::MapRef, seq1: u32, seq2: u32) {
    if !self.enabled {
      return;
    }
    let map = map.borrow();
    let mut rec_map = map.rec_map.borrow_mut();
    let end = (seq2 as usize).min(rec_map.modseqs.len());
    let start = (seq1 as usize - 1).min(end);
    rec_map.modseqs.drain(start..end);
  }

  // A flag change gives the whole range one new modseq; records already past it keep theirs.
  pub fn update_flags(&self, map: &map::MapRef, _changed_flags: u8, seq1: u32, seq2: u32) {
    if !self.enabled {
      return;
    }
    let mut map = map.borrow_mut();
    let modseq = map.highest_modseq + 1;
    map.highest_modseq = modseq;
    let mut rec_map = map.rec_map.borrow_mut();
    for seq in seq1..=seq2 {
      if let Some(current) = rec_map.modseqs.get_mut(seq as usize - 1) {
        *current = (*current).max(modseq);
      }
    }
  }

  pub fn set(&self, map: &map::MapRef, seq: u32, modseq: u64) -> SetOutcome {
    if !self.enabled {
      return SetOutcome::Disabled;
    }
    let mut map = map.borrow_mut();
    {
      let mut rec_map = map.rec_map.borrow_mut();
      if rec_map.modseqs.len() < seq as usize {
        let count = rec_map.records_count as usize;
        rec_map.modseqs.resize(count, 1);
      }
      let current = &mut rec_map.modseqs[seq as usize - 1];
      if modseq < *current {
        return SetOutcome::Ignored;
      }
      *current = modseq;
    }
    map.highest_modseq = map.highest_modseq.max(modseq);
    SetOutcome::Applied
  }

  pub fn end(&mut self) {
    self.finished = true;
  }

  pub fn finished(&self) -> bool {
    self.finished
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::map::{Map, Record};

  fn map_with_records(count: u32) -> map::MapRef {
    let mut map = Map::alloc(1);
    for uid in 1..=count {
      map
        .rec_map
        .borrow_mut()
        .append(map.hdr.record_size, &Record { uid, flags: 0 });
    }
    map.hdr.messages_count = count;
    map.hdr.next_uid = count + 1;
    map.into_ref()
  }

  #[test]
  fn disabled_hooks_are_inert() {
    let map = map_with_records(2);
    let mut ctx = SyncCtx::begin(false);
    assert!(!ctx.enabled());
    ctx.append(&map);
    ctx.update_flags(&map, map::SEEN, 1, 2);
    assert_eq!(SetOutcome::Disabled, ctx.set(&map, 1, 5));
    assert!(map.borrow().rec_map.borrow().modseqs.is_empty());
    ctx.end();
    assert!(ctx.finished());
  }

  #[test]
  fn set_applies_and_ignores() {
    let map = map_with_records(3);
    enable(&map);
    let ctx = SyncCtx::begin(true);
    assert_eq!(SetOutcome::Applied, ctx.set(&map, 2, 9));
    assert_eq!(9, map.borrow().highest_modseq);
    assert_eq!(SetOutcome::Ignored, ctx.set(&map, 2, 4));
    assert_eq!(Some(9), lookup(&map.borrow(), 2));
    assert_eq!(Some(1), lookup(&map.borrow(), 1));
  }

  #[test]
  fn flag_updates_and_appends_advance() {
    let map = map_with_records(2);
    enable(&map);
    let ctx = SyncCtx::begin(true);
    ctx.update_flags(&map, map::SEEN, 1, 2);
    assert_eq!(Some(1), lookup(&map.borrow(), 1));
    assert_eq!(1, map.borrow().highest_modseq);
    ctx.append(&map);
    assert_eq!(2, map.borrow().highest_modseq);
    assert_eq!(Some(2), lookup(&map.borrow(), 3));
  }

  #[test]
  fn expunge_compacts_storage() {
    let map = map_with_records(5);
    enable(&map);
    let ctx = SyncCtx::begin(true);
    for (seq, modseq) in [(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)] {
      assert_eq!(SetOutcome::Applied, ctx.set(&map, seq, modseq));
    }
    // Highest range first, like the expunge path does.
    ctx.expunge(&map, 4, 4);
    ctx.expunge(&map, 2, 2);
    assert_eq!(
      vec![10, 30, 50],
      map.borrow().rec_map.borrow().modseqs.clone()
    );
  }
}
