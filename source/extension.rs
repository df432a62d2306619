// Extensions claim a slice of every record and a slice of the header copy; the log introduces
// (or renegotiates) their schema through EXT_INTRO records before touching their data. The engine
// owns the per-map extension table, the area resizing it implies, and the dispatch to hooks
// registered on the index. Hooks are optional: an extension nobody registered still has its data
// carried through syncs untouched.

use crate::sync::update::{Corruption, SyncContext};
use crate::{map, transaction};
use std::str;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapExtension {
  pub name: String,
  pub reset_id: u32,
  // Offset into hdr_copy_buf; the area is hdr_size bytes, stored 4-byte aligned.
  pub hdr_offset: u32,
  pub hdr_size: u32,
  // Offset into each record; 0 when the extension has no per-record data.
  pub record_offset: u32,
  pub record_size: u32,
  pub record_align: u32,
}

// Per-extension behavior, registered on the index at init. Every method defaults to a no-op; the
// engine has already applied the data change when a hook runs.
pub trait Hooks {
  fn intro(&mut self, _ext: &MapExtension) {}
  fn reset(&mut self, _ext: &MapExtension, _new_reset_id: u32, _preserve_data: bool) {}
  fn hdr_update(&mut self, _ext: &MapExtension, _offset: u32, _data: &[u8]) {}
  fn rec_update(&mut self, _ext: &MapExtension, _seq: u32, _data: &[u8]) {}
  fn atomic_inc(&mut self, _ext: &MapExtension, _seq: u32, _value: u64) {}
}

fn align4(value: u32) -> u32 {
  (value + 3) & !3
}

fn align_to(value: u32, alignment: u32) -> u32 {
  (value + alignment - 1) & !(alignment - 1)
}

// Rebuilds the record buffer with a new stride, translating each record through `copy`.
fn rebuild_records(
  map: &mut map::Map,
  new_record_size: u32,
  copy: impl Fn(&[u8], &mut [u8]),
) {
  let old_record_size = map.hdr.record_size;
  let mut rec_map = map.rec_map.borrow_mut();
  let count = rec_map.records_count;
  let mut buffer = vec![0; count as usize * new_record_size as usize];
  for seq in 1..=count {
    let old = rec_map.record_bytes(old_record_size, seq);
    let start = (seq as usize - 1) * new_record_size as usize;
    copy(old, &mut buffer[start..start + new_record_size as usize]);
  }
  rec_map.buffer = buffer;
  drop(rec_map);
  map.hdr.record_size = new_record_size;
}

// Lays the extension record areas out again (after a size or alignment renegotiation) and moves
// every record's extension bytes to their new offsets, truncating or zero-filling as needed.
// `old` is the (record_offset, record_size) table as it was before the renegotiation; extensions
// it doesn't cover start out zeroed.
fn reorder_records(map: &mut map::Map, old: &[(u32, u32)]) {
  let mut end = map::Record::SIZE;
  for ext in &mut map.extensions {
    if ext.record_size == 0 {
      ext.record_offset = 0;
      continue;
    }
    ext.record_offset = align_to(end, ext.record_align.max(1));
    end = ext.record_offset + ext.record_size;
  }
  let new: Vec<(u32, u32)> = map
    .extensions
    .iter()
    .map(|ext| (ext.record_offset, ext.record_size))
    .collect();
  rebuild_records(map, align4(end), |old_record, new_record| {
    new_record[..map::Record::SIZE as usize]
      .copy_from_slice(&old_record[..map::Record::SIZE as usize]);
    for (&(old_offset, old_size), &(new_offset, new_size)) in old.iter().zip(&new) {
      let size = old_size.min(new_size) as usize;
      if size == 0 {
        continue;
      }
      new_record[new_offset as usize..new_offset as usize + size]
        .copy_from_slice(&old_record[old_offset as usize..old_offset as usize + size]);
    }
  });
}

// Grows (or shrinks) one extension's header area in hdr_copy_buf, shifting the areas behind it.
fn resize_hdr_area(map: &mut map::Map, index: usize, new_hdr_size: u32) {
  let ext = &map.extensions[index];
  let old_aligned = align4(ext.hdr_size);
  let new_aligned = align4(new_hdr_size);
  let area_start = ext.hdr_offset as usize;
  if new_aligned > old_aligned {
    let grow = (new_aligned - old_aligned) as usize;
    let at = area_start + old_aligned as usize;
    map.hdr_copy_buf.splice(at..at, std::iter::repeat(0).take(grow));
  } else if new_aligned < old_aligned {
    let at = area_start + new_aligned as usize;
    map.hdr_copy_buf.drain(at..at + (old_aligned - new_aligned) as usize);
  }
  let delta = new_aligned as i64 - old_aligned as i64;
  map.hdr.header_size = (i64::from(map.hdr.header_size) + delta) as u32;
  map.extensions[index].hdr_size = new_hdr_size;
  for later in map.extensions.iter_mut().skip(index + 1) {
    later.hdr_offset = (i64::from(later.hdr_offset) + delta) as u32;
  }
}

fn hooks_for<'a>(
  index: &'a mut crate::Index,
  name: &str,
) -> Option<&'a mut Box<dyn Hooks>> {
  index
    .extensions
    .iter_mut()
    .find(|(hook_name, _)| hook_name == name)
    .map(|(_, hooks)| hooks)
}

pub fn sync_ext_intro<V>(
  ctx: &mut SyncContext<'_, V>,
  intro: &transaction::ExtIntro,
  name: &[u8],
) -> Result<(), Corruption>
where
  V: transaction::LogView,
{
  let Ok(name) = str::from_utf8(name) else {
    ctx.set_corrupted("ext intro: name is not UTF-8".to_string());
    return Err(Corruption);
  };
  let name = name.to_string();

  let existing = if intro.ext_id != u32::MAX {
    let index = intro.ext_id as usize;
    let known = ctx
      .map
      .borrow()
      .extensions
      .get(index)
      .map(|ext| ext.name.clone());
    match known {
      None => {
        ctx.set_corrupted(format!("ext intro: invalid extension id {}", intro.ext_id));
        return Err(Corruption);
      }
      Some(known) if !name.is_empty() && known != name => {
        ctx.set_corrupted(format!(
          "ext intro: id {} is {known:?}, not {name:?}",
          intro.ext_id,
        ));
        return Err(Corruption);
      }
      Some(_) => (),
    }
    Some(index)
  } else if name.is_empty() {
    ctx.set_corrupted("ext intro: no id and no name".to_string());
    return Err(Corruption);
  } else {
    ctx.map.borrow().extensions.iter().position(|ext| ext.name == name)
  };

  if intro.record_size > 0 && !intro.record_align.is_power_of_two() {
    ctx.set_corrupted(format!(
      "ext intro: invalid record align {} for {name:?}",
      intro.record_align,
    ));
    return Err(Corruption);
  }

  let (index, ignore) = match existing {
    Some(index) => {
      let (hdr_changed, record_changed, reset_id) = {
        let map = ctx.map.borrow();
        let ext = &map.extensions[index];
        (
          ext.hdr_size != intro.hdr_size,
          ext.record_size != intro.record_size || ext.record_align != intro.record_align,
          ext.reset_id,
        )
      };
      if hdr_changed || record_changed {
        ctx.atomic_map();
        let map = ctx.map.clone();
        let mut map = map.borrow_mut();
        if hdr_changed {
          resize_hdr_area(&mut map, index, intro.hdr_size);
        }
        if record_changed {
          let old: Vec<(u32, u32)> = map
            .extensions
            .iter()
            .map(|ext| (ext.record_offset, ext.record_size))
            .collect();
          map.extensions[index].record_size = intro.record_size;
          map.extensions[index].record_align = intro.record_align;
          reorder_records(&mut map, &old);
        }
      }
      // A mismatching reset id means the extension data predates a reset we haven't replayed
      // yet; its updates are stale until the reset arrives.
      (index, intro.reset_id != 0 && intro.reset_id != reset_id)
    }
    None => {
      ctx.atomic_map();
      let map = ctx.map.clone();
      let mut map = map.borrow_mut();
      let old: Vec<(u32, u32)> = map
        .extensions
        .iter()
        .map(|ext| (ext.record_offset, ext.record_size))
        .collect();
      let hdr_offset = map.hdr.header_size;
      let aligned = align4(intro.hdr_size) as usize;
      map.hdr_copy_buf.extend(std::iter::repeat(0).take(aligned));
      map.hdr.header_size += aligned as u32;
      map.extensions.push(MapExtension {
        name: name.clone(),
        reset_id: intro.reset_id,
        hdr_offset,
        hdr_size: intro.hdr_size,
        record_offset: 0,
        record_size: intro.record_size,
        record_align: intro.record_align,
      });
      if intro.record_size > 0 {
        // The snapshot doesn't cover the newcomer, so its area starts out zeroed.
        reorder_records(&mut map, &old);
      }
      (map.extensions.len() - 1, false)
    }
  };

  ctx.cur_ext = Some(index);
  ctx.cur_ext_ignore = ignore;

  if hooks_for(ctx.index, &name).is_none() && !ctx.unknown_extensions.contains(&name) {
    log::debug!("unknown extension {name:?} introduced");
    ctx.unknown_extensions.push(name.clone());
  }
  let ext = ctx.map.borrow().extensions[index].clone();
  if let Some(hooks) = hooks_for(ctx.index, &name) {
    hooks.intro(&ext);
  }
  Ok(())
}

pub fn sync_ext_reset<V>(
  ctx: &mut SyncContext<'_, V>,
  new_reset_id: u32,
  preserve_data: bool,
) -> Result<(), Corruption>
where
  V: transaction::LogView,
{
  let Some(index) = ctx.cur_ext else {
    ctx.set_corrupted("Extension reset without intro prefix".to_string());
    return Err(Corruption);
  };
  ctx.atomic_map();
  let ext = {
    let map = ctx.map.clone();
    let mut map = map.borrow_mut();
    map.extensions[index].reset_id = new_reset_id;
    let ext = map.extensions[index].clone();
    if !preserve_data {
      let area = ext.hdr_offset as usize..(ext.hdr_offset + align4(ext.hdr_size)) as usize;
      map.hdr_copy_buf[area].fill(0);
      if ext.record_size > 0 {
        let record_size = map.hdr.record_size;
        let mut rec_map = map.rec_map.borrow_mut();
        for seq in 1..=rec_map.records_count {
          let bytes = rec_map.record_bytes_mut(record_size, seq);
          bytes[ext.record_offset as usize..(ext.record_offset + ext.record_size) as usize]
            .fill(0);
        }
      }
    }
    ext
  };
  // The reset is what makes this extension's data current again.
  ctx.cur_ext_ignore = false;
  if let Some(hooks) = hooks_for(ctx.index, &ext.name) {
    hooks.reset(&ext, new_reset_id, preserve_data);
  }
  Ok(())
}

pub fn sync_ext_hdr_update<V>(
  ctx: &mut SyncContext<'_, V>,
  offset: u32,
  data: &[u8],
) -> Result<(), Corruption>
where
  V: transaction::LogView,
{
  let Some(index) = ctx.cur_ext else {
    ctx.set_corrupted("Extension header updated without intro prefix".to_string());
    return Err(Corruption);
  };
  if ctx.cur_ext_ignore {
    return Ok(());
  }
  let ext = {
    let map = ctx.map.clone();
    let mut map = map.borrow_mut();
    let ext = map.extensions[index].clone();
    if u64::from(offset) + data.len() as u64 > u64::from(ext.hdr_size) {
      drop(map);
      ctx.set_corrupted(format!(
        "ext hdr update: {} + {} > {} ({:?})",
        offset,
        data.len(),
        ext.hdr_size,
        ext.name,
      ));
      return Err(Corruption);
    }
    let start = (ext.hdr_offset + offset) as usize;
    map.hdr_copy_buf[start..start + data.len()].copy_from_slice(data);
    ext
  };
  if let Some(hooks) = hooks_for(ctx.index, &ext.name) {
    hooks.hdr_update(&ext, offset, data);
  }
  Ok(())
}

pub fn sync_ext_rec_update<V>(
  ctx: &mut SyncContext<'_, V>,
  uid: u32,
  data: &[u8],
) -> Result<(), Corruption>
where
  V: transaction::LogView,
{
  let cur_ext = ctx.cur_ext.expect("checked by the dispatcher");
  let Some(seq) = ctx.map.borrow().lookup_seq(uid) else {
    // Expunged in the meantime.
    return Ok(());
  };
  let ext = {
    let map = ctx.map.clone();
    let map = map.borrow();
    let ext = map.extensions[cur_ext].clone();
    let record_size = map.hdr.record_size;
    let mut rec_map = map.rec_map.borrow_mut();
    let bytes = rec_map.record_bytes_mut(record_size, seq);
    bytes[ext.record_offset as usize..ext.record_offset as usize + data.len()]
      .copy_from_slice(data);
    ext
  };
  if let Some(hooks) = hooks_for(ctx.index, &ext.name) {
    hooks.rec_update(&ext, seq, data);
  }
  Ok(())
}

pub fn sync_ext_atomic_inc<V>(
  ctx: &mut SyncContext<'_, V>,
  inc: &transaction::ExtAtomicInc,
) -> Result<(), Corruption>
where
  V: transaction::LogView,
{
  let cur_ext = ctx.cur_ext.expect("checked by the dispatcher");
  let Some(seq) = ctx.map.borrow().lookup_seq(inc.uid) else {
    return Ok(());
  };
  let ext = ctx.map.borrow().extensions[cur_ext].clone();
  if !matches!(ext.record_size, 1 | 2 | 4 | 8) {
    ctx.set_corrupted(format!(
      "ext atomic inc: invalid record size {} ({:?})",
      ext.record_size, ext.name,
    ));
    return Err(Corruption);
  }
  let result = {
    let map = ctx.map.clone();
    let map = map.borrow();
    let record_size = map.hdr.record_size;
    let mut rec_map = map.rec_map.borrow_mut();
    let bytes = rec_map.record_bytes_mut(record_size, seq);
    let area =
      &mut bytes[ext.record_offset as usize..(ext.record_offset + ext.record_size) as usize];
    let mut current = [0; 8];
    current[..area.len()].copy_from_slice(area);
    let current = u64::from_le_bytes(current);
    let limit = if ext.record_size == 8 {
      u64::MAX as i128
    } else {
      (1 << (ext.record_size * 8)) - 1
    };
    let value = i128::from(current) + i128::from(inc.diff);
    if value < 0 || value > limit {
      None
    } else {
      let value = value as u64;
      area.copy_from_slice(&value.to_le_bytes()[..area.len()]);
      Some(value)
    }
  };
  let Some(value) = result else {
    ctx.set_corrupted(format!(
      "ext atomic inc: uid {} out of range ({:?})",
      inc.uid, ext.name,
    ));
    return Err(Corruption);
  };
  if let Some(hooks) = hooks_for(ctx.index, &ext.name) {
    hooks.atomic_inc(&ext, seq, value);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::SyncKind;
  use crate::transaction::{Log as _, LogView, MemoryLog, ViewSet};
  use crate::{Index, Options};

  fn context<'a>(
    index: &'a mut Index,
    log: &'a MemoryLog,
  ) -> SyncContext<'a, transaction::MemoryView<'a>> {
    let map = index.map.take().unwrap();
    let ViewSet::Positioned { view, .. } = log.view(log.file_seq(), 0).unwrap() else {
      panic!("expected a positioned view");
    };
    SyncContext::new(index, map, view, SyncKind::File)
  }

  fn intro<'a, V>(ctx: &mut SyncContext<'a, V>, name: &str, record_size: u32, hdr_size: u32)
  where
    V: LogView,
  {
    let record = transaction::ExtIntro {
      ext_id: u32::MAX,
      reset_id: 0,
      hdr_size,
      record_size,
      record_align: if record_size == 0 { 0 } else { record_size.min(4) },
      name_size: name.len() as u32,
    };
    sync_ext_intro(ctx, &record, name.as_bytes()).unwrap();
  }

  fn append<'a, V>(ctx: &mut SyncContext<'a, V>, uid: u32)
  where
    V: LogView,
  {
    let map = ctx.map.borrow();
    map
      .rec_map
      .borrow_mut()
      .append(map.hdr.record_size, &map::Record { uid, flags: 0 });
    drop(map);
    let mut map = ctx.map.borrow_mut();
    map.hdr.messages_count += 1;
    map.hdr.next_uid = uid + 1;
  }

  #[test]
  fn intro_allocates_areas() {
    let mut index = Index::new(1, Options::default());
    let log = MemoryLog::new(1);
    let mut ctx = context(&mut index, &log);
    append(&mut ctx, 1);
    intro(&mut ctx, "cache", 4, 8);
    let map = ctx.map.borrow();
    let ext = &map.extensions[0];
    assert_eq!("cache", ext.name);
    assert_eq!(map::Header::SIZE, ext.hdr_offset);
    assert_eq!(map::Header::SIZE + 8, map.hdr.header_size);
    assert_eq!(map.hdr.header_size as usize, map.hdr_copy_buf.len());
    assert_eq!(map::Record::SIZE, ext.record_offset);
    assert_eq!(map::Record::SIZE + 4, map.hdr.record_size);
    // The pre-existing record was re-laid-out with a zeroed extension area.
    assert_eq!(1, map.record(1).uid);
    drop(map);
    assert_eq!(Some(0), ctx.cur_ext);
    assert!(!ctx.cur_ext_ignore);
    assert!(ctx.unknown_extensions.contains(&"cache".to_string()));
  }

  #[test]
  fn reintro_resizes_and_preserves() {
    let mut index = Index::new(1, Options::default());
    let log = MemoryLog::new(1);
    let mut ctx = context(&mut index, &log);
    append(&mut ctx, 1);
    intro(&mut ctx, "cache", 4, 4);
    sync_ext_rec_update(&mut ctx, 1, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
    // Renegotiate to an 8-byte record area; the old bytes survive in front.
    intro(&mut ctx, "cache", 8, 4);
    let map = ctx.map.borrow();
    let ext = &map.extensions[0];
    assert_eq!(8, ext.record_size);
    assert_eq!(map::Record::SIZE + 8, map.hdr.record_size);
    let rec_map = map.rec_map.borrow();
    let bytes = rec_map.record_bytes(map.hdr.record_size, 1);
    assert_eq!(
      [0xaa, 0xbb, 0xcc, 0xdd, 0, 0, 0, 0],
      bytes[ext.record_offset as usize..][..8]
    );
  }

  #[test]
  fn reset_zeroes_unless_preserved() {
    let mut index = Index::new(1, Options::default());
    let log = MemoryLog::new(1);
    let mut ctx = context(&mut index, &log);
    append(&mut ctx, 1);
    intro(&mut ctx, "cache", 4, 4);
    sync_ext_rec_update(&mut ctx, 1, &[1, 2, 3, 4]).unwrap();
    sync_ext_hdr_update(&mut ctx, 0, &[9, 9, 9, 9]).unwrap();
    sync_ext_reset(&mut ctx, 7, false).unwrap();
    let map = ctx.map.borrow();
    let ext = &map.extensions[0];
    assert_eq!(7, ext.reset_id);
    assert_eq!(
      [0, 0, 0, 0],
      map.hdr_copy_buf[ext.hdr_offset as usize..][..4]
    );
    let rec_map = map.rec_map.borrow();
    assert_eq!(
      [0, 0, 0, 0],
      rec_map.record_bytes(map.hdr.record_size, 1)[ext.record_offset as usize..][..4]
    );
  }

  #[test]
  fn stale_reset_id_ignores_updates() {
    let mut index = Index::new(1, Options::default());
    let log = MemoryLog::new(1);
    let mut ctx = context(&mut index, &log);
    append(&mut ctx, 1);
    intro(&mut ctx, "cache", 4, 0);
    let stale = transaction::ExtIntro {
      ext_id: u32::MAX,
      reset_id: 5,
      hdr_size: 0,
      record_size: 4,
      record_align: 4,
      name_size: 5,
    };
    sync_ext_intro(&mut ctx, &stale, b"cache").unwrap();
    assert!(ctx.cur_ext_ignore);
    // The reset with the new id makes the extension current again.
    sync_ext_reset(&mut ctx, 5, true).unwrap();
    assert!(!ctx.cur_ext_ignore);
    assert_eq!(5, ctx.map.borrow().extensions[0].reset_id);
  }

  #[test]
  fn hdr_update_bounds_are_corruption() {
    let mut index = Index::new(1, Options::default());
    let log = MemoryLog::new(1);
    let mut ctx = context(&mut index, &log);
    intro(&mut ctx, "cache", 0, 4);
    assert!(sync_ext_hdr_update(&mut ctx, 2, &[0; 4]).is_err());
    assert!(ctx.errors);
  }

  #[test]
  fn atomic_inc_wraps_are_corruption() {
    let mut index = Index::new(1, Options::default());
    let log = MemoryLog::new(1);
    let mut ctx = context(&mut index, &log);
    append(&mut ctx, 1);
    intro(&mut ctx, "counter", 1, 0);
    let inc = |diff| transaction::ExtAtomicInc { uid: 1, diff };
    sync_ext_atomic_inc(&mut ctx, &inc(200)).unwrap();
    sync_ext_atomic_inc(&mut ctx, &inc(55)).unwrap();
    assert!(sync_ext_atomic_inc(&mut ctx, &inc(1)).is_err()); // 256 doesn't fit in one byte.
    assert!(sync_ext_atomic_inc(&mut ctx, &inc(-100)).is_ok());
    assert!(sync_ext_atomic_inc(&mut ctx, &inc(-200)).is_err()); // Below zero.
  }

  #[test]
  fn unknown_id_is_corruption() {
    let mut index = Index::new(1, Options::default());
    let log = MemoryLog::new(1);
    let mut ctx = context(&mut index, &log);
    let record = transaction::ExtIntro {
      ext_id: 3,
      reset_id: 0,
      hdr_size: 0,
      record_size: 0,
      record_align: 0,
      name_size: 0,
    };
    assert!(sync_ext_intro(&mut ctx, &record, b"").is_err());
    assert!(ctx.errors);
  }
}
