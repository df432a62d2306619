// https://doc.dovecot.org/developer_manual/design/indexes/ - index design this follows
// https://doc.dovecot.org/developer_manual/design/indexes/mail_index_api/ - the API it fronts
//
// The core of a mail index. The index file is nothing but a cache of what the transaction log
// says: every mutation is appended to the log, and the map (header + record array) is only ever
// changed by replaying log records through the sync engine. This crate is that replayer, plus
// the configuration filter matcher/merger deciding which settings apply to a request.
//
// Out of crate: file I/O (opening, mmapping and writing the index and log files), the file-backed
// log reader, fsck, keyword parsing and the outer mailbox API. Their seams are the `transaction`
// traits and the hooks on `Index`.

pub mod extension;
pub mod filter;
pub mod map;
pub mod modseq;
pub mod sync;
pub mod transaction;

#[derive(Clone, Copy, Debug)]
pub struct Options {
  // Don't track the DIRTY record bit nor the HAVE_DIRTY header flag.
  pub no_dirty: bool,
  // Unread log bytes beyond which a sync marks the index as wanting a rewrite.
  pub rewrite_min_log_bytes: u32,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      no_dirty: false,
      rewrite_min_log_bytes: 8 * 1024,
    }
  }
}

// The transaction this process just committed. While replaying it back from the log, modseq
// changes that turn out to be stale are counted here instead of being errors.
#[derive(Clone, Copy, Debug)]
pub struct CommitResult {
  pub log_file_seq: u32,
  // End offset of the committed transaction; it started commit_size bytes earlier.
  pub log_file_offset: u32,
  pub commit_size: u32,
  pub ignored_modseq_changes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeywordOp {
  Add,
  Remove,
}

// Keyword storage is negotiated outside this crate; the sync engine only validates the framing
// and delegates.
pub trait KeywordHandler {
  fn update(&mut self, map: &mut map::Map, op: KeywordOp, keyword: &str, uids: &[(u32, u32)]);
  fn reset(&mut self, map: &mut map::Map, uids: &[(u32, u32)]);
}

// Called with each expunged record's extension bytes, before the record is compacted away.
pub type ExpungeHandler = Box<dyn FnMut(&[u8])>;

// Rebuilds index.map into something consistent after a sync reported corruption.
pub type FsckHook = fn(&mut Index) -> anyhow::Result<()>;

pub struct Index {
  pub indexid: u32,
  pub options: Options,
  // The owner-held slot for the current map. The sync driver takes it for the duration of a
  // file sync (making the sync view the only strong holder) and installs the result back.
  pub map: Option<map::MapRef>,
  // A non-external INDEX_DELETED was replayed; the next sync finishes the deletion.
  pub delete_requested: bool,
  // Advisory, raised when a sync read enough log to make rewriting the index worthwhile.
  pub want_rewrite: bool,
  pub modseq_enabled: bool,
  pub sync_commit_result: Option<CommitResult>,
  // Extension hooks by extension name.
  pub extensions: Vec<(String, Box<dyn extension::Hooks>)>,
  // (extension name, handler), run during file syncs only.
  pub expunge_handlers: Vec<(String, ExpungeHandler)>,
  pub keywords: Option<Box<dyn KeywordHandler>>,
  pub fsck: Option<FsckHook>,
}

impl Index {
  // An in-memory index; adopting a file image instead is the outer storage layer's job.
  pub fn new(indexid: u32, options: Options) -> Self {
    Self {
      indexid,
      options,
      map: Some(map::Map::alloc(indexid).into_ref()),
      delete_requested: false,
      want_rewrite: false,
      modseq_enabled: false,
      sync_commit_result: None,
      extensions: Vec::new(),
      expunge_handlers: Vec::new(),
      keywords: None,
      fsck: None,
    }
  }

  pub fn register_extension(&mut self, name: &str, hooks: Box<dyn extension::Hooks>) {
    self.extensions.push((name.to_string(), hooks));
  }

  pub fn register_expunge_handler(&mut self, extension: &str, handler: ExpungeHandler) {
    self.expunge_handlers.push((extension.to_string(), handler));
  }

  pub fn enable_modseqs(&mut self) {
    self.modseq_enabled = true;
    if let Some(map) = &self.map {
      modseq::enable(map);
    }
  }
}
