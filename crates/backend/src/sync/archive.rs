//! Tar archive sources.
//!
//! An archive is read in one sequential pass into an in-memory directory
//! tree, keeping the bytes of entries the parser will need. The tree is then
//! reconciled like a directory. The archive folder only records the archive's
//! timestamp once a pass over it completes, so an interrupted or failed pass
//! is repeated next time.

use std::{
  collections::BTreeMap,
  fs::File,
  io::{self, BufReader, Read},
  path::{Component, Path},
};

use flate2::read::GzDecoder;
use tracing::{debug, trace};

use super::{Extracted, FolderSource, SyncError, SyncPass};
use crate::{
  parse::{ParseError, ParseResult},
  reporter::InfoType,
  tree::{
    ErrorType, Folder, IndexingError,
    diff::{LiveEntry, LiveKind},
  },
};

#[derive(Debug, thiserror::Error)]
pub(super) enum ArchiveError {
  #[error("{0}")]
  Io(#[from] io::Error),

  #[error("corrupted archive: {0}")]
  Corrupted(io::Error),
}

impl ArchiveError {
  pub fn into_sync_error(self, path: &Path) -> SyncError {
    match self {
      ArchiveError::Io(source) => SyncError::io(path, source),
      ArchiveError::Corrupted(source) => SyncError::Archive {
        path: path.to_path_buf(),
        message: source.to_string(),
      },
    }
  }

  pub fn into_indexing_error(self, node_path: &str) -> IndexingError {
    let error_type = match &self {
      ArchiveError::Io(_) => ErrorType::IoException,
      ArchiveError::Corrupted(_) => ErrorType::Archive,
    };
    IndexingError::new(error_type, node_path, &self)
  }
}

#[derive(Debug, Default)]
pub(super) struct ArchiveFile {
  last_modified: i64,
  size: u64,
  /// Entry bytes; absent when the entry is not parsed or exceeds the size limit
  data: Option<Vec<u8>>,
}

/// In-memory view of one directory inside an archive
#[derive(Debug, Default)]
pub(super) struct ArchiveDir {
  dirs: BTreeMap<String, ArchiveDir>,
  files: BTreeMap<String, ArchiveFile>,
}

impl ArchiveDir {
  fn dir_mut(&mut self, components: &[String]) -> &mut ArchiveDir {
    let mut current = self;
    for name in components {
      current = current.dirs.entry(name.clone()).or_default();
    }
    current
  }

  pub fn file_count(&self) -> usize {
    self.files.len() + self.dirs.values().map(ArchiveDir::file_count).sum::<usize>()
  }
}

fn open(path: &Path) -> io::Result<Box<dyn Read>> {
  let file = BufReader::new(File::open(path)?);
  let lower = path.to_string_lossy().to_lowercase();
  if lower.ends_with(".gz") || lower.ends_with(".tgz") {
    Ok(Box::new(GzDecoder::new(file)))
  } else {
    Ok(Box::new(file))
  }
}

/// Slash-free names of the normal components of an entry path
/// Header mtime in milliseconds; out-of-range values clamp to 0
fn mtime_millis(secs: u64) -> i64 {
  i64::try_from(secs).ok().and_then(|s| s.checked_mul(1000)).unwrap_or(0)
}

fn entry_components(path: &Path) -> Option<Vec<String>> {
  let mut names = Vec::new();
  for component in path.components() {
    match component {
      Component::Normal(name) => names.push(name.to_string_lossy().into_owned()),
      Component::CurDir => {}
      _ => return None,
    }
  }
  Some(names)
}

/// Read the structure of a tar (optionally gzip-compressed) archive
pub(super) fn read_archive(pass: &SyncPass<'_, '_>, path: &Path) -> Result<ArchiveDir, ArchiveError> {
  pass.ctx.reporter.info(InfoType::Unpacking, &path.to_string_lossy(), 0);
  let max_size = pass.ctx.config.max_file_size;
  let mut archive = tar::Archive::new(open(path)?);
  let mut root = ArchiveDir::default();

  for entry in archive.entries().map_err(ArchiveError::Corrupted)? {
    let mut entry = entry.map_err(ArchiveError::Corrupted)?;
    let entry_path = entry.path().map_err(ArchiveError::Corrupted)?.into_owned();
    let Some(mut components) = entry_components(&entry_path) else {
      trace!(entry = %entry_path.display(), "Skipping archive entry outside the archive root");
      continue;
    };

    let entry_type = entry.header().entry_type();
    if entry_type.is_dir() {
      root.dir_mut(&components);
      continue;
    }
    if !entry_type.is_file() {
      continue;
    }
    let Some(name) = components.pop() else {
      continue;
    };

    let size = entry.header().size().map_err(ArchiveError::Corrupted)?;
    let last_modified = entry
      .header()
      .mtime()
      .map(mtime_millis)
      .map_err(ArchiveError::Corrupted)?;
    let data = if size <= max_size && pass.ctx.parser.can_parse(&name) {
      let mut buf = Vec::with_capacity(size as usize);
      entry.read_to_end(&mut buf).map_err(ArchiveError::Corrupted)?;
      Some(buf)
    } else {
      None
    };

    root.dir_mut(&components).files.insert(
      name,
      ArchiveFile {
        last_modified,
        size,
        data,
      },
    );
  }

  debug!(path = %path.display(), files = root.file_count(), "Read archive");
  Ok(root)
}

/// Reconcile an archive folder, recording `last_modified` only if the pass completed
pub(super) fn reconcile_archive(
  pass: &mut SyncPass<'_, '_>,
  folder: &mut Folder,
  contents: &ArchiveDir,
  last_modified: i64,
) -> Result<(), SyncError> {
  let source = ArchiveSource::new(pass, contents);
  pass.reconcile(folder, &source)?;
  if !pass.is_canceled() {
    folder.set_last_modified(Some(last_modified));
  }
  Ok(())
}

/// One directory of an archive, as seen by the reconciliation
struct ArchiveSource<'a> {
  dir: &'a ArchiveDir,
  entries: Vec<LiveEntry>,
}

impl<'a> ArchiveSource<'a> {
  fn new(pass: &SyncPass<'_, '_>, dir: &'a ArchiveDir) -> Self {
    let mut entries = Vec::with_capacity(dir.dirs.len() + dir.files.len());
    for name in dir.dirs.keys() {
      if !pass.is_excluded(name, true) {
        entries.push(LiveEntry::folder(name.clone()));
      }
    }
    for (name, file) in &dir.files {
      // Archives nested in archives are indexed by name only
      if !pass.is_excluded(name, false) && (pass.is_indexable(name) || pass.ctx.config.is_archive(name)) {
        entries.push(LiveEntry::document(name.clone(), file.last_modified, file.size));
      }
    }
    Self { dir, entries }
  }
}

impl FolderSource for ArchiveSource<'_> {
  fn entries(&self) -> &[LiveEntry] {
    &self.entries
  }

  fn extract(&self, pass: &SyncPass<'_, '_>, _document_path: &str, name: &str) -> Result<Extracted, ParseError> {
    let Some(file) = self.dir.files.get(name) else {
      return Ok(Extracted::default());
    };
    if !pass.ctx.parser.can_parse(name) {
      return Ok(Extracted::from(ParseResult::default()));
    }
    match &file.data {
      Some(bytes) => pass
        .ctx
        .parser
        .parse_bytes(name, bytes, pass.ctx.cancel)
        .map(Extracted::from),
      None => Err(ParseError::TooLarge {
        size: file.size,
        max: pass.ctx.config.max_file_size,
      }),
    }
  }

  fn descend(&self, pass: &mut SyncPass<'_, '_>, entry: &LiveEntry, folder: &mut Folder) -> Result<(), SyncError> {
    if entry.kind != LiveKind::Folder {
      return Ok(());
    }
    match self.dir.dirs.get(&entry.name) {
      Some(dir) => {
        let source = ArchiveSource::new(pass, dir);
        pass.reconcile(folder, &source)
      }
      None => Ok(()),
    }
  }
}
