//! Directory sources.

use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::{Extracted, FolderSource, SyncError, SyncPass, archive};
use crate::{
  parse::{ParseError, ParseResult},
  tree::{
    ErrorType, Folder, IndexingError,
    diff::{LiveEntry, LiveKind},
    millis,
  },
};

/// Synchronize an index rooted at a directory or an archive file
pub(super) fn sync_root(pass: &mut SyncPass<'_, '_>, path: &Path, root: &mut Folder) -> Result<(), SyncError> {
  let metadata = std::fs::metadata(path).map_err(|e| SyncError::io(path, e))?;

  if metadata.is_dir() {
    let entries = list_directory(pass, path).map_err(|e| SyncError::io(path, e))?;
    return pass.reconcile(root, &DirectorySource::new(path, entries));
  }

  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  if !pass.ctx.config.is_archive(&name) {
    return Err(SyncError::NotAnArchive(path.to_path_buf()));
  }

  let last_modified = metadata
    .modified()
    .map(millis)
    .map_err(|e| SyncError::io(path, e))?;
  if root.last_modified() == Some(last_modified) {
    debug!(path = %path.display(), "Archive unchanged since last run");
    return Ok(());
  }

  let contents = archive::read_archive(pass, path).map_err(|e| e.into_sync_error(path))?;
  archive::reconcile_archive(pass, root, &contents, last_modified)
}

/// Live children of a directory, sorted by name.
///
/// Excluded names, symlinks and files that would not become documents are
/// left out. Entries whose metadata cannot be read are skipped with a warning.
fn list_directory(pass: &SyncPass<'_, '_>, dir: &Path) -> std::io::Result<Vec<LiveEntry>> {
  let mut entries = Vec::new();
  let walker = WalkDir::new(dir)
    .min_depth(1)
    .max_depth(1)
    .follow_links(false)
    .sort_by_file_name();

  for entry in walker {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) if e.depth() == 0 => return Err(e.into()),
      Err(e) => {
        warn!(error = %e, "Skipping unreadable directory entry");
        continue;
      }
    };

    let name = entry.file_name().to_string_lossy().into_owned();
    let file_type = entry.file_type();
    if file_type.is_symlink() {
      trace!(path = %entry.path().display(), "Skipping symlink");
      continue;
    }
    if pass.is_excluded(&name, file_type.is_dir()) {
      trace!(path = %entry.path().display(), "Skipping excluded entry");
      continue;
    }

    if file_type.is_dir() {
      entries.push(LiveEntry::folder(name));
      continue;
    }
    if !file_type.is_file() {
      continue;
    }

    let metadata = match entry.metadata() {
      Ok(metadata) => metadata,
      Err(e) => {
        warn!(path = %entry.path().display(), error = %e, "Skipping file with unreadable metadata");
        continue;
      }
    };
    let last_modified = metadata.modified().map(millis).unwrap_or(0);

    if pass.ctx.config.is_archive(&name) {
      entries.push(LiveEntry::container(name, last_modified));
    } else if pass.is_indexable(&name) {
      entries.push(LiveEntry::document(name, last_modified, metadata.len()));
    }
  }
  Ok(entries)
}

/// A directory on disk paired with its listing
pub(super) struct DirectorySource {
  path: PathBuf,
  entries: Vec<LiveEntry>,
}

impl DirectorySource {
  fn new(path: &Path, entries: Vec<LiveEntry>) -> Self {
    Self {
      path: path.to_path_buf(),
      entries,
    }
  }
}

impl FolderSource for DirectorySource {
  fn entries(&self) -> &[LiveEntry] {
    &self.entries
  }

  fn extract(&self, pass: &SyncPass<'_, '_>, _document_path: &str, name: &str) -> Result<Extracted, ParseError> {
    if !pass.ctx.parser.can_parse(name) {
      return Ok(Extracted::from(ParseResult::default()));
    }
    pass
      .ctx
      .parser
      .parse(&self.path.join(name), name, pass.ctx.cancel)
      .map(Extracted::from)
  }

  fn descend(&self, pass: &mut SyncPass<'_, '_>, entry: &LiveEntry, folder: &mut Folder) -> Result<(), SyncError> {
    let path = self.path.join(&entry.name);
    match entry.kind {
      LiveKind::Container { last_modified } => {
        folder.set_error(None);
        match archive::read_archive(pass, &path) {
          Ok(contents) => archive::reconcile_archive(pass, folder, &contents, last_modified),
          Err(e) => {
            let error = e.into_indexing_error(folder.path());
            folder.set_error(Some(pass.record(error)));
            Ok(())
          }
        }
      }
      _ => match list_directory(pass, &path) {
        Ok(entries) => pass.reconcile(folder, &DirectorySource::new(&path, entries)),
        Err(e) => {
          let error = IndexingError::new(ErrorType::IoException, folder.path(), &e);
          folder.set_error(Some(pass.record(error)));
          Ok(())
        }
      },
    }
  }
}
