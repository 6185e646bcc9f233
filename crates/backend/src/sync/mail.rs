//! Mail store sources.
//!
//! The store format itself is decoded by a [`MailStoreOpener`] supplied by the
//! caller. Folders are matched by name and messages by their descriptor id,
//! which stays stable while the store is edited. Attachments are parsed and
//! appended to the message body; a failing attachment is reported without
//! failing its message.

use std::{
  collections::BTreeMap,
  path::Path,
};

use tracing::{debug, warn};

use super::{Extracted, FolderSource, SyncError, SyncPass};
use crate::{
  parse::{ParseError, ParseResult},
  tree::{
    ErrorType, Folder, IndexingError,
    diff::{LiveEntry, LiveKind},
    millis,
  },
};

#[derive(Debug, thiserror::Error)]
pub enum MailStoreError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Invalid mail store: {0}")]
  Format(String),

  #[error("Mail store is password protected")]
  Encrypted,
}

impl From<MailStoreError> for ParseError {
  fn from(e: MailStoreError) -> Self {
    match e {
      MailStoreError::Io(e) => ParseError::Io(e),
      MailStoreError::Format(message) => ParseError::Corrupted(message),
      MailStoreError::Encrypted => ParseError::Encrypted,
    }
  }
}

/// Message summary as listed in its folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailHeader {
  /// Identifier stable across edits of the store
  pub descriptor_id: u64,
  pub subject: String,
  /// Epoch milliseconds
  pub last_modified: i64,
  pub size: u64,
}

/// Folder of a mail store with its messages and subfolders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailFolder {
  pub name: String,
  pub folders: Vec<MailFolder>,
  pub messages: Vec<MailHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
  pub name: String,
  pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailMessage {
  pub subject: String,
  pub sender: Option<String>,
  pub recipients: Vec<String>,
  /// Send date, epoch milliseconds
  pub date: Option<i64>,
  pub body: String,
  pub attachments: Vec<MailAttachment>,
}

/// An open mail store
pub trait MailStore {
  /// The folder hierarchy with message headers
  fn root(&self) -> Result<MailFolder, MailStoreError>;

  fn message(&self, descriptor_id: u64) -> Result<MailMessage, MailStoreError>;
}

/// Opens mail store files
pub trait MailStoreOpener: Send + Sync {
  fn open(&self, path: &Path) -> Result<Box<dyn MailStore>, MailStoreError>;
}

/// Synchronize an index rooted at a mail store file
pub(super) fn sync_store(pass: &mut SyncPass<'_, '_>, path: &Path, root: &mut Folder) -> Result<(), SyncError> {
  let last_modified = std::fs::metadata(path)
    .and_then(|m| m.modified())
    .map(millis)
    .map_err(|e| SyncError::io(path, e))?;
  if root.last_modified() == Some(last_modified) {
    debug!(path = %path.display(), "Mail store unchanged since last run");
    return Ok(());
  }

  let opener = pass.ctx.mail.ok_or(SyncError::NoMailReader)?;
  let store = opener.open(path)?;
  let hierarchy = store.root()?;

  let source = MailSource::new(store.as_ref(), &hierarchy);
  pass.reconcile(root, &source)?;
  if !pass.is_canceled() {
    root.set_last_modified(Some(last_modified));
  }
  Ok(())
}

/// One mail folder, as seen by the reconciliation
struct MailSource<'a> {
  store: &'a dyn MailStore,
  folders: BTreeMap<&'a str, &'a MailFolder>,
  entries: Vec<LiveEntry>,
}

impl<'a> MailSource<'a> {
  fn new(store: &'a dyn MailStore, folder: &'a MailFolder) -> Self {
    let mut folders = BTreeMap::new();
    let mut entries = Vec::with_capacity(folder.folders.len() + folder.messages.len());
    for child in &folder.folders {
      if folders.insert(child.name.as_str(), child).is_some() {
        warn!(folder = %folder.name, name = %child.name, "Skipping duplicate mail folder name");
        continue;
      }
      entries.push(LiveEntry::folder(child.name.clone()));
    }
    for message in &folder.messages {
      entries.push(LiveEntry::document(
        message.descriptor_id.to_string(),
        message.last_modified,
        message.size,
      ));
    }
    Self {
      store,
      folders,
      entries,
    }
  }
}

impl FolderSource for MailSource<'_> {
  fn entries(&self) -> &[LiveEntry] {
    &self.entries
  }

  fn extract(&self, pass: &SyncPass<'_, '_>, document_path: &str, name: &str) -> Result<Extracted, ParseError> {
    let descriptor_id: u64 = name
      .parse()
      .map_err(|_| ParseError::Corrupted(format!("invalid message id {name}")))?;
    let message = self.store.message(descriptor_id)?;

    let mut content = message.body;
    for attachment in &message.attachments {
      if pass.ctx.cancel.is_cancelled() {
        return Err(ParseError::Canceled);
      }
      if !pass.ctx.parser.can_parse(&attachment.name) {
        continue;
      }
      match pass
        .ctx
        .parser
        .parse_bytes(&attachment.name, &attachment.data, pass.ctx.cancel)
      {
        Ok(parsed) => {
          content.push('\n');
          content.push_str(&parsed.content);
        }
        Err(ParseError::Canceled) => return Err(ParseError::Canceled),
        Err(e) => {
          let path = format!("{document_path}/{}", attachment.name);
          pass
            .ctx
            .reporter
            .fail(&IndexingError::new(ErrorType::Attachment, path, &e));
        }
      }
    }

    Ok(Extracted {
      result: ParseResult {
        content,
        title: Some(message.subject),
        metadata: BTreeMap::new(),
      },
      sender: message.sender,
      recipients: message.recipients,
      date: message.date,
    })
  }

  fn descend(&self, pass: &mut SyncPass<'_, '_>, entry: &LiveEntry, folder: &mut Folder) -> Result<(), SyncError> {
    if entry.kind != LiveKind::Folder {
      return Ok(());
    }
    match self.folders.get(entry.name.as_str()) {
      Some(child) => pass.reconcile(folder, &MailSource::new(self.store, child)),
      None => Ok(()),
    }
  }
}
