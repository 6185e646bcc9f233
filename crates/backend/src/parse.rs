//! Text extraction.
//!
//! The synchronizer only sees the [`Parser`] trait. [`ParseService`] is the
//! built-in implementation covering plain text and HTML; richer formats plug in
//! behind the same trait.

use std::{collections::BTreeMap, fs::File, io::Read, path::Path};

use tokio_util::sync::CancellationToken;

use crate::{domain::config::IndexConfig, tree::ErrorType};

/// Bytes inspected when sniffing for binary content
const SNIFF_LEN: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
  #[error("Unsupported format: {0}")]
  Unsupported(String),

  #[error("Document is password protected")]
  Encrypted,

  #[error("Corrupted document: {0}")]
  Corrupted(String),

  #[error("File too large ({size} bytes, limit {max})")]
  TooLarge { size: u64, max: u64 },

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Out of memory while parsing")]
  OutOfMemory,

  #[error("Parser crashed: {0}")]
  Crashed(String),

  #[error("Parsing canceled")]
  Canceled,
}

impl ParseError {
  /// Category recorded on the document node
  pub fn error_type(&self) -> ErrorType {
    match self {
      ParseError::OutOfMemory => ErrorType::OutOfMemory,
      ParseError::Io(_) => ErrorType::IoException,
      _ => ErrorType::Parsing,
    }
  }
}

/// Extracted text plus whatever metadata the format carries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseResult {
  pub content: String,
  pub title: Option<String>,
  pub metadata: BTreeMap<String, String>,
}

/// Turns raw documents into indexable text
pub trait Parser: Send + Sync {
  /// Whether `name` has a format this parser understands
  fn can_parse(&self, name: &str) -> bool;

  /// Parse an in-memory document such as an archive entry or attachment
  fn parse_bytes(&self, name: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<ParseResult, ParseError>;

  /// Parse a file on disk
  fn parse(&self, path: &Path, name: &str, cancel: &CancellationToken) -> Result<ParseResult, ParseError> {
    let bytes = std::fs::read(path)?;
    self.parse_bytes(name, &bytes, cancel)
  }
}

/// Built-in parser for the configured text extensions
#[derive(Debug, Clone)]
pub struct ParseService {
  config: IndexConfig,
}

impl ParseService {
  pub fn new(config: IndexConfig) -> Self {
    Self { config }
  }

  fn check_size(&self, size: u64) -> Result<(), ParseError> {
    if size > self.config.max_file_size {
      return Err(ParseError::TooLarge {
        size,
        max: self.config.max_file_size,
      });
    }
    Ok(())
  }
}

impl Parser for ParseService {
  fn can_parse(&self, name: &str) -> bool {
    self.config.is_text(name)
  }

  fn parse_bytes(&self, name: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<ParseResult, ParseError> {
    if cancel.is_cancelled() {
      return Err(ParseError::Canceled);
    }
    if !self.can_parse(name) {
      return Err(ParseError::Unsupported(extension(name).to_string()));
    }
    self.check_size(bytes.len() as u64)?;
    if bytes[..bytes.len().min(SNIFF_LEN)].contains(&0) {
      return Err(ParseError::Corrupted("binary content in text file".to_string()));
    }

    let text = String::from_utf8_lossy(bytes);
    let lower = name.to_lowercase();
    if lower.ends_with(".html") || lower.ends_with(".htm") {
      let (content, title) = strip_html(&text);
      return Ok(ParseResult {
        content,
        title,
        metadata: BTreeMap::new(),
      });
    }

    Ok(ParseResult {
      content: text.into_owned(),
      title: None,
      metadata: BTreeMap::new(),
    })
  }

  fn parse(&self, path: &Path, name: &str, cancel: &CancellationToken) -> Result<ParseResult, ParseError> {
    if !self.can_parse(name) {
      return Err(ParseError::Unsupported(extension(name).to_string()));
    }
    let size = std::fs::metadata(path)?.len();
    self.check_size(size)?;
    let bytes = read_with_capacity(path, size)?;
    self.parse_bytes(name, &bytes, cancel)
  }
}

/// Read a file into a buffer reserved up front, so a failed allocation is an error
fn read_with_capacity(path: &Path, size: u64) -> Result<Vec<u8>, ParseError> {
  let mut bytes = Vec::new();
  let capacity = usize::try_from(size).map_err(|_| ParseError::OutOfMemory)?;
  bytes.try_reserve_exact(capacity).map_err(|_| ParseError::OutOfMemory)?;
  File::open(path)?.read_to_end(&mut bytes)?;
  Ok(bytes)
}

fn extension(name: &str) -> &str {
  name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}

/// Strip markup, returning the visible text and the `<title>` if present
fn strip_html(html: &str) -> (String, Option<String>) {
  let mut text = String::with_capacity(html.len());
  let mut title = None;
  let mut rest = html;

  while let Some(open) = rest.find('<') {
    text.push_str(&rest[..open]);
    let after = &rest[open..];
    let Some(close) = after.find('>') else {
      rest = "";
      break;
    };
    let tag = after[1..close].trim().to_lowercase();
    rest = &after[close + 1..];

    let skip_until = match tag.split_whitespace().next() {
      Some("script") => Some("</script"),
      Some("style") => Some("</style"),
      Some("title") => {
        if let Some(end) = rest.to_ascii_lowercase().find("</title") {
          title = Some(decode_entities(rest[..end].trim()));
        }
        None
      }
      _ => None,
    };
    if let Some(end_tag) = skip_until {
      match rest.to_ascii_lowercase().find(end_tag) {
        Some(end) => rest = &rest[end..],
        None => rest = "",
      }
    } else {
      text.push(' ');
    }
  }
  text.push_str(rest);

  let content = decode_entities(&text)
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ");
  (content, title)
}

fn decode_entities(text: &str) -> String {
  text
    .replace("&nbsp;", " ")
    .replace("&lt;", "<")
    .replace("&gt;", ">")
    .replace("&quot;", "\"")
    .replace("&#39;", "'")
    .replace("&amp;", "&")
}
