//! Full-text search index backed by tantivy.
//!
//! Each registered index owns one tantivy index living in its index directory.
//! Documents are keyed by the tree's unique id: updates delete by uid and
//! re-add, so an entry is replaced rather than duplicated.

use std::path::Path;

use tantivy::{
  Index as TantivyIndex, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term,
  collector::TopDocs,
  directory::MmapDirectory,
  doc,
  query::QueryParser,
  schema::{Field, INDEXED, STORED, STRING, Schema, TEXT, Value},
};
use tracing::{debug, trace};

use crate::tree::DocumentType;

/// Writer threads; a single worker writes to an index at a time
const WRITER_THREADS: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("Search index error: {0}")]
  Tantivy(#[from] tantivy::TantivyError),

  #[error("Failed to open index directory: {0}")]
  OpenDirectory(#[from] tantivy::directory::error::OpenDirectoryError),

  #[error("Invalid query: {0}")]
  Query(#[from] tantivy::query::QueryParserError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
struct Fields {
  uid: Field,
  doc_type: Field,
  filename: Field,
  title: Field,
  content: Field,
  size: Field,
  date: Field,
  sender: Field,
  recipients: Field,
}

fn build_schema() -> (Schema, Fields) {
  let mut builder = Schema::builder();
  let fields = Fields {
    uid: builder.add_text_field("uid", STRING | STORED),
    doc_type: builder.add_text_field("type", STRING | STORED),
    filename: builder.add_text_field("filename", TEXT | STORED),
    title: builder.add_text_field("title", TEXT | STORED),
    content: builder.add_text_field("content", TEXT),
    size: builder.add_u64_field("size", INDEXED | STORED),
    date: builder.add_i64_field("date", INDEXED | STORED),
    sender: builder.add_text_field("sender", TEXT | STORED),
    recipients: builder.add_text_field("recipients", TEXT | STORED),
  };
  (builder.build(), fields)
}

/// A document as handed to the search index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDocument {
  pub uid: String,
  pub doc_type: DocumentType,
  pub filename: String,
  pub title: Option<String>,
  pub content: String,
  pub size: u64,
  /// Last modification (files) or send date (mail), epoch milliseconds
  pub date: i64,
  pub sender: Option<String>,
  pub recipients: Vec<String>,
}

/// A search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
  pub uid: String,
  pub doc_type: Option<DocumentType>,
  pub filename: String,
  pub title: Option<String>,
  pub score: f32,
  pub date: i64,
}

/// Handle on the tantivy index of one index directory
pub struct SearchIndex {
  index: TantivyIndex,
  reader: IndexReader,
  fields: Fields,
}

impl SearchIndex {
  /// Open the index in `dir`, creating the directory and an empty index if needed
  pub fn open_or_create(dir: &Path) -> Result<Self, StoreError> {
    std::fs::create_dir_all(dir)?;
    let (schema, fields) = build_schema();
    let index = TantivyIndex::open_or_create(MmapDirectory::open(dir)?, schema)?;
    let reader = index
      .reader_builder()
      .reload_policy(ReloadPolicy::Manual)
      .try_into()?;
    debug!(dir = %dir.display(), "Opened search index");
    Ok(Self { index, reader, fields })
  }

  /// Open the single writer for this index; held for the duration of a task
  pub fn writer(&self, heap_bytes: usize) -> Result<DocumentWriter, StoreError> {
    let writer = self.index.writer_with_num_threads(WRITER_THREADS, heap_bytes)?;
    Ok(DocumentWriter {
      writer,
      fields: self.fields,
      pending: 0,
    })
  }

  /// Make the last commit visible to searches
  pub fn reload(&self) -> Result<(), StoreError> {
    self.reader.reload()?;
    Ok(())
  }

  pub fn num_docs(&self) -> u64 {
    self.reader.searcher().num_docs()
  }

  /// Term search over content, file names, titles and mail headers
  pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
    let searcher = self.reader.searcher();
    let parser = QueryParser::for_index(
      &self.index,
      vec![
        self.fields.content,
        self.fields.filename,
        self.fields.title,
        self.fields.sender,
        self.fields.recipients,
      ],
    );
    let query = parser.parse_query(query)?;
    let top_docs = searcher.search(&query, &TopDocs::with_limit(limit.max(1)))?;

    let mut hits = Vec::with_capacity(top_docs.len());
    for (score, address) in top_docs {
      let doc: TantivyDocument = searcher.doc(address)?;
      let text = |field: Field| doc.get_first(field).and_then(|v| v.as_str()).map(str::to_string);
      hits.push(SearchHit {
        uid: text(self.fields.uid).unwrap_or_default(),
        doc_type: text(self.fields.doc_type).as_deref().and_then(DocumentType::parse),
        filename: text(self.fields.filename).unwrap_or_default(),
        title: text(self.fields.title),
        score,
        date: doc.get_first(self.fields.date).and_then(|v| v.as_i64()).unwrap_or(0),
      });
    }
    Ok(hits)
  }
}

/// Buffered writes against a [`SearchIndex`]; nothing is visible until [`DocumentWriter::commit`]
pub struct DocumentWriter {
  writer: IndexWriter,
  fields: Fields,
  pending: usize,
}

impl DocumentWriter {
  pub fn add(&mut self, document: &IndexDocument) -> Result<(), StoreError> {
    let f = &self.fields;
    let mut tantivy_doc = doc!(
      f.uid => document.uid.as_str(),
      f.doc_type => document.doc_type.as_str(),
      f.filename => document.filename.as_str(),
      f.content => document.content.as_str(),
      f.size => document.size,
      f.date => document.date,
    );
    if let Some(title) = &document.title {
      tantivy_doc.add_text(f.title, title);
    }
    if let Some(sender) = &document.sender {
      tantivy_doc.add_text(f.sender, sender);
    }
    for recipient in &document.recipients {
      tantivy_doc.add_text(f.recipients, recipient);
    }
    self.writer.add_document(tantivy_doc)?;
    self.pending += 1;
    trace!(uid = %document.uid, "Queued document for indexing");
    Ok(())
  }

  /// Replace the entry with the same uid
  pub fn update(&mut self, document: &IndexDocument) -> Result<(), StoreError> {
    self.delete(&document.uid);
    self.add(document)
  }

  pub fn delete(&mut self, uid: &str) {
    self.writer.delete_term(Term::from_field_text(self.fields.uid, uid));
    self.pending += 1;
  }

  pub fn delete_all(&mut self) -> Result<(), StoreError> {
    self.writer.delete_all_documents()?;
    self.pending += 1;
    Ok(())
  }

  pub fn commit(&mut self) -> Result<(), StoreError> {
    self.writer.commit()?;
    debug!(operations = self.pending, "Committed search index");
    self.pending = 0;
    Ok(())
  }

  /// Discard everything written since the last commit
  pub fn rollback(&mut self) -> Result<(), StoreError> {
    self.writer.rollback()?;
    self.pending = 0;
    Ok(())
  }
}
