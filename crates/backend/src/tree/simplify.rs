use super::Folder;

/// Deepest folder worth showing as the root of a mail store.
///
/// Walks down while the current folder has no messages of its own and exactly
/// one child with deep content. Mail stores typically wrap the interesting
/// folders in several empty layers; this skips them without touching the tree.
pub fn simplified_root(root: &Folder) -> &Folder {
  let mut current = root;
  loop {
    if current.documents().next().is_some() {
      return current;
    }
    let mut with_content = current.subfolders().filter(|f| f.has_deep_content());
    match (with_content.next(), with_content.next()) {
      (Some(only), None) => current = only,
      _ => return current,
    }
  }
}
