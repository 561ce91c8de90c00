//! Document state tracking
//!
//! Tracks one immutable snapshot per open document: content, a version
//! counter starting at 0, and the text encoding detected when the file was
//! read. Opens are ref-counted so nested scopes can share a document; a
//! close only evicts the snapshot when the last reference goes away.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Errors from reading or decoding documents
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot determine text encoding of {path}: not valid UTF-8 and no BOM")]
    UnknownEncoding { path: PathBuf },

    #[error("File {path} is not valid {encoding} text")]
    Decode { path: PathBuf, encoding: &'static str },
}

/// Immutable snapshot of an open document
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub content: String,
    pub version: i32,
    pub encoding: &'static Encoding,
}

impl DocumentState {
    fn new(content: String, encoding: &'static Encoding) -> Self {
        Self {
            content,
            version: 0,
            encoding,
        }
    }
}

/// Decode file bytes: honor a BOM if present, otherwise require strict UTF-8.
pub fn decode_bytes(
    path: &Path,
    bytes: &[u8],
) -> Result<(String, &'static Encoding), DocumentError> {
    if let Some((encoding, _bom_length)) = Encoding::for_bom(bytes) {
        let (text, had_errors) = encoding.decode_with_bom_removal(bytes);
        if had_errors {
            return Err(DocumentError::Decode {
                path: path.to_path_buf(),
                encoding: encoding.name(),
            });
        }
        return Ok((text.into_owned(), encoding));
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => Ok((text.to_string(), UTF_8)),
        Err(_) => Err(DocumentError::UnknownEncoding {
            path: path.to_path_buf(),
        }),
    }
}

/// Read and decode a file from disk
pub async fn read_text_file(path: &Path) -> Result<(String, &'static Encoding), DocumentError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    decode_bytes(path, &bytes)
}

/// Encode document content with its tracked encoding and write it to disk
pub async fn write_text_file(
    path: &Path,
    content: &str,
    encoding: &'static Encoding,
) -> Result<(), DocumentError> {
    let (bytes, output_encoding, _) = encoding.encode(content);
    if output_encoding != encoding {
        warn!(
            "Encoding {} cannot be written directly; writing {} instead",
            encoding.name(),
            output_encoding.name()
        );
    }
    tokio::fs::write(path, bytes.as_ref())
        .await
        .map_err(|source| DocumentError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Ref-counted document snapshot store, keyed by document URI.
///
/// All mutation goes through `&mut self`; the session serializes access so
/// version bumps and ref-count changes are race-free.
#[derive(Debug, Default)]
pub struct DocumentStateManager {
    states: HashMap<String, DocumentState>,
    ref_counts: HashMap<String, usize>,
}

impl DocumentStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a batch of documents, reading untracked ones from disk.
    ///
    /// Every requested URI gains one reference; URIs not yet tracked are
    /// read concurrently and enter at version 0. Returns the URIs that were
    /// newly opened, in request order.
    pub async fn open(
        &mut self,
        files: &[(String, PathBuf)],
    ) -> Result<Vec<String>, DocumentError> {
        let mut seen = HashSet::new();
        let mut new_files: Vec<(String, PathBuf)> = Vec::new();
        for (uri, path) in files {
            if !self.states.contains_key(uri) && seen.insert(uri.clone()) {
                new_files.push((uri.clone(), path.clone()));
            }
        }

        let mut reads = JoinSet::new();
        for (index, (_, path)) in new_files.iter().enumerate() {
            let path = path.clone();
            reads.spawn(async move { (index, read_text_file(&path).await) });
        }

        let mut contents: Vec<Option<(String, &'static Encoding)>> = vec![None; new_files.len()];
        while let Some(joined) = reads.join_next().await {
            let (index, result) = joined.map_err(|e| DocumentError::Io {
                path: new_files[0].1.clone(),
                source: std::io::Error::other(e),
            })?;
            contents[index] = Some(result?);
        }

        let mut opened = Vec::with_capacity(new_files.len());
        for ((uri, _), content) in new_files.iter().zip(contents) {
            if let Some((text, encoding)) = content {
                self.states
                    .insert(uri.clone(), DocumentState::new(text, encoding));
                opened.push(uri.clone());
            }
        }

        for (uri, _) in files {
            *self.ref_counts.entry(uri.clone()).or_insert(0) += 1;
        }

        debug!(
            "Opened {} new document(s), {} requested",
            opened.len(),
            files.len()
        );
        Ok(opened)
    }

    /// Release one reference per URI, evicting documents that reach zero.
    ///
    /// Returns the evicted URIs; untracked URIs are ignored.
    pub fn close(&mut self, uris: &[String]) -> Vec<String> {
        let mut evicted = Vec::new();
        for uri in uris {
            let Some(count) = self.ref_counts.get_mut(uri) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ref_counts.remove(uri);
                self.states.remove(uri);
                evicted.push(uri.clone());
            }
        }
        evicted
    }

    /// Current snapshot for a tracked document
    pub fn get(&self, uri: &str) -> Option<&DocumentState> {
        self.states.get(uri)
    }

    /// Track a document whose content and version are already known.
    ///
    /// Returns `None` if the URI is already tracked; the existing snapshot
    /// is left untouched.
    pub fn register(&mut self, uri: &str, content: String, version: i32) -> Option<&DocumentState> {
        if self.states.contains_key(uri) {
            return None;
        }
        self.ref_counts.insert(uri.to_string(), 1);
        self.states.insert(
            uri.to_string(),
            DocumentState {
                content,
                version,
                encoding: UTF_8,
            },
        );
        self.states.get(uri)
    }

    /// Stop tracking a document regardless of its reference count.
    ///
    /// Returns the final snapshot, or `None` if the URI was not tracked.
    pub fn unregister(&mut self, uri: &str) -> Option<DocumentState> {
        self.ref_counts.remove(uri);
        self.states.remove(uri)
    }

    /// Replace a document's content, bumping its version.
    ///
    /// Returns the new version, or `None` if the URI is not tracked.
    pub fn update_content(&mut self, uri: &str, content: String) -> Option<i32> {
        let state = self.states.get_mut(uri)?;
        state.content = content;
        state.version += 1;
        Some(state.version)
    }

    /// Bump a document's version without changing its content.
    ///
    /// Returns the new version, or `None` if the URI is not tracked.
    pub fn increment_version(&mut self, uri: &str) -> Option<i32> {
        let state = self.states.get_mut(uri)?;
        state.version += 1;
        Some(state.version)
    }

    pub fn ref_count(&self, uri: &str) -> usize {
        self.ref_counts.get(uri).copied().unwrap_or(0)
    }

    pub fn tracked_uris(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    pub fn is_tracked(&self, uri: &str) -> bool {
        self.states.contains_key(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_file(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_register_and_update_versions() {
        let mut manager = DocumentStateManager::new();

        let state = manager
            .register("file:///a.py", "x = 1".to_string(), 0)
            .unwrap();
        assert_eq!(state.version, 0);
        assert_eq!(state.content, "x = 1");

        let version = manager
            .update_content("file:///a.py", "x = 2".to_string())
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(manager.get("file:///a.py").unwrap().content, "x = 2");

        assert_eq!(manager.increment_version("file:///a.py"), Some(2));
    }

    #[test]
    fn test_register_with_initial_version() {
        let mut manager = DocumentStateManager::new();
        let state = manager
            .register("file:///b.py", "y = 1".to_string(), 7)
            .unwrap();
        assert_eq!(state.version, 7);
        assert_eq!(
            manager.update_content("file:///b.py", "y = 2".to_string()),
            Some(8)
        );
    }

    #[test]
    fn test_register_duplicate_returns_none() {
        let mut manager = DocumentStateManager::new();
        assert!(
            manager
                .register("file:///a.py", "a".to_string(), 0)
                .is_some()
        );
        assert!(
            manager
                .register("file:///a.py", "b".to_string(), 5)
                .is_none()
        );

        // Existing snapshot untouched
        assert_eq!(manager.get("file:///a.py").unwrap().content, "a");
    }

    #[test]
    fn test_untracked_operations_return_none() {
        let mut manager = DocumentStateManager::new();
        assert!(manager.update_content("file:///nope", String::new()).is_none());
        assert!(manager.increment_version("file:///nope").is_none());
        assert!(manager.unregister("file:///nope").is_none());
        assert!(manager.get("file:///nope").is_none());
    }

    #[tokio::test]
    async fn test_open_reads_new_and_counts_all() {
        let (_dir, path) = temp_file(b"hello");
        let uri = "file:///doc.txt".to_string();

        let mut manager = DocumentStateManager::new();
        let opened = manager.open(&[(uri.clone(), path.clone())]).await.unwrap();
        assert_eq!(opened, vec![uri.clone()]);
        assert_eq!(manager.get(&uri).unwrap().content, "hello");
        assert_eq!(manager.get(&uri).unwrap().version, 0);
        assert_eq!(manager.ref_count(&uri), 1);

        // Second open of the same document: nothing new, count bumps
        let opened = manager.open(&[(uri.clone(), path)]).await.unwrap();
        assert!(opened.is_empty());
        assert_eq!(manager.ref_count(&uri), 2);
    }

    #[tokio::test]
    async fn test_close_evicts_at_zero() {
        let (_dir, path) = temp_file(b"hello");
        let uri = "file:///doc.txt".to_string();

        let mut manager = DocumentStateManager::new();
        manager.open(&[(uri.clone(), path.clone())]).await.unwrap();
        manager.open(&[(uri.clone(), path)]).await.unwrap();

        assert!(manager.close(std::slice::from_ref(&uri)).is_empty());
        assert_eq!(manager.ref_count(&uri), 1);
        assert!(manager.is_tracked(&uri));

        let evicted = manager.close(std::slice::from_ref(&uri));
        assert_eq!(evicted, vec![uri.clone()]);
        assert!(!manager.is_tracked(&uri));
    }

    #[test]
    fn test_close_untracked_is_noop() {
        let mut manager = DocumentStateManager::new();
        assert!(manager.close(&["file:///ghost".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let mut manager = DocumentStateManager::new();
        let result = manager
            .open(&[("file:///missing".to_string(), PathBuf::from("/nonexistent/missing"))])
            .await;
        assert!(matches!(result, Err(DocumentError::Io { .. })));
    }

    #[test]
    fn test_decode_strict_utf8() {
        let path = Path::new("/x");
        let (text, encoding) = decode_bytes(path, "héllo".as_bytes()).unwrap();
        assert_eq!(text, "héllo");
        assert_eq!(encoding, UTF_8);
    }

    #[test]
    fn test_decode_utf16_bom() {
        let path = Path::new("/x");
        // UTF-16LE BOM + "hi"
        let bytes = [0xFF, 0xFE, b'h', 0x00, b'i', 0x00];
        let (text, encoding) = decode_bytes(path, &bytes).unwrap();
        assert_eq!(text, "hi");
        assert_eq!(encoding.name(), "UTF-16LE");
    }

    #[test]
    fn test_decode_invalid_bytes_is_hard_error() {
        let path = Path::new("/x");
        let result = decode_bytes(path, &[0xFF, 0xFF, 0x41]);
        assert!(matches!(result, Err(DocumentError::UnknownEncoding { .. })));
    }
}
