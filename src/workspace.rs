//! Workspace folders and file URIs
//!
//! A workspace is an ordered set of named folders with a distinguished
//! root. Folders are what gets advertised during the initialize handshake
//! and auto-mounted into container backends.

use std::path::{Path, PathBuf};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

/// Name reserved for the primary workspace folder
pub const ROOT_FOLDER_NAME: &str = "root";

/// Characters escaped in the path portion of a file URI
const URI_PATH_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%');

/// Build a `file://` URI from a filesystem path
pub fn path_to_uri(path: &Path) -> String {
    let path_str = path.to_string_lossy();
    format!("file://{}", utf8_percent_encode(&path_str, URI_PATH_SET))
}

/// Recover a filesystem path from a `file://` URI
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let encoded = uri.strip_prefix("file://")?;
    let decoded = percent_decode_str(encoded).decode_utf8().ok()?;
    Some(PathBuf::from(decoded.as_ref()))
}

/// One named workspace folder
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceFolder {
    pub name: String,
    pub uri: String,
    pub path: PathBuf,
}

impl WorkspaceFolder {
    pub fn new<N: Into<String>, P: Into<PathBuf>>(name: N, path: P) -> Self {
        let path = path.into();
        Self {
            name: name.into(),
            uri: path_to_uri(&path),
            path,
        }
    }
}

/// Ordered set of workspace folders; the first one is the root.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    folders: Vec<WorkspaceFolder>,
}

impl Workspace {
    /// Workspace with a single root folder
    pub fn single<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            folders: vec![WorkspaceFolder::new(ROOT_FOLDER_NAME, path)],
        }
    }

    /// Workspace from several folder paths; the first becomes the root,
    /// the rest are named after their final path component.
    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut workspace = Self::default();
        for (index, path) in paths.into_iter().enumerate() {
            let path = path.into();
            let name = if index == 0 {
                ROOT_FOLDER_NAME.to_string()
            } else {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("folder-{index}"))
            };
            workspace.folders.push(WorkspaceFolder::new(name, path));
        }
        workspace
    }

    pub fn folders(&self) -> &[WorkspaceFolder] {
        &self.folders
    }

    /// The primary folder, if the workspace has any
    pub fn root(&self) -> Option<&WorkspaceFolder> {
        self.folders.first()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Folder URIs in declaration order
    pub fn folder_uris(&self) -> Vec<String> {
        self.folders.iter().map(|f| f.uri.clone()).collect()
    }

    /// Folders in the shape the initialize handshake wants
    pub fn lsp_folders(&self) -> Vec<lsp_types::WorkspaceFolder> {
        self.folders
            .iter()
            .filter_map(|f| {
                Some(lsp_types::WorkspaceFolder {
                    uri: f.uri.parse().ok()?,
                    name: f.name.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_uri_roundtrip() {
        let path = Path::new("/home/user/project");
        let uri = path_to_uri(path);
        assert_eq!(uri, "file:///home/user/project");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn test_path_uri_escapes_spaces() {
        let path = Path::new("/tmp/my project/file.rs");
        let uri = path_to_uri(path);
        assert_eq!(uri, "file:///tmp/my%20project/file.rs");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn test_uri_to_path_rejects_other_schemes() {
        assert!(uri_to_path("https://example.com/x").is_none());
    }

    #[test]
    fn test_single_workspace_has_root() {
        let workspace = Workspace::single("/srv/code");
        let root = workspace.root().unwrap();
        assert_eq!(root.name, ROOT_FOLDER_NAME);
        assert_eq!(root.uri, "file:///srv/code");
        assert_eq!(workspace.folder_uris(), vec!["file:///srv/code"]);
    }

    #[test]
    fn test_from_paths_names_secondary_folders() {
        let workspace = Workspace::from_paths(["/srv/main", "/srv/deps/vendored"]);
        let names: Vec<&str> = workspace.folders().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![ROOT_FOLDER_NAME, "vendored"]);
    }

    #[test]
    fn test_lsp_folders_shape() {
        let workspace = Workspace::single("/srv/code");
        let folders = workspace.lsp_folders();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, ROOT_FOLDER_NAME);
        assert_eq!(folders[0].uri.as_str(), "file:///srv/code");
    }
}
