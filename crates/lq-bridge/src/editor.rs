//! Namespaced file-tree operations for the in-browser editor.
//!
//! Every namespace is a directory under the workspaces root. Paths coming
//! from the client are resolved lexically under that directory and refused if
//! they would leave it.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lq_core::config::EditorConfig;
use lq_core::protocol::{EditorOp, Event};
use lq_core::sink::EventSink;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::dispatcher::{self, Dispatcher, Handler, HandlerDescriptor};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("Path escapes namespace root")]
    PathEscapes,

    #[error("Target is a directory")]
    IsDirectory,

    #[error("Target is a directory; use folder:delete")]
    DeleteDirectory,

    #[error("File already exists")]
    AlreadyExists,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("tree scan failed: {0}")]
    Scan(String),
}

pub type Result<T> = std::result::Result<T, EditorError>;

// ---------------------------------------------------------------------------
// TreeNode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    /// `/`-separated path relative to the namespace root.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    template: Option<PathBuf>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, template: Option<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root, template }
    }

    pub fn from_config(config: &EditorConfig) -> Self {
        Self::new(config.root(), config.template())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The tree of `namespace`, creating (and seeding from the template) the
    /// namespace directory on first access.
    pub async fn tree(&self, namespace: &str) -> Result<Vec<TreeNode>> {
        let ns_root = self.namespace_dir(namespace)?;
        if !tokio::fs::try_exists(&ns_root).await? {
            tokio::fs::create_dir_all(&ns_root).await?;
            if let Some(template) = self.template.clone().filter(|t| t.is_dir()) {
                let dest = ns_root.clone();
                tokio::task::spawn_blocking(move || copy_dir(&template, &dest))
                    .await
                    .map_err(|e| EditorError::Scan(e.to_string()))??;
                info!(namespace, "seeded namespace from template");
            }
        }
        tokio::task::spawn_blocking(move || scan(&ns_root, &ns_root))
            .await
            .map_err(|e| EditorError::Scan(e.to_string()))?
    }

    pub async fn read_file(&self, namespace: &str, rel: &str) -> Result<String> {
        let abs = self.resolve(namespace, rel).await?;
        if tokio::fs::metadata(&abs).await?.is_dir() {
            return Err(EditorError::IsDirectory);
        }
        Ok(tokio::fs::read_to_string(&abs).await?)
    }

    pub async fn write_file(&self, namespace: &str, rel: &str, content: &str) -> Result<()> {
        let abs = self.resolve(namespace, rel).await?;
        ensure_parent(&abs).await?;
        tokio::fs::write(&abs, content).await?;
        Ok(())
    }

    /// Create a new file; fails if it already exists.
    pub async fn create_file(&self, namespace: &str, rel: &str, content: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let abs = self.resolve(namespace, rel).await?;
        ensure_parent(&abs).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abs)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => EditorError::AlreadyExists,
                _ => EditorError::Io(e),
            })?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn delete_file(&self, namespace: &str, rel: &str) -> Result<()> {
        let abs = self.resolve(namespace, rel).await?;
        if tokio::fs::metadata(&abs).await?.is_dir() {
            return Err(EditorError::DeleteDirectory);
        }
        tokio::fs::remove_file(&abs).await?;
        Ok(())
    }

    /// Move a file or folder, creating the destination's parents.
    pub async fn rename(&self, namespace: &str, old: &str, new: &str) -> Result<()> {
        let from = self.resolve(namespace, old).await?;
        let to = self.resolve(namespace, new).await?;
        ensure_parent(&to).await?;
        tokio::fs::rename(&from, &to).await?;
        Ok(())
    }

    pub async fn create_folder(&self, namespace: &str, rel: &str) -> Result<()> {
        let abs = self.resolve(namespace, rel).await?;
        tokio::fs::create_dir_all(&abs).await?;
        Ok(())
    }

    /// Recursive delete; a missing target is not an error.
    pub async fn delete_folder(&self, namespace: &str, rel: &str) -> Result<()> {
        let abs = self.resolve(namespace, rel).await?;
        let meta = match tokio::fs::symlink_metadata(&abs).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&abs).await?;
        } else {
            tokio::fs::remove_file(&abs).await?;
        }
        Ok(())
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf> {
        resolve_under(&self.root, namespace)
    }

    /// Resolve `rel` inside an existing (created if needed) namespace.
    async fn resolve(&self, namespace: &str, rel: &str) -> Result<PathBuf> {
        let ns_root = self.namespace_dir(namespace)?;
        let abs = resolve_under(&ns_root, rel)?;
        tokio::fs::create_dir_all(&ns_root).await?;
        Ok(abs)
    }
}

/// Lexically join `rel` onto `base`. Leading separators are ignored; the
/// result must lie strictly below `base`.
fn resolve_under(base: &Path, rel: &str) -> Result<PathBuf> {
    let trimmed = rel.trim_start_matches(['/', '\\']);
    let mut out = base.to_path_buf();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(EditorError::PathEscapes);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(EditorError::PathEscapes),
        }
    }
    if out == base || !out.starts_with(base) {
        return Err(EditorError::PathEscapes);
    }
    Ok(out)
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Folders first, then files, each sorted by name.
fn scan(dir: &Path, base: &Path) -> Result<Vec<TreeNode>> {
    let mut folders = Vec::new();
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let id = path
            .strip_prefix(base)
            .unwrap_or(path.as_path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type()?.is_dir() {
            folders.push(TreeNode {
                id,
                name,
                kind: NodeKind::Folder,
                children: Some(scan(&path, base)?),
            });
        } else {
            files.push(TreeNode {
                id,
                name,
                kind: NodeKind::File,
                children: None,
            });
        }
    }

    folders.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));
    folders.extend(files);
    Ok(folders)
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatcher wiring
// ---------------------------------------------------------------------------

/// One editor operation, registered under its wire name (`file:read`, ...).
pub struct EditorHandler {
    op: EditorOp,
    workspace: Arc<Workspace>,
}

impl EditorHandler {
    pub fn new(op: EditorOp, workspace: Arc<Workspace>) -> Self {
        Self { op, workspace }
    }

    async fn run(&self, data: &Value) -> Result<Value> {
        let ws = &self.workspace;
        let namespace = field(data, "namespace")?;
        match self.op {
            EditorOp::TreeGet => {
                let tree = ws.tree(namespace).await?;
                Ok(json!({ "namespace": namespace, "tree": tree }))
            }
            EditorOp::FileRead => {
                let path = field(data, "path")?;
                let content = ws.read_file(namespace, path).await?;
                Ok(json!({ "namespace": namespace, "path": path, "content": content }))
            }
            EditorOp::FileWrite => {
                let path = field(data, "path")?;
                let content = field(data, "content")?;
                ws.write_file(namespace, path, content).await?;
                Ok(json!({ "namespace": namespace, "path": path }))
            }
            EditorOp::FileCreate => {
                let path = field(data, "path")?;
                let content = data.get("content").and_then(Value::as_str).unwrap_or("");
                ws.create_file(namespace, path, content).await?;
                Ok(json!({ "namespace": namespace, "path": path }))
            }
            EditorOp::FileDelete => {
                let path = field(data, "path")?;
                ws.delete_file(namespace, path).await?;
                Ok(json!({ "namespace": namespace, "path": path }))
            }
            EditorOp::FolderCreate => {
                let path = field(data, "path")?;
                ws.create_folder(namespace, path).await?;
                Ok(json!({ "namespace": namespace, "path": path }))
            }
            EditorOp::FolderDelete => {
                let path = field(data, "path")?;
                ws.delete_folder(namespace, path).await?;
                Ok(json!({ "namespace": namespace, "path": path }))
            }
            EditorOp::FileRename | EditorOp::FolderRename => {
                let old_path = field(data, "oldPath")?;
                let new_path = field(data, "newPath")?;
                ws.rename(namespace, old_path, new_path).await?;
                Ok(json!({ "namespace": namespace, "oldPath": old_path, "newPath": new_path }))
            }
        }
    }
}

#[async_trait]
impl Handler for EditorHandler {
    async fn handle(&self, data: Value, sink: &EventSink) -> dispatcher::Result<()> {
        match self.run(&data).await {
            Ok(result) => {
                debug!(op = %self.op, "editor op ok");
                sink.emit(Event::EditorOk {
                    op: self.op,
                    data: result,
                });
            }
            Err(e) => {
                debug!(op = %self.op, "editor op failed: {e}");
                sink.emit(Event::EditorError {
                    op: self.op,
                    data: error_data(&data, &e),
                });
            }
        }
        Ok(())
    }
}

fn field<'a>(data: &'a Value, name: &'static str) -> Result<&'a str> {
    data.get(name)
        .and_then(Value::as_str)
        .ok_or(EditorError::MissingField(name))
}

/// The identifying request fields plus `message`.
fn error_data(request: &Value, error: &EditorError) -> Value {
    let mut out = Map::new();
    for key in ["namespace", "path", "oldPath", "newPath"] {
        if let Some(value) = request.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    out.insert("message".to_string(), Value::String(error.to_string()));
    Value::Object(out)
}

/// The dispatcher behind `/editor`.
pub fn editor_dispatcher(workspace: Arc<Workspace>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new("editor");
    for op in EditorOp::ALL {
        dispatcher.register(
            HandlerDescriptor::new(op.as_str(), describe(op)),
            Arc::new(EditorHandler::new(op, workspace.clone())),
        );
    }
    dispatcher
}

fn describe(op: EditorOp) -> &'static str {
    match op {
        EditorOp::TreeGet => "List a namespace as a file tree",
        EditorOp::FileRead => "Read a file",
        EditorOp::FileWrite => "Overwrite a file",
        EditorOp::FileCreate => "Create a new file",
        EditorOp::FileDelete => "Delete a file",
        EditorOp::FileRename => "Rename or move a file",
        EditorOp::FolderCreate => "Create a folder",
        EditorOp::FolderDelete => "Delete a folder recursively",
        EditorOp::FolderRename => "Rename or move a folder",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
