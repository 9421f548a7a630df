//! Filesystem tools for termpal
//!
//! This module provides tools for reading, writing and listing files. Every
//! path is confined to the workspace configured on the [`ToolContext`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, TermpalError, ToolErrorKind};
use crate::security::validate_path_in_workspace;
use crate::utils::string::clip_middle;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};

/// Resolve and validate a path relative to the workspace.
///
/// Requires a workspace to be configured; filesystem tools refuse to run
/// without one.
fn resolve_path(path: &str, ctx: &ToolContext) -> Result<PathBuf> {
    let workspace = workspace(ctx)?;
    Ok(validate_path_in_workspace(path, workspace)?.into_path_buf())
}

fn workspace(ctx: &ToolContext) -> Result<&Path> {
    ctx.workspace.as_deref().ok_or_else(|| {
        TermpalError::SecurityViolation(
            "Workspace not configured; filesystem tools require a workspace".to_string(),
        )
    })
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| TermpalError::tool_failed(format!("Missing '{}' argument", key)))
}

/// Tool for reading file contents.
///
/// # Parameters
/// - `path`: The path to the file to read (required)
///
/// # Example
/// ```rust
/// use termpal::tools::{Tool, ToolContext};
/// use termpal::tools::filesystem::ReadFileTool;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();
/// let ctx = ToolContext::new().with_workspace(dir.path());
/// let result = ReadFileTool.execute(json!({"path": "hello.txt"}), &ctx).await.unwrap();
/// assert_eq!(result.content, "hello");
/// # });
/// ```
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the workspace"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemRead
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = str_arg(&args, "path")?;
        let full_path = resolve_path(path, ctx)?;

        let content = tokio::fs::read_to_string(&full_path).await.map_err(|e| {
            TermpalError::tool_failed(format!("Failed to read file '{}': {}", path, e))
        })?;

        if ctx.max_output_chars > 0 {
            Ok(ToolOutput::ok(clip_middle(&content, ctx.max_output_chars)))
        } else {
            Ok(ToolOutput::ok(content))
        }
    }
}

/// Tool for writing content to a file.
///
/// The content goes to a temporary file next to the target which is then
/// renamed over it, so readers never see a half-written file. A cancelled
/// turn leaves the target untouched.
///
/// # Parameters
/// - `path`: The path to the file to write (required)
/// - `content`: The content to write to the file (required)
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating it if necessary"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemWrite
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = str_arg(&args, "path")?.to_string();
        let content = str_arg(&args, "content")?.to_string();
        let full_path = resolve_path(&path, ctx)?;

        let parent = full_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| TermpalError::tool_failed(format!("'{}' has no parent", path)))?;
        tokio::fs::create_dir_all(&parent).await.map_err(|e| {
            TermpalError::tool_failed(format!("Failed to create parent directories: {}", e))
        })?;

        let cancel = ctx.cancel.clone();
        let bytes = content.len();
        let target = full_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            if cancel.is_cancelled() {
                return Err(TermpalError::Cancelled);
            }
            tmp.persist(&target).map_err(|e| TermpalError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| TermpalError::tool_failed(format!("write task failed: {}", e)))?
        .map_err(|e| match e {
            TermpalError::Cancelled => TermpalError::Cancelled,
            other => TermpalError::tool_failed(format!("Failed to write '{}': {}", path, other)),
        })?;

        Ok(ToolOutput::ok(format!("Wrote {} bytes to {}", bytes, path)))
    }
}

/// Tool for listing files in the workspace.
///
/// Returns a JSON array of paths relative to the workspace. Directories carry
/// a trailing `/`.
///
/// # Parameters
/// - `path`: Directory to list, defaults to the workspace root (optional)
/// - `pattern`: Glob evaluated under `path`, e.g. `**/*.rs` (optional)
pub struct ListFilesTool;

impl ListFilesTool {
    fn relative(workspace: &Path, path: &Path, is_dir: bool) -> String {
        let rel = path.strip_prefix(workspace).unwrap_or(path);
        let mut name = rel.to_string_lossy().to_string();
        if is_dir {
            name.push('/');
        }
        name
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in a workspace directory, optionally filtered by a glob pattern"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemRead
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: workspace root)"
                },
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern such as '*.md' or '**/*.rs'"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let dir = resolve_path(path, ctx)?;
        let root = workspace(ctx)?.canonicalize()?;

        let mut items = Vec::new();
        match args.get("pattern").and_then(|v| v.as_str()) {
            Some(pattern) => {
                if pattern.split('/').any(|part| part == "..") {
                    return Err(TermpalError::SecurityViolation(
                        "Glob pattern may not contain '..'".to_string(),
                    ));
                }
                let full = dir.join(pattern);
                let paths = glob::glob(&full.to_string_lossy()).map_err(|e| {
                    TermpalError::Tool {
                        kind: ToolErrorKind::ArgumentValidation,
                        message: format!("Invalid glob pattern '{}': {}", pattern, e),
                    }
                })?;
                for entry in paths.flatten() {
                    ctx.checkpoint()?;
                    items.push(Self::relative(&root, &entry, entry.is_dir()));
                }
            }
            None => {
                let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                    TermpalError::tool_failed(format!("Failed to read directory '{}': {}", path, e))
                })?;
                while let Some(entry) = entries.next_entry().await.map_err(|e| {
                    TermpalError::tool_failed(format!("Failed to read directory entry: {}", e))
                })? {
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|ft| ft.is_dir())
                        .unwrap_or(false);
                    items.push(Self::relative(&root, &entry.path(), is_dir));
                }
            }
        }

        items.sort();
        Ok(ToolOutput::ok(serde_json::to_string(&items)?))
    }
}
