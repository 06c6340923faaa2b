use serde::{Deserialize, Serialize};

use crate::models::Workspace;

/// One commit in the two-lane graph fragment (local branch + upstream).
/// Lane assignment and edge routing are client-side concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
    pub parents: Vec<String>,
    /// Ref names pointing at this commit (HEAD, branch, upstream).
    pub is_head: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Untracked,
}

/// Per-file working-tree diff. Binary files report status only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    #[serde(default)]
    pub binary: bool,
}

/// Structured diff produced by the reconciliation scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanDelta {
    pub added: Vec<Workspace>,
    pub updated: Vec<ScanUpdate>,
    pub removed: Vec<Workspace>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanUpdate {
    pub old: Workspace,
    pub new: Workspace,
}

impl ScanDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}
