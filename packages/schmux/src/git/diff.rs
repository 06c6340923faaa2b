use std::path::Path;

use super::executor::{run_git, run_git_bytes};
use super::types::{DiffFile, FileStatus};

/// Working-tree diff against HEAD, untracked files included. Binary files
/// are reported by status only, with contents omitted.
pub async fn working_tree_diff(dir: &Path) -> Result<Vec<DiffFile>, String> {
    let porcelain = run_git(dir, &["status", "--porcelain=v2"]).await?;
    let entries = parse_porcelain_files(&porcelain);

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        files.push(assemble(dir, entry).await);
    }
    Ok(files)
}

/// One entry from `git status --porcelain=v2`: status plus old/new paths.
#[derive(Debug, Clone, PartialEq)]
pub struct PorcelainEntry {
    pub status: FileStatus,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
}

/// Parse `git status --porcelain=v2` output.
///
/// Entry shapes: `1 XY sub mH mI mW hH hI path` for ordinary changes,
/// `2 XY sub mH mI mW hH hI Xscore path\torigPath` for renames,
/// `u ...` for unmerged paths, and `? path` for untracked. Header (`#`) and
/// ignored (`!`) lines are skipped. The working-tree column wins over the
/// index column when both are set.
pub fn parse_porcelain_files(output: &str) -> Vec<PorcelainEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("? ") {
            entries.push(PorcelainEntry {
                status: FileStatus::Untracked,
                old_path: None,
                new_path: Some(path.to_string()),
            });
        } else if line.starts_with("1 ") {
            // "1 XY sub mH mI mW hH hI path": the path is everything after
            // the eight fixed fields, so spaces in it survive.
            let parts: Vec<&str> = line.splitn(9, ' ').collect();
            if parts.len() < 9 {
                continue;
            }
            let Some(status) = status_from_xy(parts[1]) else {
                continue;
            };
            let path = parts[8].to_string();
            let (old_path, new_path) = match status {
                FileStatus::Added => (None, Some(path)),
                FileStatus::Deleted => (Some(path), None),
                _ => (Some(path.clone()), Some(path)),
            };
            entries.push(PorcelainEntry {
                status,
                old_path,
                new_path,
            });
        } else if line.starts_with("2 ") {
            // Rename: the last field is "path<TAB>origPath".
            let parts: Vec<&str> = line.splitn(10, ' ').collect();
            if parts.len() < 10 {
                continue;
            }
            let (new, old) = match parts[9].split_once('\t') {
                Some((new, old)) => (new.to_string(), old.to_string()),
                None => (parts[9].to_string(), parts[9].to_string()),
            };
            entries.push(PorcelainEntry {
                status: FileStatus::Renamed,
                old_path: Some(old),
                new_path: Some(new),
            });
        } else if line.starts_with("u ") {
            // Unmerged: both sides exist in the working tree mid-conflict.
            let parts: Vec<&str> = line.splitn(11, ' ').collect();
            if parts.len() < 11 {
                continue;
            }
            let path = parts[10].to_string();
            entries.push(PorcelainEntry {
                status: FileStatus::Modified,
                old_path: Some(path.clone()),
                new_path: Some(path),
            });
        }
    }
    entries
}

/// Map a porcelain v2 `XY` pair to a file status; `X` is the index column,
/// `Y` the working tree.
fn status_from_xy(xy: &str) -> Option<FileStatus> {
    let mut chars = xy.chars();
    let x = chars.next()?;
    let y = chars.next()?;
    let effective = if y != '.' { y } else { x };
    match effective {
        'A' => Some(FileStatus::Added),
        'M' | 'T' => Some(FileStatus::Modified),
        'D' => Some(FileStatus::Deleted),
        'R' => Some(FileStatus::Renamed),
        _ => None,
    }
}

async fn assemble(dir: &Path, entry: PorcelainEntry) -> DiffFile {
    let old_bytes = match &entry.old_path {
        Some(path) => {
            let spec = format!("HEAD:{path}");
            run_git_bytes(dir, &["show", &spec]).await.ok()
        }
        None => None,
    };
    let new_bytes = match &entry.new_path {
        Some(path) => tokio::fs::read(dir.join(path)).await.ok(),
        None => None,
    };

    let binary = old_bytes.as_deref().map(is_binary).unwrap_or(false)
        || new_bytes.as_deref().map(is_binary).unwrap_or(false);

    let (old_content, new_content) = if binary {
        (None, None)
    } else {
        (
            old_bytes.map(|b| String::from_utf8_lossy(&b).into_owned()),
            new_bytes.map(|b| String::from_utf8_lossy(&b).into_owned()),
        )
    };

    DiffFile {
        old_path: entry.old_path,
        new_path: entry.new_path,
        status: entry.status,
        old_content,
        new_content,
        binary,
    }
}

/// Same heuristic git uses: a NUL in the first 8000 bytes means binary.
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8000).any(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty() {
        assert!(parse_porcelain_files("").is_empty());
    }

    #[test]
    fn parse_untracked() {
        let entries = parse_porcelain_files("? new_file.rs\n? src/other.rs\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, FileStatus::Untracked);
        assert_eq!(entries[0].new_path.as_deref(), Some("new_file.rs"));
        assert!(entries[0].old_path.is_none());
    }

    #[test]
    fn parse_modified_staged_and_unstaged() {
        let output = "\
1 .M N... 100644 100644 100644 abc123 def456 src/lib.rs
1 M. N... 100644 100644 100644 abc123 def456 src/main.rs
1 MM N... 100644 100644 100644 abc123 def456 both.rs
";
        let entries = parse_porcelain_files(output);
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert_eq!(entry.status, FileStatus::Modified);
            assert_eq!(entry.old_path, entry.new_path);
        }
    }

    #[test]
    fn parse_added() {
        let output = "1 A. N... 000000 100644 100644 0000000 abc123 brand_new.rs\n";
        let entries = parse_porcelain_files(output);
        assert_eq!(entries[0].status, FileStatus::Added);
        assert!(entries[0].old_path.is_none());
        assert_eq!(entries[0].new_path.as_deref(), Some("brand_new.rs"));
    }

    #[test]
    fn parse_deleted() {
        let output = "1 .D N... 100644 100644 000000 abc123 0000000 gone.rs\n";
        let entries = parse_porcelain_files(output);
        assert_eq!(entries[0].status, FileStatus::Deleted);
        assert_eq!(entries[0].old_path.as_deref(), Some("gone.rs"));
        assert!(entries[0].new_path.is_none());
    }

    #[test]
    fn parse_rename_with_tab_separator() {
        let output = "2 R. N... 100644 100644 100644 abc123 def456 R100 new_name.rs\told_name.rs\n";
        let entries = parse_porcelain_files(output);
        assert_eq!(entries[0].status, FileStatus::Renamed);
        assert_eq!(entries[0].old_path.as_deref(), Some("old_name.rs"));
        assert_eq!(entries[0].new_path.as_deref(), Some("new_name.rs"));
    }

    #[test]
    fn parse_unmerged() {
        let output = "u UU N... 100644 100644 100644 100644 abc123 def456 fed789 conflicted.rs\n";
        let entries = parse_porcelain_files(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, FileStatus::Modified);
        assert_eq!(entries[0].new_path.as_deref(), Some("conflicted.rs"));
    }

    #[test]
    fn parse_skips_headers_and_ignored() {
        let output = "\
# branch.oid abc123
# branch.head main
! target/debug/build
1 .M N... 100644 100644 100644 abc123 def456 kept.rs
";
        let entries = parse_porcelain_files(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].new_path.as_deref(), Some("kept.rs"));
    }

    #[test]
    fn parse_skips_malformed_records() {
        let output = "1 M.\n1 .M N... 100644 100644 100644 abc123 def456 good.rs\n";
        let entries = parse_porcelain_files(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].new_path.as_deref(), Some("good.rs"));
    }

    #[test]
    fn binary_detection() {
        assert!(is_binary(b"\x00\x01\x02"));
        assert!(is_binary(b"text then \x00 nul"));
        assert!(!is_binary(b"plain old text\nwith lines\n"));
        assert!(!is_binary(b""));
    }

    #[test]
    fn paths_with_spaces_survive() {
        let output =
            "1 .M N... 100644 100644 100644 abc123 def456 dir with space/file name.rs\n";
        let entries = parse_porcelain_files(output);
        assert_eq!(
            entries[0].new_path.as_deref(),
            Some("dir with space/file name.rs")
        );
    }
}
