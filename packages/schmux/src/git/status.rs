use std::path::Path;

use super::executor::run_git;
use crate::models::GitStats;

/// Compute the cached workspace stats: ahead/behind against upstream, dirty
/// flag, and working-tree diff totals. With no upstream configured,
/// ahead/behind stay zero and dirty is still computed.
pub async fn compute_stats(dir: &Path) -> Result<GitStats, String> {
    let mut stats = GitStats::default();

    match run_git(dir, &["rev-list", "--left-right", "--count", "@{upstream}...HEAD"]).await {
        Ok(out) => {
            if let Some((behind, ahead)) = parse_ahead_behind(&out) {
                stats.behind = behind;
                stats.ahead = ahead;
            }
        }
        // No upstream is a normal configuration, not an error.
        Err(_) => {}
    }

    let porcelain = run_git(dir, &["status", "--porcelain"]).await?;
    stats.dirty = !porcelain.trim().is_empty();

    let numstat = run_git(dir, &["diff", "HEAD", "--numstat"]).await.unwrap_or_default();
    let (files, added, removed) = parse_numstat(&numstat);
    stats.files_changed = files;
    stats.lines_added = added;
    stats.lines_removed = removed;

    // Untracked files count toward files_changed but have no numstat rows.
    let untracked = porcelain
        .lines()
        .filter(|l| l.starts_with("?? "))
        .count() as u32;
    stats.files_changed += untracked;

    Ok(stats)
}

/// Parse `git rev-list --left-right --count @{upstream}...HEAD` output:
/// `<behind>\t<ahead>` (left side is commits only on the upstream).
pub fn parse_ahead_behind(out: &str) -> Option<(u32, u32)> {
    let mut parts = out.split_whitespace();
    let behind = parts.next()?.parse().ok()?;
    let ahead = parts.next()?.parse().ok()?;
    Some((behind, ahead))
}

/// Parse `git diff --numstat` into (files, lines_added, lines_removed).
/// Binary files report `-` counts and contribute only to the file total.
pub fn parse_numstat(out: &str) -> (u32, u32, u32) {
    let mut files = 0u32;
    let mut added = 0u32;
    let mut removed = 0u32;
    for line in out.lines() {
        let mut parts = line.split('\t');
        let (Some(a), Some(r)) = (parts.next(), parts.next()) else {
            continue;
        };
        if parts.next().is_none() {
            continue;
        }
        files += 1;
        added += a.parse::<u32>().unwrap_or(0);
        removed += r.parse::<u32>().unwrap_or(0);
    }
    (files, added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ahead_behind_parses_tab_separated_counts() {
        assert_eq!(parse_ahead_behind("3\t5\n"), Some((3, 5)));
        assert_eq!(parse_ahead_behind("0\t0"), Some((0, 0)));
    }

    #[test]
    fn ahead_behind_rejects_garbage() {
        assert_eq!(parse_ahead_behind(""), None);
        assert_eq!(parse_ahead_behind("abc\tdef"), None);
        assert_eq!(parse_ahead_behind("3"), None);
    }

    #[test]
    fn numstat_totals() {
        let out = "10\t2\tsrc/main.rs\n0\t5\tREADME.md\n";
        assert_eq!(parse_numstat(out), (2, 10, 7));
    }

    #[test]
    fn numstat_binary_rows_count_file_only() {
        let out = "-\t-\tassets/logo.png\n3\t1\tsrc/lib.rs\n";
        assert_eq!(parse_numstat(out), (2, 3, 1));
    }

    #[test]
    fn numstat_empty() {
        assert_eq!(parse_numstat(""), (0, 0, 0));
    }

    #[test]
    fn numstat_ignores_malformed_lines() {
        let out = "not-a-numstat-line\n4\t4\ta.rs\n";
        assert_eq!(parse_numstat(out), (1, 4, 4));
    }
}
