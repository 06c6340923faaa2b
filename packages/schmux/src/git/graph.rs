use std::path::Path;

use super::executor::run_git;
use super::types::GraphNode;

const GRAPH_LIMIT: u32 = 100;

/// Fetch the commit DAG fragment covering the local branch and its upstream.
/// Returns an empty graph for a repo with no commits yet.
pub async fn graph(dir: &Path) -> Result<Vec<GraphNode>, String> {
    // NUL as field separator, \x1e between fields and refs, \x1f per record.
    let format = "--format=%H%x00%h%x00%an%x00%at%x00%P%x00%s%x1e%D%x1f";
    let count = format!("--max-count={GRAPH_LIMIT}");
    let mut args = vec!["log", format, count.as_str(), "HEAD"];

    let has_upstream = run_git(dir, &["rev-parse", "--abbrev-ref", "@{upstream}"])
        .await
        .is_ok();
    if has_upstream {
        args.push("@{upstream}");
    }

    let output = match run_git(dir, &args).await {
        Ok(o) => o,
        // An unborn branch has no log; the graph is simply empty.
        Err(e) if e.contains("does not have any commits") => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(parse_graph_output(&output))
}

/// Parse the NUL-formatted log output into graph nodes. Malformed records
/// are skipped.
pub fn parse_graph_output(output: &str) -> Vec<GraphNode> {
    let mut nodes = Vec::new();
    for record in output.split('\x1f') {
        let record = record.trim_matches(['\n', '\r']);
        if record.is_empty() {
            continue;
        }

        let (fields_part, refs_str) = match record.split_once('\x1e') {
            Some((f, r)) => (f, r),
            None => (record, ""),
        };

        let fields: Vec<&str> = fields_part.splitn(6, '\0').collect();
        if fields.len() < 6 {
            continue;
        }

        let parents: Vec<String> = fields[4]
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let refs: Vec<String> = refs_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        nodes.push(GraphNode {
            hash: fields[0].to_string(),
            short_hash: fields[1].to_string(),
            author: fields[2].to_string(),
            timestamp: fields[3].parse().unwrap_or(0),
            parents,
            message: fields[5].to_string(),
            is_head: refs,
        });
    }
    nodes
}
