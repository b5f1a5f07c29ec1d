//! Grep tool - Regex search across files

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use walkdir::{DirEntry, WalkDir};

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResult};

/// Directories never worth searching
const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];
const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_HEAD_LIMIT: usize = 250;

pub struct GrepTool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OutputMode {
    #[default]
    FilesWithMatches,
    Content,
    Count,
}

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default)]
    output_mode: OutputMode,
    #[serde(default)]
    case_insensitive: bool,
    #[serde(default)]
    head_limit: Option<usize>,
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Filter files with a glob. \
         output_mode: files_with_matches (default), content, or count."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search. Defaults to the working directory"
                },
                "glob": {
                    "type": "string",
                    "description": "Only search files matching this glob (e.g. \"*.rs\", \"src/**/*.ts\")"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["files_with_matches", "content", "count"],
                    "description": "What to return for each match"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Case insensitive search"
                },
                "head_limit": {
                    "type": "number",
                    "description": "Return at most this many entries (default 250)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let regex = match RegexBuilder::new(&params.pattern)
            .case_insensitive(params.case_insensitive)
            .build()
        {
            Ok(r) => r,
            Err(e) => return ToolResult::invalid_parameters(format!("Invalid pattern: {}", e)),
        };
        let filter = match params.glob.as_deref().map(glob::Pattern::new).transpose() {
            Ok(f) => f,
            Err(e) => return ToolResult::invalid_parameters(format!("Invalid glob: {}", e)),
        };

        let root = match &params.path {
            Some(path) => ctx.resolve_path(path),
            None => ctx.working_dir.clone(),
        };
        if !root.exists() {
            return ToolResult::error(format!("Path not found: {}", root.display()));
        }

        let limit = params.head_limit.unwrap_or(DEFAULT_HEAD_LIMIT).max(1);
        let mode = params.output_mode;
        let base = ctx.working_dir.clone();
        let search = tokio::task::spawn_blocking(move || {
            search(&root, &base, &regex, filter.as_ref(), mode, limit)
        });

        match search.await {
            Ok(found) => ToolResult::success_data(json!({
                "mode": match mode {
                    OutputMode::FilesWithMatches => "files_with_matches",
                    OutputMode::Content => "content",
                    OutputMode::Count => "count",
                },
                "results": found.entries,
                "files_searched": found.files_searched,
                "truncated": found.truncated
            })),
            Err(e) => ToolResult::error(format!("Search failed: {}", e)),
        }
    }
}

struct Found {
    entries: Vec<String>,
    files_searched: usize,
    truncated: bool,
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn glob_matches(filter: &glob::Pattern, path: &Path, root: &Path) -> bool {
    if filter.as_str().contains('/') {
        let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        filter.matches_path(&relative)
    } else {
        path.file_name()
            .map(|name| filter.matches(&name.to_string_lossy()))
            .unwrap_or(false)
    }
}

fn search(
    root: &Path,
    base: &Path,
    regex: &regex::Regex,
    filter: Option<&glob::Pattern>,
    mode: OutputMode,
    limit: usize,
) -> Found {
    let mut found = Found {
        entries: Vec::new(),
        files_searched: 0,
        truncated: false,
    };

    let files = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file());

    for entry in files {
        let path = entry.path();
        if let Some(filter) = filter {
            if !glob_matches(filter, path, root) {
                continue;
            }
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(bytes) = std::fs::read(path) else {
            continue;
        };
        if bytes[..bytes.len().min(8192)].contains(&0) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        found.files_searched += 1;

        let shown = display_path(path, base);
        match mode {
            OutputMode::FilesWithMatches => {
                if regex.is_match(&text) {
                    found.entries.push(shown);
                }
            }
            OutputMode::Count => {
                let count = text.lines().filter(|l| regex.is_match(l)).count();
                if count > 0 {
                    found.entries.push(format!("{}:{}", shown, count));
                }
            }
            OutputMode::Content => {
                for (number, line) in text.lines().enumerate() {
                    if regex.is_match(line) {
                        found.entries.push(format!("{}:{}:{}", shown, number + 1, line));
                        if found.entries.len() > limit {
                            break;
                        }
                    }
                }
            }
        }

        if found.entries.len() > limit {
            break;
        }
    }

    if found.entries.len() > limit {
        found.entries.truncate(limit);
        found.truncated = true;
    }
    found
}
