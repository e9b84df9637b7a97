//! Default `ToolExecutor` (§3 "tool names", §4.4 "tool worker pool").
//!
//! The exact tool surface an agent loop exposes is implementation-defined,
//! but `CacheConfig`'s defaults (`read_file`, `list_dir`, `grep`, `glob`,
//! `write_file`, `edit_file`, `apply_patch`, `delete_file`, `exec`) name a
//! concrete set this daemon must be able to run out of the box, the same
//! way [`crate::agent_default::HttpAgent`] and
//! [`crate::inference::HttpInferenceClient`] exist so the daemon runs
//! end-to-end without every deployment supplying its own adapter.
//!
//! Filesystem handlers are grounded in the teacher's dispatch shape
//! (`runtime/tools.rs`): one function per tool name, args pulled out of a
//! `serde_json::Value` by hand. `exec` is grounded in
//! `sd_process::tokenize` plus the `tokio::process::Command` construction
//! `ProcessManager::start` already uses for background processes (§4.5),
//! generalized here to a foreground, output-capturing run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use sd_domain::agent::ToolExecutor;
use sd_domain::cancel::CancelToken;
use sd_domain::error::{Error, Result};
use serde_json::{json, Value};

/// Runs the daemon's default tool set directly against the local
/// filesystem and process table, rooted at `root` (§4.9 "resolved-path
/// containment").
pub struct DefaultToolExecutor {
    root: PathBuf,
    exec_timeout: Duration,
}

impl DefaultToolExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exec_timeout: Duration::from_secs(120),
        }
    }

    /// Resolve `raw` against `root`, rejecting any path that escapes it.
    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let candidate = self.root.join(raw);
        let base = dunce_canonicalize(&self.root)?;
        let parent = candidate.parent().map(dunce_canonicalize).transpose()?.unwrap_or_else(|| base.clone());
        if !parent.starts_with(&base) {
            return Err(Error::InvalidInput(format!("path escapes tool root: {raw}")));
        }
        Ok(candidate)
    }
}

/// `Path::canonicalize` requires the path to exist; fall back to the
/// un-canonicalized parent when the target hasn't been created yet (e.g.
/// the directory a new file is about to be written into may itself be new).
fn dunce_canonicalize(path: &Path) -> Result<PathBuf> {
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidInput(format!("missing or non-string argument: {key}")))
}

#[async_trait]
impl ToolExecutor for DefaultToolExecutor {
    async fn run_tool(&self, name: &str, args_json: Value, cancel: &CancelToken) -> Result<String> {
        match name {
            "read_file" => self.read_file(&args_json).await,
            "write_file" => self.write_file(&args_json).await,
            "edit_file" | "apply_patch" => self.edit_file(&args_json).await,
            "delete_file" => self.delete_file(&args_json).await,
            "list_dir" => self.list_dir(&args_json).await,
            "grep" => self.grep(&args_json).await,
            "glob" => self.glob(&args_json).await,
            "exec" => self.exec(&args_json, cancel).await,
            other => Err(Error::InvalidInput(format!("unknown tool: {other}"))),
        }
    }
}

impl DefaultToolExecutor {
    async fn read_file(&self, args: &Value) -> Result<String> {
        let path = self.resolve(str_arg(args, "path")?)?;
        tokio::task::spawn_blocking(move || std::fs::read_to_string(&path).map_err(Error::from))
            .await
            .map_err(|e| Error::Other(format!("read_file task panicked: {e}")))?
    }

    async fn write_file(&self, args: &Value) -> Result<String> {
        let path = self.resolve(str_arg(args, "path")?)?;
        let content = str_arg(args, "content")?.to_string();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, content)?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Other(format!("write_file task panicked: {e}")))??;
        Ok(json!({ "ok": true }).to_string())
    }

    /// Replaces the first occurrence of `find` with `replace`. Matches the
    /// `apply_patch` name as well since both amount to a targeted,
    /// substring-scoped rewrite rather than a full-file overwrite.
    async fn edit_file(&self, args: &Value) -> Result<String> {
        let path = self.resolve(str_arg(args, "path")?)?;
        let find = str_arg(args, "find")?.to_string();
        let replace = str_arg(args, "replace")?.to_string();
        tokio::task::spawn_blocking(move || {
            let original = std::fs::read_to_string(&path)?;
            let Some(pos) = original.find(&find) else {
                return Err(Error::InvalidInput("find text not present in file".into()));
            };
            let mut updated = String::with_capacity(original.len());
            updated.push_str(&original[..pos]);
            updated.push_str(&replace);
            updated.push_str(&original[pos + find.len()..]);
            std::fs::write(&path, updated)?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Other(format!("edit_file task panicked: {e}")))??;
        Ok(json!({ "ok": true }).to_string())
    }

    async fn delete_file(&self, args: &Value) -> Result<String> {
        let path = self.resolve(str_arg(args, "path")?)?;
        tokio::task::spawn_blocking(move || std::fs::remove_file(&path).map_err(Error::from))
            .await
            .map_err(|e| Error::Other(format!("delete_file task panicked: {e}")))??;
        Ok(json!({ "ok": true }).to_string())
    }

    async fn list_dir(&self, args: &Value) -> Result<String> {
        let path = self.resolve(args.get("path").and_then(Value::as_str).unwrap_or("."))?;
        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type()?.is_dir() {
                    name.push('/');
                }
                names.push(name);
            }
            names.sort();
            Ok(names)
        })
        .await
        .map_err(|e| Error::Other(format!("list_dir task panicked: {e}")))??;
        Ok(json!({ "entries": entries }).to_string())
    }

    /// Greps `pattern` across files under `path` (default root), skipping
    /// anything that isn't valid UTF-8 rather than failing the whole call.
    async fn grep(&self, args: &Value) -> Result<String> {
        let pattern = str_arg(args, "pattern")?.to_string();
        let path = self.resolve(args.get("path").and_then(Value::as_str).unwrap_or("."))?;
        let regex = Regex::new(&pattern).map_err(|e| Error::InvalidInput(format!("invalid regex: {e}")))?;

        let matches = tokio::task::spawn_blocking(move || -> Vec<Value> {
            let mut out = Vec::new();
            for entry in walk(&path) {
                let Ok(text) = std::fs::read_to_string(&entry) else { continue };
                for (i, line) in text.lines().enumerate() {
                    if regex.is_match(line) {
                        out.push(json!({ "path": entry.display().to_string(), "line": i + 1, "text": line }));
                        if out.len() >= 500 {
                            return out;
                        }
                    }
                }
            }
            out
        })
        .await
        .map_err(|e| Error::Other(format!("grep task panicked: {e}")))?;

        Ok(json!({ "matches": matches }).to_string())
    }

    /// Matches filenames under `path` against a simple `*`/`?` glob,
    /// translated to a regex anchored on the whole relative path.
    async fn glob(&self, args: &Value) -> Result<String> {
        let pattern = str_arg(args, "pattern")?.to_string();
        let path = self.resolve(args.get("path").and_then(Value::as_str).unwrap_or("."))?;
        let regex = glob_to_regex(&pattern)?;

        let matched = tokio::task::spawn_blocking(move || -> Vec<String> {
            let mut out = Vec::new();
            for entry in walk(&path) {
                let relative = entry.strip_prefix(&path).unwrap_or(&entry).to_string_lossy().into_owned();
                if regex.is_match(&relative) {
                    out.push(entry.display().to_string());
                }
            }
            out.sort();
            out
        })
        .await
        .map_err(|e| Error::Other(format!("glob task panicked: {e}")))?;

        Ok(json!({ "matches": matched }).to_string())
    }

    /// Runs a command with no shell involved (§4.9 "shell-free tokenizer"),
    /// cooperatively cancellable: a cancellation signal kills the child
    /// rather than waiting for it to exit on its own.
    async fn exec(&self, args: &Value, cancel: &CancelToken) -> Result<String> {
        let command = str_arg(args, "command")?;
        let argv = sd_process::tokenize(command)?;
        let Some((program, rest)) = argv.split_first() else {
            return Err(Error::InvalidInput("empty command".into()));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest);
        cmd.current_dir(&self.root);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| Error::InvalidInput(format!("failed to spawn: {e}")))?;

        let wait = tokio::time::timeout(self.exec_timeout, child.wait_with_output());
        tokio::select! {
            result = wait => {
                let output = result
                    .map_err(|_| Error::Other("command timed out".into()))?
                    .map_err(Error::from)?;
                Ok(json!({
                    "exitCode": output.status.code(),
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": String::from_utf8_lossy(&output.stderr),
                })
                .to_string())
            }
            _ = cancel.cancelled() => {
                Err(Error::Cancelled)
            }
        }
    }
}

fn walk(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex_str = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            '.' | '(' | ')' | '+' | '|' | '^' | '$' | '[' | ']' | '{' | '}' | '\\' => {
                regex_str.push('\\');
                regex_str.push(ch);
            }
            other => regex_str.push(other),
        }
    }
    regex_str.push('$');
    Regex::new(&regex_str).map_err(|e| Error::InvalidInput(format!("invalid glob: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel_token() -> CancelToken {
        CancelToken::new()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let exec = DefaultToolExecutor::new(dir.path());
        let cancel = cancel_token();

        exec.run_tool("write_file", json!({ "path": "a.txt", "content": "hello" }), &cancel)
            .await
            .unwrap();
        let read = exec.run_tool("read_file", json!({ "path": "a.txt" }), &cancel).await.unwrap();
        assert_eq!(read, "hello");
    }

    #[tokio::test]
    async fn edit_file_replaces_first_match() {
        let dir = tempfile::tempdir().unwrap();
        let exec = DefaultToolExecutor::new(dir.path());
        let cancel = cancel_token();

        exec.run_tool("write_file", json!({ "path": "a.txt", "content": "foo bar foo" }), &cancel)
            .await
            .unwrap();
        exec.run_tool("edit_file", json!({ "path": "a.txt", "find": "foo", "replace": "baz" }), &cancel)
            .await
            .unwrap();
        let read = exec.run_tool("read_file", json!({ "path": "a.txt" }), &cancel).await.unwrap();
        assert_eq!(read, "baz bar foo");
    }

    #[tokio::test]
    async fn path_escaping_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exec = DefaultToolExecutor::new(dir.path());
        let cancel = cancel_token();

        let err = exec.run_tool("read_file", json!({ "path": "../../etc/passwd" }), &cancel).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn exec_runs_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let exec = DefaultToolExecutor::new(dir.path());
        let cancel = cancel_token();

        let result = exec.run_tool("exec", json!({ "command": "echo hello" }), &cancel).await.unwrap();
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn glob_matches_suffix_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let exec = DefaultToolExecutor::new(dir.path());
        let cancel = cancel_token();

        exec.run_tool("write_file", json!({ "path": "src/lib.rs", "content": "" }), &cancel).await.unwrap();
        exec.run_tool("write_file", json!({ "path": "README.md", "content": "" }), &cancel).await.unwrap();

        let result = exec.run_tool("glob", json!({ "pattern": "*.rs" }), &cancel).await.unwrap();
        let parsed: Value = serde_json::from_str(&result).unwrap();
        let matches = parsed["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].as_str().unwrap().ends_with("lib.rs"));
    }
}
