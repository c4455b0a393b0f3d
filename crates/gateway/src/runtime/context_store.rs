//! Tool context store — content-addressed persistence of tool outputs.
//!
//! Every successful tool invocation in a turn is written here as a
//! [`ToolArtifact`], keyed by a [`fingerprint`] of `(tool_name, args)`.  At
//! answer time, `select_relevant` asks the LLM which of the accumulated
//! artifacts are worth re-reading for the final prompt, fail-open to "all of
//! them" so a model hiccup never silently drops context.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sa_domain::error::Result;
use sa_domain::persistence::write_json_atomic;
use sa_domain::tool::Message;
use sa_providers::{ChatRequest, LlmProvider};

const SUMMARY_PREVIEW_CHARS: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fingerprint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Canonicalize a JSON value by sorting object keys lexicographically at
/// every nesting level. Array order and scalars are left untouched.
fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonical_json(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// `md5(tool_name || canonical_json(args))[:12]`, hex-encoded. Key order in
/// `args` never affects the result.
pub fn fingerprint(tool_name: &str, args: &Value) -> String {
    let canonical = canonical_json(args);
    let mut buf = String::with_capacity(tool_name.len() + 64);
    buf.push_str(tool_name);
    buf.push_str(&canonical.to_string());
    let digest = md5::compute(buf.as_bytes());
    format!("{digest:x}")[..12].to_string()
}

/// `<TICKER>_<toolName>_<fp>.json` when `args.ticker` is a string, else
/// `<toolName>_<fp>.json`.
pub fn artifact_filename(tool_name: &str, args: &Value, fp: &str) -> String {
    match args.get("ticker").and_then(Value::as_str) {
        Some(ticker) => format!("{ticker}_{tool_name}_{fp}.json"),
        None => format!("{tool_name}_{fp}.json"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact + pointer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolArtifact {
    pub tool_name: String,
    pub args: Value,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    pub result: Value,
}

/// In-memory index entry for an artifact, used for relevance selection
/// without re-reading every file from disk.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPointer {
    pub filepath: PathBuf,
    pub filename: String,
    pub tool_name: String,
    pub args: Value,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContextData {
    pub filepath: PathBuf,
    pub artifact: ToolArtifact,
}

#[derive(Deserialize)]
struct SelectedContexts {
    context_ids: Vec<usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolContextStore {
    dir: PathBuf,
    pointers: RwLock<Vec<ContextPointer>>,
}

impl ToolContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pointers: RwLock::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a tool result and append its pointer to the in-memory index.
    /// On concurrent saves with an equal fingerprint, the second writer
    /// overwrites — the atomic tmp-file rename guarantees readers never
    /// observe a partially written file.
    pub async fn save(
        &self,
        summarizer: Option<&Arc<dyn LlmProvider>>,
        tool_name: &str,
        args: &Value,
        result: &Value,
        task_id: Option<String>,
        query_id: Option<String>,
    ) -> Result<ContextPointer> {
        let fp = fingerprint(tool_name, args);
        let filename = artifact_filename(tool_name, args, &fp);
        let filepath = self.dir.join(&filename);

        let summary = self
            .summarize(summarizer, tool_name, args, result)
            .await
            .unwrap_or_else(|| format!("{tool_name} output with args {args}"));

        let artifact = ToolArtifact {
            tool_name: tool_name.to_string(),
            args: args.clone(),
            summary: summary.clone(),
            timestamp: Utc::now(),
            task_id: task_id.clone(),
            query_id: query_id.clone(),
            result: result.clone(),
        };

        write_json_atomic(&filepath, &artifact)?;

        let pointer = ContextPointer {
            filepath,
            filename,
            tool_name: tool_name.to_string(),
            args: args.clone(),
            summary,
            task_id,
            query_id,
        };
        self.pointers.write().push(pointer.clone());
        Ok(pointer)
    }

    async fn summarize(
        &self,
        summarizer: Option<&Arc<dyn LlmProvider>>,
        tool_name: &str,
        args: &Value,
        result: &Value,
    ) -> Option<String> {
        let provider = summarizer?;
        let rendered = match result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let preview: String = rendered.chars().take(SUMMARY_PREVIEW_CHARS).collect();
        let prompt = format!(
            "Summarize this tool output in one sentence (at most two).\n\
             Tool: {tool_name}\nArgs: {args}\nOutput:\n{preview}"
        );
        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            ..Default::default()
        };
        match provider.chat(req).await {
            Ok(resp) if !resp.content.trim().is_empty() => Some(resp.content.trim().to_string()),
            _ => None,
        }
    }

    /// Ask the LLM which pointers are relevant to `query`. Fail-open: on
    /// any error, return every known filepath rather than silently
    /// dropping context the caller might need.
    pub async fn select_relevant(
        &self,
        selector: Option<&Arc<dyn LlmProvider>>,
        query: &str,
    ) -> Vec<PathBuf> {
        let pointers = self.pointers.read().clone();
        if pointers.is_empty() {
            return Vec::new();
        }
        let all: Vec<PathBuf> = pointers.iter().map(|p| p.filepath.clone()).collect();

        let Some(provider) = selector else {
            return all;
        };

        let listing: Vec<Value> = pointers
            .iter()
            .enumerate()
            .map(|(id, p)| {
                serde_json::json!({
                    "id": id,
                    "tool_name": p.tool_name,
                    "args": p.args,
                    "summary": p.summary,
                })
            })
            .collect();

        let prompt = format!(
            "Given this query and the available tool-output contexts, return the \
             ids of contexts relevant to answering it, as JSON: {{\"context_ids\": [..]}}.\n\
             Query: {query}\nContexts: {}",
            Value::Array(listing)
        );
        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            json_mode: true,
            ..Default::default()
        };

        let selected = match provider.chat(req).await {
            Ok(resp) => serde_json::from_str::<SelectedContexts>(&resp.content).ok(),
            Err(_) => None,
        };

        match selected {
            Some(sel) => sel
                .context_ids
                .into_iter()
                .filter(|id| *id < pointers.len())
                .map(|id| pointers[id].filepath.clone())
                .collect(),
            None => all,
        }
    }

    /// Best-effort read of a set of artifact files. Malformed entries are
    /// logged and skipped rather than failing the whole batch.
    pub fn load_contexts(&self, filepaths: &[PathBuf]) -> Vec<ContextData> {
        let mut out = Vec::with_capacity(filepaths.len());
        for path in filepaths {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<ToolArtifact>(&raw) {
                    Ok(artifact) => out.push(ContextData {
                        filepath: path.clone(),
                        artifact,
                    }),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed tool artifact");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable tool artifact");
                }
            }
        }
        out
    }

    pub fn pointer_count(&self) -> usize {
        self.pointers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(fingerprint("quote", &a), fingerprint("quote", &b));
    }

    #[test]
    fn fingerprint_differs_by_tool_name() {
        let args = json!({"a": 1});
        assert_ne!(fingerprint("quote", &args), fingerprint("news", &args));
    }

    #[test]
    fn fingerprint_is_twelve_hex_chars() {
        let fp = fingerprint("quote", &json!({}));
        assert_eq!(fp.len(), 12);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn filename_uses_ticker_prefix_when_present() {
        let fp = "abcdef012345";
        let named = artifact_filename("quote", &json!({"ticker": "AAPL"}), fp);
        assert_eq!(named, format!("AAPL_quote_{fp}.json"));
        let unnamed = artifact_filename("quote", &json!({}), fp);
        assert_eq!(unnamed, format!("quote_{fp}.json"));
    }

    #[tokio::test]
    async fn save_without_summarizer_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolContextStore::new(dir.path());
        let pointer = store
            .save(
                None,
                "quote",
                &json!({"ticker": "AAPL"}),
                &json!("price: 123"),
                None,
                Some("q1".into()),
            )
            .await
            .unwrap();
        assert!(pointer.summary.contains("quote"));
        assert!(pointer.filepath.exists());
        assert_eq!(store.pointer_count(), 1);
    }

    #[tokio::test]
    async fn select_relevant_fails_open_without_selector() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolContextStore::new(dir.path());
        store
            .save(None, "quote", &json!({}), &json!("x"), None, None)
            .await
            .unwrap();
        store
            .save(None, "news", &json!({}), &json!("y"), None, None)
            .await
            .unwrap();
        let selected = store.select_relevant(None, "anything").await;
        assert_eq!(selected.len(), 2);
    }

    #[tokio::test]
    async fn load_contexts_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolContextStore::new(dir.path());
        let pointer = store
            .save(None, "quote", &json!({}), &json!("ok"), None, None)
            .await
            .unwrap();
        let bad_path = dir.path().join("bad.json");
        std::fs::write(&bad_path, b"not json").unwrap();

        let loaded = store.load_contexts(&[pointer.filepath.clone(), bad_path]);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].artifact.tool_name, "quote");
    }
}
