//! Conversation history (C4) — append-only turn log with LLM-assisted
//! summaries and per-query relevance selection.
//!
//! Unlike [`crate::transcript`]'s per-line JSONL append, each turn here
//! carries a generated summary and the whole log is persisted as one JSON
//! file (`Message{id,query,answer,summary}`) via [`write_json_atomic`], with
//! an in-memory relevance cache so planning/answering only ever see the
//! turns that matter for the current query.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sa_domain::error::Result;
use sa_domain::persistence::write_json_atomic;
use sa_domain::tool::Message as DomainMessage;
use sa_providers::{ChatRequest, LlmProvider};
use std::sync::Arc;

const SUMMARY_FALLBACK_QUERY_CHARS: usize = 100;

/// One turn of conversation: the user's query, the agent's final answer,
/// and a short summary of the answer used for lightweight planning context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: usize,
    pub query: String,
    pub answer: String,
    pub summary: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct SelectedMessages {
    message_ids: Vec<usize>,
}

fn query_fingerprint(query: &str) -> String {
    let digest = md5::compute(query.as_bytes());
    format!("{digest:x}")[..12].to_string()
}

/// Append-only conversation history for one session, persisted as a single
/// JSON file. Relevance selections are cached per query fingerprint until
/// the next `add_message` invalidates the cache.
pub struct ConversationHistory {
    path: PathBuf,
    messages: RwLock<Vec<Message>>,
    relevance_cache: RwLock<HashMap<String, Vec<usize>>>,
}

impl ConversationHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            messages: RwLock::new(Vec::new()),
            relevance_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load a history file if present; starts empty when missing or corrupt.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let messages = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<HistoryFile>(&raw)
                .map(|f| f.messages)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            messages: RwLock::new(messages),
            relevance_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    pub fn all(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    /// Truncate history back to empty. Does not remove the backing file.
    pub fn clear(&self) {
        self.messages.write().clear();
        self.relevance_cache.write().clear();
    }

    /// Summarize, append, and flush a completed turn.
    pub async fn add_message(
        &self,
        summarizer: Option<&Arc<dyn LlmProvider>>,
        query: &str,
        answer: &str,
    ) -> Result<Message> {
        self.relevance_cache.write().clear();

        let summary = self
            .summarize(summarizer, query, answer)
            .await
            .unwrap_or_else(|| {
                let truncated: String = query.chars().take(SUMMARY_FALLBACK_QUERY_CHARS).collect();
                format!("Answer to: {truncated}")
            });

        let id = {
            let mut messages = self.messages.write();
            let id = messages.len();
            messages.push(Message {
                id,
                query: query.to_string(),
                answer: answer.to_string(),
                summary: summary.clone(),
            });
            id
        };

        self.flush()?;
        Ok(Message {
            id,
            query: query.to_string(),
            answer: answer.to_string(),
            summary,
        })
    }

    fn flush(&self) -> Result<()> {
        let file = HistoryFile {
            messages: self.messages.read().clone(),
        };
        write_json_atomic(&self.path, &file)
    }

    async fn summarize(
        &self,
        summarizer: Option<&Arc<dyn LlmProvider>>,
        query: &str,
        answer: &str,
    ) -> Option<String> {
        let provider = summarizer?;
        let prompt = format!(
            "Summarize this assistant answer in one sentence.\nQuery: {query}\nAnswer: {answer}"
        );
        let req = ChatRequest {
            messages: vec![DomainMessage::user(prompt)],
            ..Default::default()
        };
        match provider.chat(req).await {
            Ok(resp) if !resp.content.trim().is_empty() => Some(resp.content.trim().to_string()),
            _ => None,
        }
    }

    /// Ask the LLM which prior turns are relevant to `current_query`.
    /// Fail-closed: any selector error or absence returns no turns, since
    /// injecting irrelevant history is worse than injecting none.
    pub async fn select_relevant_messages(
        &self,
        selector: Option<&Arc<dyn LlmProvider>>,
        current_query: &str,
    ) -> Vec<Message> {
        let messages = self.messages.read().clone();
        if messages.is_empty() {
            return Vec::new();
        }

        let fp = query_fingerprint(current_query);
        if let Some(ids) = self.relevance_cache.read().get(&fp) {
            return ids
                .iter()
                .filter_map(|id| messages.iter().find(|m| m.id == *id).cloned())
                .collect();
        }

        let Some(provider) = selector else {
            self.relevance_cache.write().insert(fp, Vec::new());
            return Vec::new();
        };

        let listing: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({"id": m.id, "query": m.query, "summary": m.summary}))
            .collect();
        let prompt = format!(
            "Given the current query and prior conversation turns, return the ids \
             of turns relevant to answering it, as JSON: {{\"message_ids\": [..]}}.\n\
             Current query: {current_query}\nTurns: {}",
            serde_json::Value::Array(listing)
        );
        let req = ChatRequest {
            messages: vec![DomainMessage::user(prompt)],
            json_mode: true,
            ..Default::default()
        };

        let selected = match provider.chat(req).await {
            Ok(resp) => serde_json::from_str::<SelectedMessages>(&resp.content).ok(),
            Err(_) => None,
        };

        let ids: Vec<usize> = match selected {
            Some(sel) => sel
                .message_ids
                .into_iter()
                .filter(|id| *id < messages.len())
                .collect(),
            None => {
                self.relevance_cache.write().insert(fp, Vec::new());
                return Vec::new();
            }
        };

        self.relevance_cache.write().insert(fp, ids.clone());
        ids.into_iter()
            .filter_map(|id| messages.iter().find(|m| m.id == id).cloned())
            .collect()
    }

    /// Lightweight context for planning: query + summary pairs only.
    pub fn format_for_planning(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| format!("User: {}\nAssistant: {}", m.query, m.summary))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Full context for answer generation: query + complete answer.
    pub fn format_for_answer_generation(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| format!("User: {}\nAssistant: {}", m.query, m.answer))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn add_message_without_summarizer_uses_fallback() {
        let dir = tempdir().unwrap();
        let history = ConversationHistory::new(dir.path().join("history.json"));
        let msg = history
            .add_message(None, "what is the weather", "it is sunny")
            .await
            .unwrap();
        assert_eq!(msg.id, 0);
        assert_eq!(msg.summary, "Answer to: what is the weather");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn add_message_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let history = ConversationHistory::new(&path);
        history.add_message(None, "q1", "a1").await.unwrap();
        history.add_message(None, "q2", "a2").await.unwrap();

        let reloaded = ConversationHistory::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.all()[1].query, "q2");
    }

    #[tokio::test]
    async fn select_relevant_messages_fails_closed_without_selector() {
        let dir = tempdir().unwrap();
        let history = ConversationHistory::new(dir.path().join("history.json"));
        history.add_message(None, "q1", "a1").await.unwrap();

        let relevant = history.select_relevant_messages(None, "q1").await;
        assert!(relevant.is_empty());
    }

    #[tokio::test]
    async fn adding_a_message_invalidates_relevance_cache() {
        let dir = tempdir().unwrap();
        let history = ConversationHistory::new(dir.path().join("history.json"));
        history.add_message(None, "q1", "a1").await.unwrap();
        let _ = history.select_relevant_messages(None, "q1").await;
        assert!(!history.relevance_cache.read().is_empty());

        history.add_message(None, "q2", "a2").await.unwrap();
        assert!(history.relevance_cache.read().is_empty());
    }

    #[test]
    fn format_helpers_render_expected_blocks() {
        let messages = vec![Message {
            id: 0,
            query: "q".to_string(),
            answer: "a".to_string(),
            summary: "s".to_string(),
        }];
        assert_eq!(
            ConversationHistory::format_for_planning(&messages),
            "User: q\nAssistant: s"
        );
        assert_eq!(
            ConversationHistory::format_for_answer_generation(&messages),
            "User: q\nAssistant: a"
        );
    }

    #[test]
    fn clear_empties_history() {
        let dir = tempdir().unwrap();
        let history = ConversationHistory::new(dir.path().join("history.json"));
        history.messages.write().push(Message {
            id: 0,
            query: "q".into(),
            answer: "a".into(),
            summary: "s".into(),
        });
        assert_eq!(history.len(), 1);
        history.clear();
        assert!(history.is_empty());
    }
}
