//! Knowledge base and embedded-document retrieval
//!
//! Each agent carries a free-text knowledge base and a map of embedded
//! documents. A simulation-wide global knowledge snapshot can be shared
//! across agents; the snapshot itself is immutable and replaced wholesale on
//! hot-patch, so clones share it structurally.

use crate::memory::ShortTermMemory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

/// One embedded document: chunk texts plus per-chunk embedding vectors keyed
/// by chunk id. Stored in this portable form so snapshots carry their own
/// vectors; an external vector index is an optional accelerator, not the
/// source of truth.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentChunks {
    #[serde(default)]
    pub chunks: Vec<String>,
    #[serde(default)]
    pub embeddings: HashMap<String, Vec<f32>>,
}

pub type DocumentMap = HashMap<String, DocumentChunks>;
pub type GlobalKnowledge = HashMap<String, KnowledgeItem>;

/// A retrieved chunk or knowledge entry with its score.
#[derive(Clone, Debug, PartialEq)]
pub struct Retrieved {
    pub source: String,
    pub text: String,
    pub score: f32,
}

pub fn enabled_knowledge(items: &[KnowledgeItem]) -> Vec<&KnowledgeItem> {
    items.iter().filter(|item| item.enabled).collect()
}

/// Keyword retrieval over the knowledge base: rank by query-term overlap.
pub fn query_knowledge<'a>(
    items: &'a [KnowledgeItem],
    query: &str,
    max_results: usize,
) -> Vec<&'a KnowledgeItem> {
    let terms = terms_of(query);
    if terms.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(usize, &KnowledgeItem)> = enabled_knowledge(items)
        .into_iter()
        .map(|item| {
            let haystack = format!("{} {}", item.title, item.content).to_lowercase();
            let score = terms.iter().filter(|t| haystack.contains(*t)).count();
            (score, item)
        })
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(max_results).map(|(_, i)| i).collect()
}

/// Cosine retrieval over the agent's private documents given a pre-computed
/// query embedding.
pub fn retrieve_from_documents(
    documents: &DocumentMap,
    query_embedding: &[f32],
    top_k: usize,
) -> Vec<Retrieved> {
    let mut hits = Vec::new();
    for (doc_id, doc) in documents {
        for (chunk_id, embedding) in &doc.embeddings {
            let Some(chunk_idx) = chunk_id.parse::<usize>().ok() else {
                continue;
            };
            let Some(text) = doc.chunks.get(chunk_idx) else {
                continue;
            };
            let score = cosine(query_embedding, embedding);
            if score > 0.0 {
                hits.push(Retrieved {
                    source: format!("{doc_id}#{chunk_id}"),
                    text: text.clone(),
                    score,
                });
            }
        }
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    hits
}

/// Composite retrieval for auto-RAG: keyword scoring over the private
/// knowledge base, the global knowledge snapshot, and document chunk text.
pub fn composite_retrieve(
    knowledge_base: &[KnowledgeItem],
    documents: &DocumentMap,
    global: Option<&Arc<GlobalKnowledge>>,
    query: &str,
    top_k: usize,
) -> Vec<Retrieved> {
    let terms = terms_of(query);
    if terms.is_empty() {
        return Vec::new();
    }
    let score_text = |text: &str| -> f32 {
        let lower = text.to_lowercase();
        terms.iter().filter(|t| lower.contains(*t)).count() as f32 / terms.len() as f32
    };

    let mut hits = Vec::new();
    for item in enabled_knowledge(knowledge_base) {
        let text = format!("{}: {}", item.title, item.content);
        let score = score_text(&text);
        if score > 0.0 {
            hits.push(Retrieved {
                source: format!("kb:{}", item.id),
                text,
                score,
            });
        }
    }
    if let Some(global) = global {
        for (id, item) in global.iter() {
            if !item.enabled {
                continue;
            }
            let text = format!("{}: {}", item.title, item.content);
            let score = score_text(&text);
            if score > 0.0 {
                hits.push(Retrieved {
                    source: format!("global:{id}"),
                    text,
                    score,
                });
            }
        }
    }
    for (doc_id, doc) in documents {
        for (idx, chunk) in doc.chunks.iter().enumerate() {
            let score = score_text(chunk);
            if score > 0.0 {
                hits.push(Retrieved {
                    source: format!("{doc_id}#{idx}"),
                    text: chunk.clone(),
                    score,
                });
            }
        }
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    hits
}

/// Context block injected into the system prompt when auto-RAG is on. The
/// query is derived from the most recent memory entries.
pub fn auto_rag_context(
    knowledge_base: &[KnowledgeItem],
    documents: &DocumentMap,
    global: Option<&Arc<GlobalKnowledge>>,
    memory: &ShortTermMemory,
    top_k: usize,
) -> Option<String> {
    let query: String = memory
        .tail(4)
        .iter()
        .map(|e| e.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let hits = composite_retrieve(knowledge_base, documents, global, &query, top_k);
    if hits.is_empty() {
        return None;
    }
    let mut block = String::from("Retrieved Context:\n");
    for hit in &hits {
        block.push_str(&format!("- ({}) {}\n", hit.source, hit.text));
    }
    Some(block)
}

fn terms_of(query: &str) -> BTreeSet<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
