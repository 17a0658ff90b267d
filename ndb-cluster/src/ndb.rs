// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum NdbError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine state error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Engine has been freed")]
    Freed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub doc_id: String,
    pub document: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: u64,
    pub doc_id: String,
    pub text: String,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

/// Metadata equality filter applied to candidate chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub value: String,
}

/// The single-node retrieval primitive. Implementations synchronize
/// internally; the methods take `&self` so that callers holding a shared
/// lock can still mutate (the engine behaves like an opaque handle).
pub trait Ndb: Send + Sync {
    fn insert(
        &self,
        document: &str,
        doc_id: &str,
        chunks: Vec<String>,
        metadata: Vec<HashMap<String, String>>,
    ) -> Result<(), NdbError>;

    fn delete(&self, doc_id: &str, keep_latest_version: bool) -> Result<(), NdbError>;

    /// Boosts the given chunk ids for the given queries.
    fn finetune(&self, queries: Vec<String>, labels: Vec<u64>) -> Result<(), NdbError>;

    fn associate(&self, source: &str, target: &str, strength: u32) -> Result<(), NdbError>;

    fn query(
        &self,
        query: &str,
        top_k: usize,
        constraints: &[Constraint],
    ) -> Result<Vec<QueryHit>, NdbError>;

    fn sources(&self) -> Result<Vec<Source>, NdbError>;

    /// Persists the full engine state into `dir`.
    fn save(&self, dir: &Path) -> Result<(), NdbError>;

    /// Releases the engine state; all later calls fail with [`NdbError::Freed`].
    fn free(&self);
}

const STATE_FILE: &str = "ndb.json";
const UPVOTE_BOOST: f32 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRecord {
    id: u64,
    doc_id: String,
    version: u32,
    text: String,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NdbState {
    next_chunk_id: u64,
    /// doc_id -> latest version number
    versions: BTreeMap<String, u32>,
    documents: BTreeMap<String, String>,
    chunks: BTreeMap<u64, ChunkRecord>,
    /// (normalized query, chunk id) -> accumulated boost
    boosts: BTreeMap<String, HashMap<u64, f32>>,
    /// source phrase -> target phrase -> strength
    associations: BTreeMap<String, BTreeMap<String, u32>>,
}

/// A deliberately simple term-match engine behind the [`Ndb`] seam: term
/// frequency scoring with finetune boosts and association-based query
/// expansion. The production retrieval engine plugs in behind the same trait.
pub struct LocalNdb {
    state: RwLock<Option<NdbState>>,
}

impl LocalNdb {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Some(NdbState::default())),
        }
    }

    /// Opens an engine from a save directory; an empty or missing directory
    /// yields an empty engine.
    pub fn open(dir: &Path) -> Result<Self, NdbError> {
        let state_path = dir.join(STATE_FILE);
        let state = if state_path.exists() {
            let bytes = std::fs::read(&state_path)?;
            serde_json::from_slice(&bytes)?
        } else {
            NdbState::default()
        };
        Ok(Self {
            state: RwLock::new(Some(state)),
        })
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(|token| token.to_string())
            .collect()
    }

    fn normalize(text: &str) -> String {
        Self::tokenize(text).join(" ")
    }
}

impl Default for LocalNdb {
    fn default() -> Self {
        Self::new()
    }
}

impl Ndb for LocalNdb {
    fn insert(
        &self,
        document: &str,
        doc_id: &str,
        chunks: Vec<String>,
        metadata: Vec<HashMap<String, String>>,
    ) -> Result<(), NdbError> {
        if doc_id.is_empty() {
            return Err(NdbError::InvalidArgument("doc_id must not be empty".into()));
        }
        if chunks.is_empty() {
            return Err(NdbError::InvalidArgument(
                "at least one chunk is required".into(),
            ));
        }
        if !metadata.is_empty() && metadata.len() != chunks.len() {
            return Err(NdbError::InvalidArgument(
                "metadata must be empty or match the number of chunks".into(),
            ));
        }

        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(NdbError::Freed)?;

        let version = state.versions.get(doc_id).copied().unwrap_or(0) + 1;
        state.versions.insert(doc_id.to_string(), version);
        state
            .documents
            .insert(doc_id.to_string(), document.to_string());

        for (position, text) in chunks.into_iter().enumerate() {
            let id = state.next_chunk_id;
            state.next_chunk_id += 1;
            state.chunks.insert(
                id,
                ChunkRecord {
                    id,
                    doc_id: doc_id.to_string(),
                    version,
                    text,
                    metadata: metadata.get(position).cloned().unwrap_or_default(),
                },
            );
        }
        Ok(())
    }

    fn delete(&self, doc_id: &str, keep_latest_version: bool) -> Result<(), NdbError> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(NdbError::Freed)?;

        let latest = state.versions.get(doc_id).copied().unwrap_or(0);
        state.chunks.retain(|_, chunk| {
            chunk.doc_id != doc_id || (keep_latest_version && chunk.version == latest)
        });
        if !keep_latest_version {
            state.versions.remove(doc_id);
            state.documents.remove(doc_id);
        }
        Ok(())
    }

    fn finetune(&self, queries: Vec<String>, labels: Vec<u64>) -> Result<(), NdbError> {
        if queries.len() != labels.len() {
            return Err(NdbError::InvalidArgument(
                "queries and labels must have the same length".into(),
            ));
        }
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(NdbError::Freed)?;

        for (query, label) in queries.into_iter().zip(labels) {
            let normalized = Self::normalize(&query);
            *state
                .boosts
                .entry(normalized)
                .or_default()
                .entry(label)
                .or_insert(0.0) += UPVOTE_BOOST;
        }
        Ok(())
    }

    fn associate(&self, source: &str, target: &str, strength: u32) -> Result<(), NdbError> {
        if source.is_empty() || target.is_empty() {
            return Err(NdbError::InvalidArgument(
                "source and target must not be empty".into(),
            ));
        }
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(NdbError::Freed)?;
        state
            .associations
            .entry(Self::normalize(source))
            .or_default()
            .insert(Self::normalize(target), strength);
        Ok(())
    }

    fn query(
        &self,
        query: &str,
        top_k: usize,
        constraints: &[Constraint],
    ) -> Result<Vec<QueryHit>, NdbError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(NdbError::Freed)?;

        let normalized = Self::normalize(query);
        let mut terms: Vec<(String, f32)> = Self::tokenize(query)
            .into_iter()
            .map(|token| (token, 1.0))
            .collect();

        // Association expansion: targets of any source contained in the query
        // join the term set at a strength-scaled weight.
        for (source, targets) in &state.associations {
            if normalized.contains(source.as_str()) {
                for (target, strength) in targets {
                    for token in Self::tokenize(target) {
                        terms.push((token, *strength as f32 / 4.0));
                    }
                }
            }
        }

        let boosts = state.boosts.get(&normalized);

        let mut hits: Vec<QueryHit> = state
            .chunks
            .values()
            .filter(|chunk| {
                constraints.iter().all(|constraint| {
                    chunk.metadata.get(&constraint.key) == Some(&constraint.value)
                })
            })
            .filter_map(|chunk| {
                let chunk_tokens = Self::tokenize(&chunk.text);
                let mut score = 0.0;
                for (term, weight) in &terms {
                    let count = chunk_tokens.iter().filter(|t| *t == term).count();
                    score += count as f32 * weight;
                }
                if let Some(boost) = boosts.and_then(|map| map.get(&chunk.id)) {
                    score += boost;
                }
                if score > 0.0 {
                    Some(QueryHit {
                        id: chunk.id,
                        doc_id: chunk.doc_id.clone(),
                        text: chunk.text.clone(),
                        score,
                        metadata: chunk.metadata.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn sources(&self) -> Result<Vec<Source>, NdbError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(NdbError::Freed)?;
        Ok(state
            .versions
            .iter()
            .map(|(doc_id, version)| Source {
                doc_id: doc_id.clone(),
                document: state.documents.get(doc_id).cloned().unwrap_or_default(),
                version: *version,
            })
            .collect())
    }

    fn save(&self, dir: &Path) -> Result<(), NdbError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(NdbError::Freed)?;
        std::fs::create_dir_all(dir)?;
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, dir.join(STATE_FILE))?;
        Ok(())
    }

    fn free(&self) {
        *self.state.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn engine_with_docs() -> LocalNdb {
        let ndb = LocalNdb::new();
        ndb.insert(
            "doc-a",
            "a",
            vec![
                "the quick brown fox".to_string(),
                "jumps over the lazy dog".to_string(),
            ],
            vec![],
        )
        .unwrap();
        ndb.insert("doc-b", "b", vec!["slow green turtle".to_string()], vec![])
            .unwrap();
        ndb
    }

    #[test]
    fn query_ranks_by_term_overlap() {
        let ndb = engine_with_docs();
        let hits = ndb.query("quick brown fox", 10, &[]).unwrap();
        assert_eq!(hits[0].doc_id, "a");
        assert_eq!(hits[0].text, "the quick brown fox");
    }

    #[test]
    fn finetune_boosts_labelled_chunk() {
        let ndb = engine_with_docs();
        let baseline = ndb.query("the", 10, &[]).unwrap();
        let lazy_chunk = baseline
            .iter()
            .find(|hit| hit.text.contains("lazy"))
            .unwrap()
            .id;

        ndb.finetune(vec!["the".to_string()], vec![lazy_chunk])
            .unwrap();
        let boosted = ndb.query("the", 10, &[]).unwrap();
        assert_eq!(boosted[0].id, lazy_chunk);
    }

    #[test]
    fn associate_expands_queries() {
        let ndb = engine_with_docs();
        assert!(ndb.query("tortoise", 10, &[]).unwrap().is_empty());

        ndb.associate("tortoise", "turtle", 4).unwrap();
        let hits = ndb.query("tortoise", 10, &[]).unwrap();
        assert_eq!(hits[0].doc_id, "b");
    }

    #[test]
    fn delete_keep_latest_drops_old_versions() {
        let ndb = LocalNdb::new();
        ndb.insert("doc", "a", vec!["old text".to_string()], vec![])
            .unwrap();
        ndb.insert("doc", "a", vec!["new text".to_string()], vec![])
            .unwrap();

        ndb.delete("a", true).unwrap();
        let hits = ndb.query("text", 10, &[]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "new text");

        ndb.delete("a", false).unwrap();
        assert!(ndb.sources().unwrap().is_empty());
    }

    #[test]
    fn save_and_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ndb = engine_with_docs();
        ndb.save(dir.path()).unwrap();

        let reopened = LocalNdb::open(dir.path()).unwrap();
        assert_eq!(reopened.sources().unwrap(), ndb.sources().unwrap());
        assert_eq!(
            reopened.query("fox", 5, &[]).unwrap(),
            ndb.query("fox", 5, &[]).unwrap()
        );
    }

    #[test]
    fn freed_engine_rejects_calls() {
        let ndb = engine_with_docs();
        ndb.free();
        assert!(matches!(ndb.sources(), Err(NdbError::Freed)));
    }

    #[test]
    fn constraints_filter_hits() {
        let ndb = LocalNdb::new();
        let mut meta = HashMap::new();
        meta.insert("lang".to_string(), "en".to_string());
        ndb.insert("doc", "a", vec!["hello world".to_string()], vec![meta])
            .unwrap();

        let constraint = Constraint {
            key: "lang".to_string(),
            value: "de".to_string(),
        };
        assert!(ndb.query("hello", 10, &[constraint]).unwrap().is_empty());

        let constraint = Constraint {
            key: "lang".to_string(),
            value: "en".to_string(),
        };
        assert_eq!(ndb.query("hello", 10, &[constraint]).unwrap().len(), 1);
    }
}
