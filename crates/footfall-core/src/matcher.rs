//! New-vs-returning decision against the visitor store.

use crate::store::{StoreError, VisitorStore};
use crate::types::{Embedding, VisitorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default cosine similarity required to call a visitor returning.
///
/// Biased high: merging two people corrupts counts and histories in a way
/// that is hard to undo, while a missed return only inflates the count.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    New,
    Returning,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::New => f.write_str("new"),
            Outcome::Returning => f.write_str("returning"),
        }
    }
}

/// Result of identifying one embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub outcome: Outcome,
    pub visitor_id: VisitorId,
    /// Similarity to the matched visitor; `None` for a new enrollment.
    pub similarity: Option<f32>,
}

/// Most similar gallery entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    pub visitor_id: VisitorId,
    pub similarity: f32,
}

/// Linear cosine scan over the gallery.
///
/// Entries whose dimensionality differs from the query are skipped; they
/// were produced by a different model and are not comparable.
pub fn best_match(query: &Embedding, gallery: &[(VisitorId, Embedding)]) -> Option<BestMatch> {
    let mut best: Option<BestMatch> = None;

    for (visitor_id, reference) in gallery {
        if reference.dim() != query.dim() {
            tracing::warn!(
                visitor_id,
                expected = query.dim(),
                actual = reference.dim(),
                "skipping reference embedding with mismatched dimension"
            );
            continue;
        }
        let similarity = query.similarity(reference);
        if best.map_or(true, |b| similarity > b.similarity) {
            best = Some(BestMatch { visitor_id: *visitor_id, similarity });
        }
    }

    best
}

/// Applies the similarity threshold and writes the outcome to the store.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMatcher {
    threshold: f32,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl IdentityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// The match, if it clears the threshold (inclusive).
    pub fn accept(&self, best: Option<BestMatch>) -> Option<BestMatch> {
        best.filter(|b| b.similarity >= self.threshold)
    }

    /// Identify `embedding` against every visitor in `store`.
    ///
    /// Returning visitors get their count bumped and a visit carrying the
    /// similarity; anyone else is enrolled with this embedding as their
    /// permanent reference. Store failures are returned as-is and never
    /// turned into an enrollment.
    pub fn identify<V: VisitorStore + ?Sized>(
        &self,
        embedding: &Embedding,
        store: &mut V,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Identification, StoreError> {
        let gallery = store.scan_all()?;
        let best = best_match(embedding, &gallery);

        tracing::debug!(
            session_id,
            gallery = gallery.len(),
            best_similarity = best.map(|b| b.similarity),
            threshold = self.threshold,
            "matched against gallery"
        );

        match self.accept(best) {
            Some(m) => {
                store.update_on_match(m.visitor_id, session_id, m.similarity, now)?;
                tracing::info!(
                    session_id,
                    visitor_id = m.visitor_id,
                    similarity = m.similarity,
                    "returning visitor"
                );
                Ok(Identification {
                    outcome: Outcome::Returning,
                    visitor_id: m.visitor_id,
                    similarity: Some(m.similarity),
                })
            }
            None => {
                let visitor_id = store.insert(embedding, session_id, now)?;
                tracing::info!(session_id, visitor_id, "new visitor enrolled");
                Ok(Identification {
                    outcome: Outcome::New,
                    visitor_id,
                    similarity: None,
                })
            }
        }
    }
}
