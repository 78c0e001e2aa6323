//! Visitor store interface.
//!
//! The matcher reads every reference embedding and then performs exactly
//! one write: either an enrollment (new visitor plus its first visit) or
//! a match (visit count increment plus a visit). Implementations must make
//! each write atomic.

use crate::types::{Embedding, Visit, Visitor, VisitorId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("visitor store unreachable: {0}")]
    Unreachable(String),
    #[error("visitor {0} not found")]
    VisitorNotFound(VisitorId),
    #[error("corrupt store record: {0}")]
    Corrupt(String),
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Connectivity failures, as opposed to data or logic errors.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

pub trait VisitorStore {
    /// All visitors' reference embeddings.
    fn scan_all(&mut self) -> Result<Vec<(VisitorId, Embedding)>, StoreError>;

    /// Enroll a new visitor with `visit_count = 1` and record its first
    /// visit (null similarity).
    fn insert(
        &mut self,
        embedding: &Embedding,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<VisitorId, StoreError>;

    /// Increment `visit_count`, set `last_seen` and record a visit with
    /// the measured similarity.
    fn update_on_match(
        &mut self,
        visitor_id: VisitorId,
        session_id: &str,
        similarity: f32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

impl<T: VisitorStore + ?Sized> VisitorStore for Box<T> {
    fn scan_all(&mut self) -> Result<Vec<(VisitorId, Embedding)>, StoreError> {
        (**self).scan_all()
    }

    fn insert(&mut self, embedding: &Embedding, session_id: &str, at: DateTime<Utc>) -> Result<VisitorId, StoreError> {
        (**self).insert(embedding, session_id, at)
    }

    fn update_on_match(
        &mut self,
        visitor_id: VisitorId,
        session_id: &str,
        similarity: f32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).update_on_match(visitor_id, session_id, similarity, at)
    }
}

/// Volatile store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    visitors: Vec<Visitor>,
    visits: Vec<Visit>,
    next_id: VisitorId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing visitor directly, without recording a visit.
    pub fn seed(&mut self, embedding: Embedding, visit_count: u32, seen: DateTime<Utc>) -> VisitorId {
        self.next_id += 1;
        self.visitors.push(Visitor {
            id: self.next_id,
            embedding,
            visit_count,
            first_seen: seen,
            last_seen: seen,
            sample_image: None,
        });
        self.next_id
    }

    pub fn visitors(&self) -> &[Visitor] {
        &self.visitors
    }

    pub fn visits(&self) -> &[Visit] {
        &self.visits
    }

    pub fn visitor(&self, id: VisitorId) -> Option<&Visitor> {
        self.visitors.iter().find(|v| v.id == id)
    }
}

impl VisitorStore for MemoryStore {
    fn scan_all(&mut self) -> Result<Vec<(VisitorId, Embedding)>, StoreError> {
        Ok(self.visitors.iter().map(|v| (v.id, v.embedding.clone())).collect())
    }

    fn insert(&mut self, embedding: &Embedding, session_id: &str, at: DateTime<Utc>) -> Result<VisitorId, StoreError> {
        let id = self.seed(embedding.clone(), 1, at);
        self.visits.push(Visit {
            visitor_id: id,
            timestamp: at,
            session_id: session_id.to_string(),
            similarity: None,
        });
        Ok(id)
    }

    fn update_on_match(
        &mut self,
        visitor_id: VisitorId,
        session_id: &str,
        similarity: f32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let visitor = self
            .visitors
            .iter_mut()
            .find(|v| v.id == visitor_id)
            .ok_or(StoreError::VisitorNotFound(visitor_id))?;
        visitor.visit_count += 1;
        visitor.last_seen = at;
        self.visits.push(Visit {
            visitor_id,
            timestamp: at,
            session_id: session_id.to_string(),
            similarity: Some(similarity),
        });
        Ok(())
    }
}
