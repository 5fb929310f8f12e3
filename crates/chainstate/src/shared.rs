//! Multi-reader, single-writer access to the header graph.
//!
//! Readers clone an `Arc<HeaderGraph>` and never block writers for longer
//! than the pointer copy. Writers serialize on `writer`, mutate a private
//! copy (only cloned while old snapshots are still alive) and publish it.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::graph::{HeaderGraph, HeaderId, HeaderRecord, ReorgState};

#[derive(Default)]
pub struct SharedHeaderGraph {
    current: RwLock<Arc<HeaderGraph>>,
    writer: Mutex<()>,
}

impl SharedHeaderGraph {
    pub fn new(graph: HeaderGraph) -> Self {
        Self {
            current: RwLock::new(Arc::new(graph)),
            writer: Mutex::new(()),
        }
    }

    /// The latest published graph. Holding it pins that version.
    pub fn snapshot(&self) -> Arc<HeaderGraph> {
        // The guarded value is a single pointer; a poisoned lock still holds
        // a complete graph.
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<R>(&self, apply: impl FnOnce(&mut HeaderGraph) -> R) -> R {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut graph = self.snapshot();
        let result = apply(Arc::make_mut(&mut graph));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = graph;
        result
    }

    /// Adds headers and organizes in one published step.
    pub fn add_and_organize(&self, records: Vec<HeaderRecord>) -> (Vec<HeaderId>, ReorgState) {
        self.update(|graph| {
            let added = graph.add_headers(records);
            let state = graph.organize();
            (added, state)
        })
    }
}
