use crate::stream_def::{RetrievalId, StreamId};
use rustc_hash::FxHashMap;

/// Deduplicates stream definitions by their [`RetrievalId`].
#[derive(Debug, Default)]
pub struct NodeSharingManager {
    streams: FxHashMap<RetrievalId, StreamId>,
    hits: usize,
}

impl NodeSharingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an equivalent stream, counting the hit.
    pub fn get_stream(&mut self, retrieval_id: &RetrievalId) -> Option<StreamId> {
        let found = self.streams.get(retrieval_id).copied();
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    pub fn register_stream(&mut self, retrieval_id: RetrievalId, stream: StreamId) -> Result<(), String> {
        if self.streams.contains_key(&retrieval_id) {
            Err(format!("stream already registered for {:?}", retrieval_id))
        } else {
            self.streams.insert(retrieval_id, stream);
            Ok(())
        }
    }

    /// Number of definitions that resolved to an existing stream.
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::TypeId;

    #[test]
    fn test_register_then_share() {
        let mut sharer = NodeSharingManager::new();
        let id = RetrievalId::From(TypeId::of::<i64>());
        assert_eq!(sharer.get_stream(&id), None);
        sharer.register_stream(id.clone(), StreamId(0)).unwrap();
        assert_eq!(sharer.get_stream(&id), Some(StreamId(0)));
        assert_eq!(sharer.hits(), 1);
        assert!(sharer.register_stream(id, StreamId(1)).is_err());
        assert_eq!(sharer.len(), 1);
    }
}
