use crate::embed::Embedding;
use crate::roster::CharacterRecord;
use std::collections::HashMap;
use std::sync::RwLock;

/// Characters are re-keyed when their portrait changes
type CacheKey = (u64, String);

/// In-memory candidate embeddings, shared by every run of one matcher.
///
/// Only successful extractions are stored. Lock poisoning degrades to a miss.
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<CacheKey, Embedding>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(character: &CharacterRecord) -> CacheKey {
        (character.id, character.portrait_path.clone().unwrap_or_default())
    }

    pub fn get(&self, character: &CharacterRecord) -> Option<Embedding> {
        let entries = self.entries.read().ok()?;
        entries.get(&Self::key(character)).cloned()
    }

    pub fn insert(&self, character: &CharacterRecord, embedding: Embedding) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(Self::key(character), embedding);
            }
            Err(_) => log::warn!("Embedding cache lock poisoned, not caching {}", character.name),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
