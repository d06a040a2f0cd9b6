//! Bounded cache of recent results, newest first

use gq_core::{ActionError, GenerationResult, MAX_RESULTS};

/// Clamp a requested history limit to `1..=MAX_RESULTS`
pub fn clamp_history_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_RESULTS)
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    results: Vec<GenerationResult>,
    history_limit: usize,
}

impl ResultCache {
    pub fn new(history_limit: usize) -> Self {
        Self {
            results: Vec::new(),
            history_limit: clamp_history_limit(history_limit),
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn list(&self) -> &[GenerationResult] {
        &self.results
    }

    pub fn get(&self, id: &str) -> Option<&GenerationResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// Replace the cache with a fetched list
    ///
    /// Sorted newest first; duplicate ids keep their first occurrence.
    pub fn set_results(&mut self, mut results: Vec<GenerationResult>) {
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut seen = std::collections::HashSet::new();
        results.retain(|r| seen.insert(r.id.clone()));
        results.truncate(self.history_limit);
        self.results = results;
    }

    /// Insert a fresh result at the front, replacing any older copy, and
    /// evict from the back
    pub fn add_result(&mut self, result: GenerationResult) {
        self.results.retain(|r| r.id != result.id);
        self.results.insert(0, result);
        self.results.truncate(self.history_limit);
    }

    /// Change the limit, evicting the oldest entries when shrinking
    pub fn set_history_limit(&mut self, limit: usize) -> usize {
        self.history_limit = clamp_history_limit(limit);
        self.results.truncate(self.history_limit);
        self.history_limit
    }

    pub fn remove_result(&mut self, id: &str) -> Option<GenerationResult> {
        let index = self.results.iter().position(|r| r.id == id)?;
        Some(self.results.remove(index))
    }

    /// Set the rating, returning the previous one
    pub fn set_rating(&mut self, id: &str, rating: Option<u8>) -> Result<Option<u8>, ActionError> {
        let result = self.get_mut(id)?;
        Ok(std::mem::replace(&mut result.rating, rating))
    }

    /// Set the favourite flag, returning the previous value
    pub fn set_favorite(&mut self, id: &str, favorite: bool) -> Result<bool, ActionError> {
        let result = self.get_mut(id)?;
        Ok(std::mem::replace(&mut result.is_favorite, favorite))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut GenerationResult, ActionError> {
        self.results
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ActionError::ResultNotFound(id.to_string()))
    }
}
