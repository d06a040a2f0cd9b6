//! Optimistic mutations
//!
//! Starting a generation, rating and favouriting change local state before
//! the backend confirms. Each such change is recorded as a [`Tentative`];
//! on failure it is rolled back, on success it is simply dropped.

use crate::queue::JobQueue;
use crate::results::ResultCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tentative {
    /// Optimistic job awaiting the start acknowledgement
    Job { local_id: String },
    Rating { result_id: String, previous: Option<u8> },
    Favorite { result_id: String, previous: bool },
}

impl Tentative {
    /// Undo the local change
    pub fn rollback(self, queue: &mut JobQueue, results: &mut ResultCache) {
        match self {
            Tentative::Job { local_id } => {
                queue.remove_job(&local_id);
            }
            Tentative::Rating {
                result_id,
                previous,
            } => {
                // The result may have been deleted meanwhile
                let _ = results.set_rating(&result_id, previous);
            }
            Tentative::Favorite {
                result_id,
                previous,
            } => {
                let _ = results.set_favorite(&result_id, previous);
            }
        }
    }
}
