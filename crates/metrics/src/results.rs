//! Reporting copies of race results.

use crate::{error::StoreResult, race::Race};

/// Stores the flattened results of a race for reporting.
pub trait ResultsStore {
    /// Writes one document per metric of the race's results.
    ///
    /// # Errors
    ///
    /// Returns an error if the documents cannot be written.
    fn store_results(&self, race: &Race) -> StoreResult<()>;
}

/// Results store for local runs; results stay part of the race file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResultsStore;

impl ResultsStore for NoopResultsStore {
    fn store_results(&self, race: &Race) -> StoreResult<()> {
        tracing::debug!(race_id = %race.race_id, "not storing results separately");
        Ok(())
    }
}
