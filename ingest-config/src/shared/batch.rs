use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings steering automatic write strategy selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Jobs with at least this many rows are streamed through `COPY`; smaller jobs are
    /// written with multi-row `INSERT` statements.
    #[serde(default = "default_streaming_threshold_rows")]
    pub streaming_threshold_rows: usize,
}

impl BatchConfig {
    pub const DEFAULT_STREAMING_THRESHOLD_ROWS: usize = 1_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.streaming_threshold_rows == 0 {
            return Err(ValidationError::invalid(
                "batch.streaming_threshold_rows",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            streaming_threshold_rows: default_streaming_threshold_rows(),
        }
    }
}

fn default_streaming_threshold_rows() -> usize {
    BatchConfig::DEFAULT_STREAMING_THRESHOLD_ROWS
}
