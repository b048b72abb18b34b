use moka::sync::Cache;
use parking_lot::Mutex;
use polars::prelude::DataFrame;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::services::db_connector::DbConnection;
use crate::services::loader;
use crate::services::processor::{Bins, DataProcessor};

fn default_missing_method() -> String {
    "drop".to_string()
}

fn default_outlier_method() -> String {
    "iqr".to_string()
}

fn default_scaling_method() -> String {
    "standard".to_string()
}

fn default_encoding_method() -> String {
    "label".to_string()
}

/// A cleaning step requested by the client. Method names are parsed when the
/// step is applied so an unknown name surfaces as a validation error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    HandleMissing {
        #[serde(default = "default_missing_method")]
        method: String,
    },
    RemoveDuplicates {
        subset: Option<Vec<String>>,
    },
    RemoveOutliers {
        columns: Option<Vec<String>>,
        #[serde(default = "default_outlier_method")]
        method: String,
    },
    Normalize {
        columns: Option<Vec<String>>,
        #[serde(default = "default_scaling_method")]
        method: String,
    },
    Encode {
        columns: Option<Vec<String>>,
        #[serde(default = "default_encoding_method")]
        method: String,
    },
    CreateBins {
        column: String,
        bins: Bins,
        labels: Option<Vec<String>>,
    },
}

/// Working state of one user: the loaded table, the table derived from it by
/// cleaning steps, the fitted processor and an optional database connection.
#[derive(Debug, Default)]
pub struct Session {
    raw: Option<DataFrame>,
    processed: Option<DataFrame>,
    processor: DataProcessor,
    connection: Option<DbConnection>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the loaded table and forgets everything derived from the old one.
    pub fn set_raw(&mut self, df: DataFrame) {
        info!("Session table replaced: {} rows x {} columns", df.height(), df.width());
        self.raw = Some(df);
        self.processed = None;
        self.processor = DataProcessor::new();
    }

    pub fn raw(&self) -> Result<&DataFrame> {
        self.raw.as_ref().ok_or(AppError::NoData)
    }

    pub fn processed(&self) -> Option<&DataFrame> {
        self.processed.as_ref()
    }

    /// The processed table when one exists, otherwise the loaded one.
    pub fn current(&self) -> Result<&DataFrame> {
        match &self.processed {
            Some(df) => Ok(df),
            None => self.raw(),
        }
    }

    pub fn table(&self, raw: bool) -> Result<&DataFrame> {
        if raw {
            self.raw()
        } else {
            self.current()
        }
    }

    pub fn processor(&self) -> &DataProcessor {
        &self.processor
    }

    pub fn reset(&mut self) {
        debug!("Processed table discarded");
        self.processed = None;
        self.processor = DataProcessor::new();
    }

    /// Runs one step on the current table. On failure the session is unchanged.
    pub fn apply(&mut self, operation: &Operation) -> Result<&DataFrame> {
        let input = self.current()?.clone();
        let processor = &mut self.processor;
        let output = match operation {
            Operation::HandleMissing { method } => {
                processor.handle_missing(&input, method.parse()?)?
            }
            Operation::RemoveDuplicates { subset } => {
                processor.remove_duplicates(&input, subset.as_deref())?
            }
            Operation::RemoveOutliers { columns, method } => {
                processor.remove_outliers(&input, columns.as_deref(), method.parse()?)?
            }
            Operation::Normalize { columns, method } => {
                processor.normalize(&input, columns.as_deref(), method.parse()?)?
            }
            Operation::Encode { columns, method } => {
                processor.encode(&input, columns.as_deref(), method.parse()?)?
            }
            Operation::CreateBins { column, bins, labels } => {
                processor.create_bins(&input, column, bins, labels.as_deref())?
            }
        };
        info!(
            "Applied {:?}: {} rows x {} columns",
            operation,
            output.height(),
            output.width()
        );
        Ok(self.processed.insert(output))
    }

    /// Replaces the processed table with a seeded subsample of the current one.
    pub fn sample(&mut self, size: usize, seed: u64) -> Result<&DataFrame> {
        let sampled = loader::sample(self.current()?, size, seed)?;
        Ok(self.processed.insert(sampled))
    }

    pub fn connection(&self) -> Result<&DbConnection> {
        self.connection
            .as_ref()
            .ok_or_else(|| AppError::Connection("no database connection is open".to_string()))
    }

    pub fn connection_mut(&mut self) -> Result<&mut DbConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| AppError::Connection("no database connection is open".to_string()))
    }

    /// Installs a new connection, closing the previous one.
    pub fn set_connection(&mut self, connection: DbConnection) -> Result<()> {
        if let Some(previous) = self.connection.replace(connection) {
            previous.close()?;
        }
        Ok(())
    }

    pub fn close_connection(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(connection) => connection.close(),
            None => Err(AppError::Connection("no database connection is open".to_string())),
        }
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Live sessions keyed by a random id; idle sessions expire.
#[derive(Clone)]
pub struct SessionStore {
    cache: Cache<String, SharedSession>,
}

impl SessionStore {
    pub fn new(max_sessions: u64, idle: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_sessions)
                .time_to_idle(idle)
                .build(),
        }
    }

    pub fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.cache
            .insert(id.clone(), Arc::new(Mutex::new(Session::new())));
        info!("Created session {}", id);
        id
    }

    pub fn get(&self, id: &str) -> Result<SharedSession> {
        self.cache
            .get(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.cache
            .remove(id)
            .map(|_| info!("Removed session {}", id))
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }
}
