//! Event Time Columns
//!
//! [`TimestampColumn`] reads per-record event timestamps out of an Arrow
//! `RecordBatch`. Build operators use it to route every record to the slice
//! covering its event time. All values are normalized to milliseconds.
//!
//! # Example
//!
//! ```rust
//! use arrow_array::{Int64Array, RecordBatch};
//! use std::sync::Arc;
//! use strata_core::time::{TimestampColumn, TimestampFormat};
//!
//! let batch = RecordBatch::try_from_iter(vec![(
//!     "ts",
//!     Arc::new(Int64Array::from(vec![1, 2])) as _,
//! )])
//! .unwrap();
//!
//! let column = TimestampColumn::from_column("ts", TimestampFormat::UnixSeconds);
//! assert_eq!(column.timestamps(&batch).unwrap(), vec![1000, 2000]);
//! ```

use std::fmt;
use std::sync::OnceLock;

use arrow_array::{
    Array, ArrayRef, Int64Array, RecordBatch, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray,
};
use arrow_schema::{DataType, Schema, TimeUnit};

/// Timestamp format variants for extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// Unix timestamp in milliseconds (i64)
    UnixMillis,
    /// Unix timestamp in seconds (i64) - converted to millis
    UnixSeconds,
    /// Unix timestamp in microseconds (i64) - converted to millis
    UnixMicros,
    /// Unix timestamp in nanoseconds (i64) - converted to millis
    UnixNanos,
    /// Arrow `Timestamp` column of any unit
    ArrowNative,
}

impl fmt::Display for TimestampFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampFormat::UnixMillis => write!(f, "UnixMillis"),
            TimestampFormat::UnixSeconds => write!(f, "UnixSeconds"),
            TimestampFormat::UnixMicros => write!(f, "UnixMicros"),
            TimestampFormat::UnixNanos => write!(f, "UnixNanos"),
            TimestampFormat::ArrowNative => write!(f, "ArrowNative"),
        }
    }
}

/// Column identifier for the timestamp field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampField {
    /// Column name (index cached after first lookup)
    Name(String),
    /// Column index
    Index(usize),
}

/// Errors that can occur while reading event time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventTimeError {
    /// Column not found in schema
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Column index out of bounds
    #[error("Column index {index} out of bounds (batch has {num_columns} columns)")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Number of columns in batch
        num_columns: usize,
    },

    /// Incompatible column type for format
    #[error("Incompatible type for format {format}: expected {expected}, found {found}")]
    IncompatibleType {
        /// Requested format
        format: TimestampFormat,
        /// Expected type
        expected: String,
        /// Actual type found
        found: String,
    },

    /// Null timestamp encountered
    #[error("Null timestamp at row {row}")]
    NullTimestamp {
        /// Row index with null value
        row: usize,
    },
}

/// Reads event timestamps from a record batch column.
///
/// The column index is resolved on first use and cached; the cache is safe
/// to share across worker threads.
#[derive(Debug)]
pub struct TimestampColumn {
    field: TimestampField,
    format: TimestampFormat,
    cached_index: OnceLock<usize>,
}

impl Clone for TimestampColumn {
    fn clone(&self) -> Self {
        Self {
            field: self.field.clone(),
            format: self.format,
            cached_index: self.cached_index.get().map_or_else(OnceLock::new, |&idx| {
                let lock = OnceLock::new();
                let _ = lock.set(idx);
                lock
            }),
        }
    }
}

impl TimestampColumn {
    /// Reads timestamps from the column with the given name.
    #[must_use]
    pub fn from_column(name: &str, format: TimestampFormat) -> Self {
        Self {
            field: TimestampField::Name(name.to_string()),
            format,
            cached_index: OnceLock::new(),
        }
    }

    /// Reads timestamps from the column at the given index.
    #[must_use]
    pub fn from_index(index: usize, format: TimestampFormat) -> Self {
        Self {
            field: TimestampField::Index(index),
            format,
            cached_index: OnceLock::new(),
        }
    }

    /// Returns the configured field.
    #[must_use]
    pub fn field(&self) -> &TimestampField {
        &self.field
    }

    /// Returns the configured format.
    #[must_use]
    pub fn format(&self) -> TimestampFormat {
        self.format
    }

    /// Validates that the schema contains a compatible timestamp column.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is not found or has an incompatible type.
    pub fn validate_schema(&self, schema: &Schema) -> Result<(), EventTimeError> {
        let index = self.resolve_index(schema)?;
        self.validate_type(schema.field(index).data_type())
    }

    /// Reads the event time of every record, in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the column cannot be resolved, has an incompatible
    /// type, or contains a null.
    pub fn timestamps(&self, batch: &RecordBatch) -> Result<Vec<i64>, EventTimeError> {
        let index = self.column_index(batch.schema_ref())?;
        let column = batch.column(index);
        self.validate_type(column.data_type())?;

        if let Some(row) = (0..column.len()).find(|&row| column.is_null(row)) {
            return Err(EventTimeError::NullTimestamp { row });
        }

        match self.format {
            TimestampFormat::UnixMillis => Ok(int64_values(column, |v| v)),
            TimestampFormat::UnixSeconds => Ok(int64_values(column, |v| v.saturating_mul(1000))),
            TimestampFormat::UnixMicros => Ok(int64_values(column, |v| v.div_euclid(1000))),
            TimestampFormat::UnixNanos => Ok(int64_values(column, |v| v.div_euclid(1_000_000))),
            TimestampFormat::ArrowNative => Ok(native_values(column)),
        }
    }

    fn column_index(&self, schema: &Schema) -> Result<usize, EventTimeError> {
        if let Some(&idx) = self.cached_index.get() {
            if idx < schema.fields().len() {
                return Ok(idx);
            }
        }
        let index = self.resolve_index(schema)?;
        let _ = self.cached_index.set(index);
        Ok(index)
    }

    fn resolve_index(&self, schema: &Schema) -> Result<usize, EventTimeError> {
        match &self.field {
            TimestampField::Name(name) => schema
                .index_of(name)
                .map_err(|_| EventTimeError::ColumnNotFound(name.clone())),
            TimestampField::Index(index) => {
                if *index >= schema.fields().len() {
                    return Err(EventTimeError::IndexOutOfBounds {
                        index: *index,
                        num_columns: schema.fields().len(),
                    });
                }
                Ok(*index)
            }
        }
    }

    fn validate_type(&self, data_type: &DataType) -> Result<(), EventTimeError> {
        let ok = match self.format {
            TimestampFormat::UnixMillis
            | TimestampFormat::UnixSeconds
            | TimestampFormat::UnixMicros
            | TimestampFormat::UnixNanos => matches!(data_type, DataType::Int64),
            TimestampFormat::ArrowNative => matches!(data_type, DataType::Timestamp(_, _)),
        };
        if ok {
            Ok(())
        } else {
            Err(EventTimeError::IncompatibleType {
                format: self.format,
                expected: match self.format {
                    TimestampFormat::ArrowNative => "Timestamp".to_string(),
                    _ => "Int64".to_string(),
                },
                found: format!("{data_type:?}"),
            })
        }
    }
}

fn int64_values(column: &ArrayRef, convert: impl Fn(i64) -> i64) -> Vec<i64> {
    column
        .as_any()
        .downcast_ref::<Int64Array>()
        .map(|array| array.values().iter().map(|&v| convert(v)).collect())
        .unwrap_or_default()
}

fn native_values(column: &ArrayRef) -> Vec<i64> {
    let any = column.as_any();
    match column.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => any
            .downcast_ref::<TimestampSecondArray>()
            .map(|a| a.values().iter().map(|&v| v.saturating_mul(1000)).collect()),
        DataType::Timestamp(TimeUnit::Millisecond, _) => any
            .downcast_ref::<TimestampMillisecondArray>()
            .map(|a| a.values().to_vec()),
        DataType::Timestamp(TimeUnit::Microsecond, _) => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .map(|a| a.values().iter().map(|&v| v.div_euclid(1000)).collect()),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => any
            .downcast_ref::<TimestampNanosecondArray>()
            .map(|a| a.values().iter().map(|&v| v.div_euclid(1_000_000)).collect()),
        _ => None,
    }
    .unwrap_or_default()
}
