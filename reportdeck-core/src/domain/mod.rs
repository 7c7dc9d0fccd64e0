//! Domain types: raw extraction output and validated datasets.

pub mod dataset;
pub mod raw;

pub use dataset::{Column, ColumnType, Dataset, Provenance, Value};
pub use raw::{RawRecord, RawTable, RecordKind};
