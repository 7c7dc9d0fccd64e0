//! Extraction: the boundary to the external document decoder.
//!
//! [`RawTableSource`] abstracts over the capability that turns a document into
//! raw records, so implementations can be swapped and mocked in tests. The
//! [`Extractor`] wraps one source and adds what the capability itself does not
//! guarantee: a per-source timeout, panic isolation, and a circuit breaker.
//! Every failure comes back as a typed [`ExtractError`] for that source only.

pub mod circuit_breaker;
pub mod csv_source;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ExtractConfig;
use crate::domain::{RawRecord, RawTable};

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use csv_source::CsvDocumentSource;

/// Failure reported by a raw table source.
#[derive(Debug, Error)]
pub enum RawSourceError {
    #[error("document unreadable: {0}")]
    Unreadable(String),

    #[error("document undecodable: {0}")]
    Undecodable(String),
}

/// The external capability: document identifier in, raw records out.
pub trait RawTableSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Decode every record in the document identified by `source_id`.
    fn extract_raw_tables(&self, source_id: &str) -> Result<Vec<RawRecord>, RawSourceError>;
}

/// Extraction failure for a single source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("extraction failed for source '{source_id}': {cause}")]
    Extraction { source_id: String, cause: String },

    #[error("extraction of source '{source_id}' timed out after {after:?}")]
    Timeout { source_id: String, after: Duration },

    #[error("source '{source_id}' refused for another {retry_in:?} after repeated failures")]
    CircuitOpen { source_id: String, retry_in: Duration },
}

impl ExtractError {
    pub fn source_id(&self) -> &str {
        match self {
            ExtractError::Extraction { source_id, .. }
            | ExtractError::Timeout { source_id, .. }
            | ExtractError::CircuitOpen { source_id, .. } => source_id,
        }
    }
}

/// Timeout-bounded, failure-isolating wrapper around a [`RawTableSource`].
pub struct Extractor {
    source: Arc<dyn RawTableSource>,
    timeout: Duration,
    failure_threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Extractor {
    pub fn new(source: Arc<dyn RawTableSource>, config: &ExtractConfig) -> Self {
        Self {
            source,
            timeout: config.source_timeout(),
            failure_threshold: config.breaker_failure_threshold,
            cooldown: config.breaker_cooldown(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extract the first table from the document `source_id`.
    ///
    /// Never blocks longer than the configured timeout. On timeout the
    /// decoding thread is abandoned and its eventual result discarded.
    pub fn extract(&self, source_id: &str) -> Result<RawTable, ExtractError> {
        let breaker = self.breaker(source_id);
        if !breaker.is_allowed() {
            return Err(ExtractError::CircuitOpen {
                source_id: source_id.to_string(),
                retry_in: breaker.remaining_cooldown(),
            });
        }

        let result = self.extract_with_timeout(source_id);
        match &result {
            Ok(table) => {
                breaker.record_success();
                debug!(
                    source_id,
                    rows = table.rows.len(),
                    columns = table.headers.len(),
                    "extracted raw table"
                );
            }
            Err(e) => {
                if breaker.record_failure() {
                    warn!(source_id, cooldown = ?self.cooldown, "circuit breaker tripped: {e}");
                }
            }
        }
        result
    }

    /// Current breaker state for a source, if it has been extracted before.
    pub fn breaker_state(&self, source_id: &str) -> Option<BreakerState> {
        self.breakers
            .lock()
            .expect("breaker map poisoned")
            .get(source_id)
            .map(|b| b.state())
    }

    fn breaker(&self, source_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker map poisoned");
        Arc::clone(breakers.entry(source_id.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(self.failure_threshold, self.cooldown))
        }))
    }

    fn extract_with_timeout(&self, source_id: &str) -> Result<RawTable, ExtractError> {
        let failed = |cause: String| ExtractError::Extraction {
            source_id: source_id.to_string(),
            cause,
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let source = Arc::clone(&self.source);
        let id = source_id.to_string();
        thread::Builder::new()
            .name("reportdeck-extract".into())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| source.extract_raw_tables(&id)));
                // The receiver is gone if the caller already timed out.
                let _ = tx.send(outcome);
            })
            .map_err(|e| failed(format!("cannot spawn extraction thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(Ok(records))) => records
                .into_iter()
                .find_map(RawTable::from_record)
                .ok_or_else(|| failed("document contains no table with a header row".into())),
            Ok(Ok(Err(e))) => Err(failed(e.to_string())),
            Ok(Err(payload)) => Err(failed(format!(
                "extractor panicked: {}",
                panic_message(&*payload)
            ))),
            Err(RecvTimeoutError::Timeout) => Err(ExtractError::Timeout {
                source_id: source_id.to_string(),
                after: self.timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(failed("extraction thread exited without a result".into()))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecordKind;

    struct ScriptedSource;

    impl RawTableSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn extract_raw_tables(&self, source_id: &str) -> Result<Vec<RawRecord>, RawSourceError> {
            match source_id {
                "good" => Ok(vec![
                    RawRecord {
                        document_id: "good".into(),
                        kind: RecordKind::Text,
                        payload: vec![vec!["preamble".into()]],
                    },
                    RawRecord::table(
                        "good",
                        vec![
                            vec!["a".into(), "b".into()],
                            vec!["1".into(), "2".into()],
                        ],
                    ),
                ]),
                "text_only" => Ok(vec![RawRecord {
                    document_id: "text_only".into(),
                    kind: RecordKind::Text,
                    payload: vec![vec!["just words".into()]],
                }]),
                "slow" => {
                    thread::sleep(Duration::from_millis(500));
                    Ok(vec![])
                }
                "panics" => panic!("decoder exploded"),
                _ => Err(RawSourceError::Undecodable("garbled".into())),
            }
        }
    }

    fn extractor(timeout_ms: u64, threshold: u32) -> Extractor {
        let config = ExtractConfig {
            source_timeout_ms: timeout_ms,
            breaker_failure_threshold: threshold,
            breaker_cooldown_secs: 60,
        };
        Extractor::new(Arc::new(ScriptedSource), &config)
    }

    #[test]
    fn picks_first_table_record() {
        let table = extractor(1_000, 3).extract("good").unwrap();
        assert_eq!(table.headers, vec!["a", "b"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn document_without_table_is_extraction_error() {
        let err = extractor(1_000, 3).extract("text_only").unwrap_err();
        assert!(matches!(err, ExtractError::Extraction { .. }));
    }

    #[test]
    fn decode_failure_is_typed() {
        let err = extractor(1_000, 3).extract("broken").unwrap_err();
        assert_eq!(err.source_id(), "broken");
        assert!(err.to_string().contains("garbled"));
    }

    #[test]
    fn slow_source_times_out() {
        let err = extractor(50, 3).extract("slow").unwrap_err();
        assert!(matches!(err, ExtractError::Timeout { .. }));
    }

    #[test]
    fn panic_is_contained() {
        let err = extractor(1_000, 3).extract("panics").unwrap_err();
        assert!(err.to_string().contains("decoder exploded"));
    }

    #[test]
    fn repeated_failures_open_the_circuit_for_that_source_only() {
        let ex = extractor(1_000, 2);
        assert!(ex.extract("broken").is_err());
        assert!(ex.extract("broken").is_err());
        let err = ex.extract("broken").unwrap_err();
        assert!(matches!(err, ExtractError::CircuitOpen { .. }));
        assert!(ex.extract("good").is_ok());
        assert!(matches!(
            ex.breaker_state("broken"),
            Some(BreakerState::Open { .. })
        ));
    }
}
