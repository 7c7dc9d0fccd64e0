//! Property tests for the metrics validation gate.
//!
//! 1. No input ever produces an `ok` result holding a non-finite value
//! 2. Every refusal is a `fallback` carrying the declared default and a reason
//! 3. Element-wise metrics on unequal lengths always report both lengths

use chrono::Utc;
use proptest::prelude::*;
use std::sync::Arc;

use reportdeck_core::{Column, ColumnType, Dataset, Provenance, Value};
use reportdeck_runner::metrics::evaluate;
use reportdeck_runner::{
    ColumnRef, DatasetMap, MetricDefinition, MetricKind, MetricStatus, MetricValue,
};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_cell() -> impl Strategy<Value = Option<f64>> {
    prop_oneof![
        3 => (-1.0e6f64..1.0e6).prop_map(Some),
        1 => Just(Some(0.0)),
        1 => Just(None),
    ]
}

fn arb_column() -> impl Strategy<Value = Vec<Option<f64>>> {
    prop::collection::vec(arb_cell(), 0..12)
}

fn arb_kind() -> impl Strategy<Value = MetricKind> {
    let a = || ColumnRef::new("a", "v");
    let b = || ColumnRef::new("b", "v");
    prop_oneof![
        Just(MetricKind::Delta { a: a(), b: b() }),
        Just(MetricKind::Ratio {
            numerator: a(),
            denominator: b(),
        }),
        Just(MetricKind::GrowthRate { series: a() }),
        Just(MetricKind::PeriodGrowth { series: a() }),
        Just(MetricKind::Mean { series: a() }),
        Just(MetricKind::Share { series: a() }),
    ]
}

fn dataset(key: &str, cells: &[Option<f64>]) -> Arc<Dataset> {
    let rows = cells
        .iter()
        .map(|c| vec![c.map(Value::Number).unwrap_or(Value::Missing)])
        .collect();
    Arc::new(
        Dataset::new(
            key,
            vec![Column::new("v", ColumnType::Numeric).nullable()],
            rows,
            Provenance::Extracted,
            Utc::now(),
        )
        .unwrap(),
    )
}

fn datasets(a: &[Option<f64>], b: &[Option<f64>]) -> DatasetMap {
    let mut map = DatasetMap::new();
    map.insert("a".into(), dataset("a", a));
    map.insert("b".into(), dataset("b", b));
    map
}

fn all_finite(value: &MetricValue) -> bool {
    match value {
        MetricValue::Scalar(v) => v.is_finite(),
        MetricValue::Series(vs) => vs.iter().all(|v| v.is_finite()),
    }
}

// ── Properties ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn ok_results_are_always_finite(kind in arb_kind(), a in arb_column(), b in arb_column()) {
        let definition = MetricDefinition::new("m", kind);
        let result = evaluate(&definition, &datasets(&a, &b));

        prop_assert_ne!(result.status, MetricStatus::Error);
        if result.status == MetricStatus::Ok {
            let value = result.value.as_ref().unwrap();
            prop_assert!(all_finite(value), "non-finite ok value {:?}", value);
            prop_assert!(result.reason.is_none());
        }
    }

    #[test]
    fn refusals_carry_default_and_reason(kind in arb_kind(), a in arb_column(), b in arb_column()) {
        let default = MetricValue::Scalar(-1.0);
        let definition = MetricDefinition::new("m", kind).with_default(default.clone());
        let result = evaluate(&definition, &datasets(&a, &b));

        if result.status == MetricStatus::Fallback {
            prop_assert_eq!(result.value, Some(default));
            prop_assert!(result.reason.is_some_and(|r| !r.is_empty()));
        }
    }

    #[test]
    fn unequal_lengths_report_both(
        a in prop::collection::vec(1.0f64..100.0, 1..10),
        b in prop::collection::vec(1.0f64..100.0, 1..10),
    ) {
        prop_assume!(a.len() != b.len());
        let wrap = |xs: &[f64]| xs.iter().copied().map(Some).collect::<Vec<_>>();
        let definition = MetricDefinition::new(
            "delta",
            MetricKind::Delta {
                a: ColumnRef::new("a", "v"),
                b: ColumnRef::new("b", "v"),
            },
        );
        let result = evaluate(&definition, &datasets(&wrap(&a), &wrap(&b)));

        prop_assert_eq!(result.status, MetricStatus::Fallback);
        let expected = format!("{} vs {}", a.len(), b.len());
        let reason = result.reason.unwrap();
        prop_assert!(reason.contains(&expected), "{}", reason);
    }
}
