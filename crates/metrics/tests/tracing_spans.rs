//! Integration test verifying that `#[instrument]` annotations produce
//! the expected spans on local store and race store operations.

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::sync::Arc;

use benchmark_metrics::{
    Challenge, CompositeRaceStore, MetricsStore, RaceStore, Track, calculate_results,
    testutil::{MemoryRaceStore, open_local_store, sample_race},
};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().push(span.name().to_owned());
        }
    }
}

fn collect(f: impl FnOnce()) -> Vec<String> {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let subscriber = tracing_subscriber::registry().with(collector);
    tracing::subscriber::with_default(subscriber, f);
    spans.lock().clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn local_store_open_creates_span() {
    let recorded = collect(|| {
        let _store = open_local_store("spans");
    });
    assert!(recorded.iter().any(|s| s == "open"), "expected an 'open' span, got: {recorded:?}");
}

#[test]
fn local_store_externalize_creates_span() {
    let recorded = collect(|| {
        let mut store = open_local_store("spans");
        store.to_externalizable(true).unwrap();
    });
    assert!(
        recorded.iter().any(|s| s == "to_externalizable"),
        "expected a 'to_externalizable' span, got: {recorded:?}"
    );
}

#[test]
fn calculate_results_creates_span() {
    let recorded = collect(|| {
        let mut store = open_local_store("spans");
        store.close().unwrap();
        calculate_results(&store, &Track::new("t"), &Challenge::new("c")).unwrap();
    });
    assert!(recorded.iter().any(|s| s == "calculate"), "expected a 'calculate' span, got: {recorded:?}");
}

#[test]
fn composite_store_race_creates_span() {
    let recorded = collect(|| {
        let store = CompositeRaceStore::new(MemoryRaceStore::default(), MemoryRaceStore::default());
        store.store_race(&sample_race("r1", Utc::now())).unwrap();
    });
    assert!(recorded.iter().any(|s| s == "store_race"), "expected a 'store_race' span, got: {recorded:?}");
}
