//! Integration test verifying that `#[instrument]` annotations produce
//! the expected spans on remote store operations.

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::sync::Arc;

use benchmark_metrics::{
    MetricsStore, RaceStore, StoreSettings,
    testutil::{open_context, sample_race, service_time},
};
use benchmark_metrics_remote::{
    RemoteRaceStore, TemplateProvider,
    testutil::{FakeDatastore, RecordingSleeper, remote_store, resilient_client},
};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

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

fn assert_span(recorded: &[String], name: &str) {
    assert!(recorded.iter().any(|s| s == name), "expected a '{name}' span, got: {recorded:?}");
}

#[test]
fn open_reconciles_templates_through_the_client() {
    let recorded = collect(|| {
        let mut store = remote_store(&Arc::new(FakeDatastore::new()));
        store.open(open_context("spans"), true).unwrap();
    });
    for name in ["open", "reconcile", "execute"] {
        assert_span(&recorded, name);
    }
}

#[test]
fn flush_creates_span() {
    let recorded = collect(|| {
        let mut store = remote_store(&Arc::new(FakeDatastore::new()));
        store.open(open_context("spans"), true).unwrap();
        store.put_value_cluster_level(service_time("index-append", 1.0, true)).unwrap();
        store.flush(false).unwrap();
    });
    assert_span(&recorded, "flush");
}

#[test]
fn store_race_creates_span() {
    let recorded = collect(|| {
        let fake = Arc::new(FakeDatastore::new());
        let client = resilient_client(&fake, &Arc::new(RecordingSleeper::default()));
        let store = RemoteRaceStore::new(&StoreSettings::default(), client, TemplateProvider::default());
        store.store_race(&sample_race("r1", Utc::now())).unwrap();
    });
    assert_span(&recorded, "store_race");
}
