mod common;

use common::{doc, harness, harness_with, ids};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::time::Duration;

use studysearch::document::metadata_from;
use studysearch::utils::RetryPolicy;
use studysearch::{
    FusedResult, HybridQuery, IngestStatus, MetadataFilter, RetrieverConfig, SearchEvent,
    StoreKind, StudySearchError,
};

async fn seeded() -> common::Harness {
    let h = harness();
    h.ingest(vec![
        doc("A", "derivative of x squared"),
        doc("B", "calculus differentiation rules"),
        doc("C", "French Revolution causes"),
    ])
    .await;
    h
}

fn assert_ranked(results: &[FusedResult]) {
    for r in results {
        assert!((0.0..=1.0).contains(&r.fused_score), "{:?}", r);
    }
    for pair in results.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            a.fused_score > b.fused_score
                || (a.fused_score == b.fused_score && a.doc_id < b.doc_id),
            "out of order: {:?} before {:?}",
            a.doc_id,
            b.doc_id
        );
    }
}

#[tokio::test]
async fn relevant_documents_rank_above_unrelated_one() {
    let h = seeded().await;
    let response = h
        .retriever
        .search(HybridQuery::new("derivative rules").top_k(2).alpha(0.5))
        .await
        .unwrap();

    assert!(!response.partial);
    let mut top = ids(&response);
    top.sort();
    assert_eq!(top, vec!["A", "B"]);
    for r in &response.results {
        assert!(r.lexical_score > 0.0 || r.vector_score > 0.0);
    }
    assert_ranked(&response.results);
}

#[tokio::test]
async fn vector_outage_yields_partial_lexical_results() {
    let h = seeded().await;
    h.vector.switches.set_down(true);

    let response = h
        .retriever
        .search(HybridQuery::new("derivative rules").top_k(3))
        .await
        .unwrap();

    assert!(response.partial);
    assert_eq!(response.degraded, vec![StoreKind::Vector]);
    assert_eq!(response.alpha_applied, 0.0);
    assert_eq!(ids(&response), vec!["B", "A"]);
    for r in &response.results {
        assert_eq!(r.fused_score, r.lexical_score);
        assert_eq!(r.vector_raw, None);
    }

    let partial_events = h
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, SearchEvent::QueryCompleted { partial: true, .. }))
        .count();
    assert_eq!(partial_events, 1);
}

#[tokio::test]
async fn lexical_outage_yields_partial_vector_results() {
    let h = seeded().await;
    h.lexical.switches.set_down(true);

    let response = h
        .retriever
        .search(HybridQuery::new("derivative rules").top_k(3))
        .await
        .unwrap();

    assert!(response.partial);
    assert_eq!(response.degraded, vec![StoreKind::Lexical]);
    assert_eq!(response.alpha_applied, 1.0);
    assert_eq!(response.results[0].doc_id.as_str(), "B");
}

#[tokio::test]
async fn both_stores_down_is_retrieval_unavailable() {
    let h = seeded().await;
    h.lexical.switches.set_down(true);
    h.vector.switches.set_down(true);

    let err = h
        .retriever
        .search(HybridQuery::new("derivative"))
        .await
        .unwrap_err();
    assert!(matches!(err, StudySearchError::RetrievalUnavailable { .. }), "{}", err);
    assert!(h
        .events
        .events()
        .iter()
        .any(|e| matches!(e, SearchEvent::QueryFailed { .. })));
}

#[tokio::test]
async fn transient_read_failures_are_retried() {
    let h = harness_with(RetrieverConfig {
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        cache_ttl: Duration::ZERO,
        ..RetrieverConfig::default()
    });
    h.ingest(vec![doc("A", "derivative of x squared")]).await;
    h.lexical.switches.fail_next.store(2, Ordering::SeqCst);

    let response = h.retriever.search(HybridQuery::new("derivative")).await.unwrap();
    assert!(!response.partial);
    assert_eq!(h.lexical.switches.searches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn slow_store_times_out_into_degradation() {
    let h = harness_with(RetrieverConfig {
        retry: RetryPolicy::none(),
        store_timeout: Duration::from_millis(50),
        cache_ttl: Duration::ZERO,
        ..RetrieverConfig::default()
    });
    h.ingest(vec![doc("A", "derivative of x squared")]).await;
    h.vector.switches.delay_ms.store(400, Ordering::SeqCst);

    let response = h.retriever.search(HybridQuery::new("derivative")).await.unwrap();
    assert!(response.partial);
    assert_eq!(response.degraded, vec![StoreKind::Vector]);
    assert_eq!(ids(&response), vec!["A"]);
}

#[tokio::test]
async fn side_missing_query_deadline_is_degraded() {
    let h = harness_with(RetrieverConfig {
        retry: RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        store_timeout: Duration::from_millis(100),
        query_timeout: Duration::from_millis(250),
        cache_ttl: Duration::ZERO,
        ..RetrieverConfig::default()
    });
    h.ingest(vec![doc("A", "derivative of x squared")]).await;
    h.vector.switches.delay_ms.store(10_000, Ordering::SeqCst);

    let started = std::time::Instant::now();
    let response = h.retriever.search(HybridQuery::new("derivative")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(response.partial);
    assert_eq!(response.degraded, vec![StoreKind::Vector]);
    assert_eq!(response.alpha_applied, 0.0);
    assert_eq!(ids(&response), vec!["A"]);
}

#[tokio::test]
async fn both_sides_missing_query_deadline_is_retrieval_unavailable() {
    let h = harness_with(RetrieverConfig {
        retry: RetryPolicy::none(),
        store_timeout: Duration::from_secs(5),
        query_timeout: Duration::from_millis(50),
        cache_ttl: Duration::ZERO,
        ..RetrieverConfig::default()
    });
    h.ingest(vec![doc("A", "derivative of x squared")]).await;
    h.lexical.switches.delay_ms.store(1_000, Ordering::SeqCst);
    h.vector.switches.delay_ms.store(1_000, Ordering::SeqCst);

    let err = h
        .retriever
        .search(HybridQuery::new("derivative"))
        .await
        .unwrap_err();
    assert!(matches!(err, StudySearchError::RetrievalUnavailable { .. }), "{}", err);
}

#[tokio::test]
async fn dangling_query_operators_do_not_fail_the_query() {
    let h = seeded().await;
    for text in ["rules AND", "derivative OR", "what is NOT", "NOT", "x IN"] {
        let response = h
            .retriever
            .search(HybridQuery::new(text))
            .await
            .unwrap_or_else(|e| panic!("{:?} failed: {}", text, e));
        assert!(!response.partial, "{:?} degraded {:?}", text, response.degraded);
    }

    let response = h.retriever.search(HybridQuery::new("rules AND")).await.unwrap();
    assert!(response
        .results
        .iter()
        .any(|r| r.doc_id.as_str() == "B" && r.lexical_raw.is_some()));
}

#[tokio::test]
async fn each_store_is_over_fetched() {
    let h = seeded().await;
    h.retriever
        .search(HybridQuery::new("derivative rules").top_k(2))
        .await
        .unwrap();

    assert_eq!(h.lexical.switches.last_top_k(), 6);
    assert_eq!(h.vector.switches.last_top_k(), 6);
}

#[tokio::test]
async fn alpha_extremes_reproduce_single_store_rankings() {
    let h = seeded().await;
    h.ingest(vec![
        doc("D", "rules of differentiation for derivative problems"),
        doc("E", "causes of the French Revolution and its rules"),
    ])
    .await;
    let text = "derivative rules revolution";

    let lexical = h
        .retriever
        .search(HybridQuery::new(text).top_k(10).alpha(0.0))
        .await
        .unwrap();
    let mut expected = lexical.results.clone();
    expected.sort_by(|a, b| {
        b.lexical_score
            .total_cmp(&a.lexical_score)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    assert_eq!(ids(&lexical), expected.iter().map(|r| r.doc_id.as_str()).collect::<Vec<_>>());
    assert_ranked(&lexical.results);

    let vector = h
        .retriever
        .search(HybridQuery::new(text).top_k(10).alpha(1.0))
        .await
        .unwrap();
    let mut expected = vector.results.clone();
    expected.sort_by(|a, b| {
        b.vector_score
            .total_cmp(&a.vector_score)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    assert_eq!(ids(&vector), expected.iter().map(|r| r.doc_id.as_str()).collect::<Vec<_>>());
    assert_ranked(&vector.results);
}

#[tokio::test]
async fn reingesting_same_document_keeps_one_copy() {
    let h = harness();
    let request = doc("Q1", "integration by parts");
    h.ingest(vec![request.clone()]).await;
    h.ingest(vec![request]).await;

    let response = h
        .retriever
        .search(HybridQuery::new("integration by parts"))
        .await
        .unwrap();
    assert_eq!(ids(&response), vec!["Q1"]);
}

#[tokio::test]
async fn deleted_document_disappears_in_both_modes() {
    let h = seeded().await;
    h.coordinator.delete(vec!["A".into()]).await.unwrap();

    for alpha in [0.0, 0.5, 1.0] {
        let response = h
            .retriever
            .search(HybridQuery::new("derivative of x squared").alpha(alpha))
            .await
            .unwrap();
        assert!(!ids(&response).contains(&"A"), "alpha {}", alpha);
    }
}

#[tokio::test]
async fn lexical_only_document_still_ranks() {
    let h = seeded().await;
    h.vector.switches.set_down(true);
    let outcomes = h.ingest(vec![doc("P", "photosynthesis light reactions")]).await;
    assert_eq!(outcomes[0].status, IngestStatus::Degraded);
    h.vector.switches.set_down(false);

    let response = h
        .retriever
        .search(HybridQuery::new("photosynthesis"))
        .await
        .unwrap();
    assert!(!response.partial);
    let p = response
        .results
        .iter()
        .find(|r| r.doc_id.as_str() == "P")
        .expect("lexical-only document in results");
    assert_eq!(p.vector_score, 0.0);
    assert_eq!(p.vector_raw, None);
    assert_eq!(p.lexical_score, 1.0);
    assert!(p.fused_score > 0.0);
}

#[tokio::test]
async fn in_filter_and_type_filter() {
    let h = harness();
    h.ingest(vec![
        doc("m1", "kinematics problems")
            .with_metadata(metadata_from([("subject", "physics"), ("type", "question")])),
        doc("m2", "kinematics notes")
            .with_metadata(metadata_from([("subject", "physics"), ("type", "material")])),
        doc("m3", "kinematics of chemistry")
            .with_metadata(metadata_from([("subject", "chemistry"), ("type", "question")])),
    ])
    .await;

    let filter = MetadataFilter::default().and("subject=physics|math".parse().unwrap());
    let response = h
        .retriever
        .search(HybridQuery::new("kinematics").filter(filter.clone()))
        .await
        .unwrap();
    let mut found = ids(&response);
    found.sort();
    assert_eq!(found, vec!["m1", "m2"]);

    let response = h
        .retriever
        .search(
            HybridQuery::new("kinematics")
                .filter(filter)
                .doc_type(studysearch::DocType::Question),
        )
        .await
        .unwrap();
    assert_eq!(ids(&response), vec!["m1"]);
}

#[tokio::test]
async fn partial_responses_are_not_cached() {
    let h = harness_with(RetrieverConfig {
        retry: RetryPolicy::none(),
        cache_ttl: Duration::from_secs(60),
        ..RetrieverConfig::default()
    });
    h.ingest(vec![doc("A", "derivative of x squared")]).await;
    h.vector.switches.set_down(true);

    let query = HybridQuery::new("derivative");
    let first = h.retriever.search(query.clone()).await.unwrap();
    let second = h.retriever.search(query).await.unwrap();
    assert!(first.partial && second.partial);
    assert!(!second.cached);
}
