//! Behavior-driven tests for the record store
//!
//! These tests verify HOW work items move through their lifecycle in the DuckDB
//! store and how results are kept, independently of the queue engine.

use cadastro_store::{
    DuckDbStore, EnqueueOutcome, ExtractedFields, NewResult, Outcome, RecordStore, StoreConfig,
    StoreError, WorkStatus,
};
use serde_json::json;
use tempfile::tempdir;
use time::{Duration, OffsetDateTime};

const KEY: &str = "11222333000181";
const OTHER_KEY: &str = "11444777000161";

fn retention_cutoff() -> OffsetDateTime {
    OffsetDateTime::now_utc() - Duration::days(7)
}

fn acme_result(key: &str, provider: &str) -> NewResult {
    NewResult {
        external_key: key.to_owned(),
        provider: provider.to_owned(),
        raw_payload: json!({"nome": "ACME LTDA", "cnpj": key}),
        fields: ExtractedFields {
            company_name: Some(String::from("ACME LTDA")),
            city: Some(String::from("RECIFE")),
            ..ExtractedFields::default()
        },
    }
}

fn complete(store: &DuckDbStore, key: &str) {
    store.enqueue(key, retention_cutoff()).expect("enqueue");
    let item = store.claim(key).expect("claim").expect("claimable row");
    assert!(store.finish(item.id, &Outcome::Completed).expect("finish"));
}

// =============================================================================
// Store: Enqueue Deduplication
// =============================================================================

#[test]
fn when_key_is_new_system_creates_a_queued_row() {
    // Given: An empty store
    let store = DuckDbStore::open_in_memory().expect("open");

    // When: A key is enqueued
    let outcome = store.enqueue(KEY, retention_cutoff()).expect("enqueue");

    // Then: A Queued row exists for it
    let EnqueueOutcome::Queued(item) = outcome else {
        panic!("expected a queued row, got {outcome:?}");
    };
    assert_eq!(item.external_key, KEY);
    assert_eq!(item.status, WorkStatus::Queued);
    assert_eq!(item.attempts, 0);
    assert_eq!(store.count_by_status(WorkStatus::Queued).expect("count"), 1);
}

#[test]
fn when_key_is_active_system_does_not_queue_it_twice() {
    // Given: A key that is queued, and another that is being processed
    let store = DuckDbStore::open_in_memory().expect("open");
    store.enqueue(KEY, retention_cutoff()).expect("enqueue");
    store.enqueue(OTHER_KEY, retention_cutoff()).expect("enqueue");
    store.claim(OTHER_KEY).expect("claim").expect("row");

    // When: Both keys are enqueued again
    let queued_again = store.enqueue(KEY, retention_cutoff()).expect("enqueue");
    let processing_again = store.enqueue(OTHER_KEY, retention_cutoff()).expect("enqueue");

    // Then: Both are reported active and no row is added
    assert!(matches!(queued_again, EnqueueOutcome::AlreadyActive(ref item) if item.status == WorkStatus::Queued));
    assert!(matches!(processing_again, EnqueueOutcome::AlreadyActive(ref item) if item.status == WorkStatus::Processing));
    assert_eq!(store.status_counts().expect("counts").total(), 2);
}

#[test]
fn when_key_completed_within_retention_system_skips_it() {
    // Given: A key completed moments ago
    let store = DuckDbStore::open_in_memory().expect("open");
    complete(&store, KEY);

    // When: It is enqueued with a seven day retention window
    let outcome = store.enqueue(KEY, retention_cutoff()).expect("enqueue");

    // Then: The completed row is reported and left alone
    assert!(matches!(outcome, EnqueueOutcome::RecentlyCompleted(ref item) if item.status == WorkStatus::Completed));
    assert_eq!(store.count_by_status(WorkStatus::Completed).expect("count"), 1);
}

#[test]
fn when_completion_is_older_than_retention_system_requeues_the_same_row() {
    // Given: A key whose completion falls outside the window
    let store = DuckDbStore::open_in_memory().expect("open");
    complete(&store, KEY);
    let completed = store.latest_item(KEY).expect("latest").expect("row");

    // When: It is enqueued with a cutoff after the completion time
    let cutoff = OffsetDateTime::now_utc() + Duration::seconds(1);
    let outcome = store.enqueue(KEY, cutoff).expect("enqueue");

    // Then: The existing row is reused as Queued with a fresh attempt count
    let EnqueueOutcome::Queued(item) = outcome else {
        panic!("expected a queued row, got {outcome:?}");
    };
    assert_eq!(item.id, completed.id);
    assert_eq!(item.attempts, 0);
    assert_eq!(store.status_counts().expect("counts").total(), 1);
}

// =============================================================================
// Store: Pending Work and Recovery
// =============================================================================

#[test]
fn when_rate_limited_retry_time_has_not_passed_system_keeps_it_out_of_pending() {
    // Given: One queued key and one rate-limited key retrying in a minute
    let store = DuckDbStore::open_in_memory().expect("open");
    store.enqueue(KEY, retention_cutoff()).expect("enqueue");
    store.enqueue(OTHER_KEY, retention_cutoff()).expect("enqueue");
    let item = store.claim(OTHER_KEY).expect("claim").expect("row");
    let retry_after = OffsetDateTime::now_utc() + Duration::minutes(1);
    store
        .finish(
            item.id,
            &Outcome::RateLimited {
                message: String::from("quota"),
                retry_after,
            },
        )
        .expect("finish");

    // When: Pending rows are listed now and after the retry time
    let now = store.pending_items(OffsetDateTime::now_utc()).expect("pending");
    let later = store
        .pending_items(retry_after + Duration::seconds(1))
        .expect("pending later");

    // Then: The rate-limited row only shows up once it is due, after queued rows
    assert_eq!(now.len(), 1);
    assert_eq!(now[0].external_key, KEY);
    assert_eq!(later.len(), 2);
    assert_eq!(later[0].status, WorkStatus::Queued);
    assert_eq!(later[1].status, WorkStatus::RateLimited);
}

#[test]
fn when_processing_rows_go_stale_system_reclassifies_by_last_error() {
    // Given: Two processing rows, one whose last attempt hit a quota
    let store = DuckDbStore::open_in_memory().expect("open");
    store.enqueue(KEY, retention_cutoff()).expect("enqueue");
    store.enqueue(OTHER_KEY, retention_cutoff()).expect("enqueue");
    let quota = store.claim(KEY).expect("claim").expect("row");
    let broken = store.claim(OTHER_KEY).expect("claim").expect("row");
    store
        .record_attempt_error(quota.id, "429 from every provider", true)
        .expect("record");
    store
        .record_attempt_error(broken.id, "connection reset", false)
        .expect("record");

    // When: Every processing row counts as stuck
    let retry_after = OffsetDateTime::now_utc() + Duration::minutes(1);
    let report = store
        .reclassify_stuck(OffsetDateTime::now_utc() + Duration::seconds(1), retry_after)
        .expect("reclassify");

    // Then: The quota row is retried later, the other fails with its last error kept
    assert_eq!(report.rate_limited, 1);
    assert_eq!(report.errored, 1);
    let quota = store.latest_item(KEY).expect("latest").expect("row");
    assert_eq!(quota.status, WorkStatus::RateLimited);
    assert!(quota.retry_after.is_some());
    let broken = store.latest_item(OTHER_KEY).expect("latest").expect("row");
    assert_eq!(broken.status, WorkStatus::Error);
    assert!(broken
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("connection reset")));
}

#[test]
fn when_fresh_processing_rows_are_checked_system_leaves_them_alone() {
    // Given: A row claimed just now
    let store = DuckDbStore::open_in_memory().expect("open");
    store.enqueue(KEY, retention_cutoff()).expect("enqueue");
    store.claim(KEY).expect("claim").expect("row");

    // When: The stuck threshold is three minutes
    let now = OffsetDateTime::now_utc();
    let report = store
        .reclassify_stuck(now - Duration::minutes(3), now + Duration::minutes(1))
        .expect("reclassify");

    // Then: Nothing changes
    assert_eq!(report.total(), 0);
    assert_eq!(store.count_by_status(WorkStatus::Processing).expect("count"), 1);
}

#[test]
fn when_process_restarts_system_still_sees_queued_work() {
    // Given: A file-backed store with queued work
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("cadastro.duckdb");
    {
        let store = DuckDbStore::open(StoreConfig::at_path(&path)).expect("open");
        store.enqueue(KEY, retention_cutoff()).expect("enqueue");
        store.enqueue(OTHER_KEY, retention_cutoff()).expect("enqueue");
        store.claim(OTHER_KEY).expect("claim").expect("row");
    }

    // When: The store is opened again
    let store = DuckDbStore::open(StoreConfig::at_path(&path)).expect("reopen");

    // Then: Queued and interrupted rows are both pending
    let pending = store.pending_items(OffsetDateTime::now_utc()).expect("pending");
    assert_eq!(pending.len(), 2);
    let requeued = store
        .requeue(&pending.iter().map(|item| item.id).collect::<Vec<_>>())
        .expect("requeue");
    assert_eq!(requeued, 1);
    assert_eq!(store.count_by_status(WorkStatus::Queued).expect("count"), 2);
}

// =============================================================================
// Store: Administrative Repairs
// =============================================================================

#[test]
fn when_errors_are_reset_system_queues_them_with_clean_state() {
    // Given: A failed row
    let store = DuckDbStore::open_in_memory().expect("open");
    store.enqueue(KEY, retention_cutoff()).expect("enqueue");
    let item = store.claim(KEY).expect("claim").expect("row");
    store
        .finish(
            item.id,
            &Outcome::Error {
                message: String::from("not found"),
            },
        )
        .expect("finish");

    // When: Error rows are reset
    let reset = store.reset_status(WorkStatus::Error).expect("reset");

    // Then: The row is Queued with no error details
    assert_eq!(reset, 1);
    let item = store.latest_item(KEY).expect("latest").expect("row");
    assert_eq!(item.status, WorkStatus::Queued);
    assert_eq!(item.error_message, None);
    assert_eq!(item.attempts, 0);
}

#[test]
fn when_failed_key_already_has_result_system_marks_it_completed() {
    // Given: A key that failed although a result was stored
    let store = DuckDbStore::open_in_memory().expect("open");
    store.enqueue(KEY, retention_cutoff()).expect("enqueue");
    let item = store.claim(KEY).expect("claim").expect("row");
    store
        .finish(
            item.id,
            &Outcome::Error {
                message: String::from("timed out after storing"),
            },
        )
        .expect("finish");
    store.insert_result(&acme_result(KEY, "receitaws")).expect("insert");

    // When: The repair runs as a dry run and then for real
    let preview = store.complete_resolved(true).expect("dry run");
    let unchanged = store.latest_item(KEY).expect("latest").expect("row");
    let fixed = store.complete_resolved(false).expect("fix");

    // Then: The dry run only reports; the real run completes the row
    assert_eq!(preview.len(), 1);
    assert_eq!(unchanged.status, WorkStatus::Error);
    assert_eq!(fixed.len(), 1);
    let item = store.latest_item(KEY).expect("latest").expect("row");
    assert_eq!(item.status, WorkStatus::Completed);
    assert_eq!(item.error_message, None);
}

// =============================================================================
// Store: Results
// =============================================================================

#[test]
fn when_result_is_updated_system_keeps_one_record_per_key() {
    // Given: A stored result
    let store = DuckDbStore::open_in_memory().expect("open");
    store.insert_result(&acme_result(KEY, "receitaws")).expect("insert");

    // When: A second provider resolves the same key
    let updated = store
        .update_result(&acme_result(KEY, "cnpjws"))
        .expect("update")
        .expect("existing record");

    // Then: The record is replaced in place and fields round-trip
    assert_eq!(updated.provider, "cnpjws");
    assert_eq!(updated.fields.company_name.as_deref(), Some("ACME LTDA"));
    assert_eq!(updated.raw_payload["cnpj"], KEY);
    let insert_again = store.insert_result(&acme_result(KEY, "cnpja_open"));
    assert!(matches!(insert_again, Err(StoreError::Conflict { .. })));
}

#[test]
fn when_updating_a_missing_result_system_reports_nothing_changed() {
    // Given: An empty store
    let store = DuckDbStore::open_in_memory().expect("open");

    // When: A result update is attempted
    let updated = store.update_result(&acme_result(KEY, "receitaws")).expect("update");

    // Then: Nothing is written
    assert!(updated.is_none());
    assert!(store.find_result(KEY).expect("find").is_none());
}
