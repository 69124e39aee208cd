use super::*;

fn analysis() -> JobKey {
    JobKey::analysis("000042", "England2")
}

fn ledger_error(err: &anyhow::Error) -> Option<&LedgerError> {
    err.downcast_ref::<LedgerError>()
}

#[tokio::test]
async fn missing_row_is_new() {
    let ledger = test_ledger();
    assert_eq!(ledger.state(&analysis()).await.unwrap(), JobState::New);
    assert!(ledger.record(&analysis()).await.unwrap().is_none());
}

#[tokio::test]
async fn fresh_row_is_recent() {
    let ledger = test_ledger();
    ledger.create(&analysis()).await.unwrap();
    assert_eq!(ledger.state(&analysis()).await.unwrap(), JobState::Recent);
}

#[tokio::test]
async fn age_decides_between_recent_and_stale() {
    let ledger = test_ledger();
    let key = JobKey::stitching("S01000042");
    ledger.create(&key).await.unwrap();

    ledger.backdate(&key, 29).await;
    assert_eq!(ledger.state(&key).await.unwrap(), JobState::Recent);
    ledger.backdate(&key, 31).await;
    assert_eq!(ledger.state(&key).await.unwrap(), JobState::Stale);
    ledger.backdate(&key, 45).await;
    assert_eq!(ledger.state(&key).await.unwrap(), JobState::Stale);
}

#[tokio::test]
async fn finished_wins_over_age() {
    let ledger = test_ledger();
    ledger.create(&analysis()).await.unwrap();
    ledger.backdate(&analysis(), 45).await;
    assert!(ledger.mark_finished(&analysis()).await.unwrap());
    assert_eq!(ledger.state(&analysis()).await.unwrap(), JobState::Finished);
}

#[tokio::test]
async fn create_twice_keeps_one_row_and_refreshes_it() {
    let ledger = test_ledger();
    ledger.create(&analysis()).await.unwrap();
    ledger.backdate(&analysis(), 45).await;
    ledger.create(&analysis()).await.unwrap();

    assert_eq!(ledger.analysis_records().await.unwrap().len(), 1);
    assert_eq!(ledger.state(&analysis()).await.unwrap(), JobState::Recent);
}

#[tokio::test]
async fn create_never_reopens_a_finished_row() {
    let ledger = test_ledger();
    ledger.create(&analysis()).await.unwrap();
    ledger.mark_finished(&analysis()).await.unwrap();
    ledger.create(&analysis()).await.unwrap();
    assert_eq!(ledger.state(&analysis()).await.unwrap(), JobState::Finished);
}

#[tokio::test]
async fn resubmit_makes_a_stale_row_recent() {
    let ledger = test_ledger();
    ledger.create(&analysis()).await.unwrap();
    ledger.backdate(&analysis(), 45).await;
    ledger.resubmit(&analysis()).await.unwrap();
    assert_eq!(ledger.state(&analysis()).await.unwrap(), JobState::Recent);
}

#[tokio::test]
async fn resubmit_requires_an_unfinished_row() {
    let ledger = test_ledger();
    let err = ledger.resubmit(&analysis()).await.unwrap_err();
    assert_eq!(
        ledger_error(&err),
        Some(&LedgerError::MissingRecord(analysis()))
    );

    ledger.create(&analysis()).await.unwrap();
    ledger.mark_finished(&analysis()).await.unwrap();
    let err = ledger.resubmit(&analysis()).await.unwrap_err();
    assert_eq!(
        ledger_error(&err),
        Some(&LedgerError::AlreadyFinished(analysis()))
    );
}

#[tokio::test]
async fn mark_finished_without_row_is_missing_record() {
    let ledger = test_ledger();
    let key = JobKey::titration("000042", "England2");
    let err = ledger.mark_finished(&key).await.unwrap_err();
    assert_eq!(ledger_error(&err), Some(&LedgerError::MissingRecord(key)));
}

#[tokio::test]
async fn mark_finished_twice_keeps_first_timestamp() {
    let ledger = test_ledger();
    ledger.create(&analysis()).await.unwrap();
    assert!(ledger.mark_finished(&analysis()).await.unwrap());
    let first = ledger.record(&analysis()).await.unwrap().unwrap().finished_at;
    assert!(!ledger.mark_finished(&analysis()).await.unwrap());
    let second = ledger.record(&analysis()).await.unwrap().unwrap().finished_at;
    assert_eq!(first, second);
}

#[tokio::test]
async fn tables_are_independent() {
    let ledger = test_ledger();
    ledger.create(&analysis()).await.unwrap();
    let titration = JobKey::titration("000042", "England2");
    assert_eq!(ledger.state(&titration).await.unwrap(), JobState::New);
    assert!(ledger.stitching_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_timestamp_is_reported() {
    let ledger = test_ledger();
    let key = JobKey::stitching("S01000042");
    ledger.create(&key).await.unwrap();
    ledger.overwrite_created_at(&key, "yesterday-ish").await;
    let err = ledger.state(&key).await.unwrap_err();
    assert!(matches!(
        ledger_error(&err),
        Some(LedgerError::CorruptRecord { value, .. }) if value == "yesterday-ish"
    ));
}

#[tokio::test]
async fn list_helpers_return_ages() {
    let ledger = test_ledger();
    let key = JobKey::stitching("S01000042");
    ledger.create(&key).await.unwrap();
    ledger.backdate(&key, 90).await;
    let rows = ledger.stitching_records().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, key);
    assert!(rows[0].age_secs >= 90 * 60);
    assert!(rows[0].finished_at.is_none());
}
