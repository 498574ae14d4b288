//! Item pipeline behaviour against counting fakes.

mod common;

use common::*;

use resume_intake::db::application_repo;
use resume_intake::db::enrichment_repo::{self, EnrichmentStatus};
use resume_intake::db::item_repo::{self, ItemStatus, ItemStep};
use resume_intake::db::now_ts;
use resume_intake::db::resume_repo;
use resume_intake::dedup::content_hash;
use resume_intake::extract::NO_TEXT_LAYER_SENTINEL;
use resume_intake::pipeline::{ItemOutcome, ProgressEvent};
use resume_intake::provider::ProviderError;
use resume_intake::sanitize::MAX_ERROR_LENGTH;
use resume_intake::storage::object_path;

const RESUME_TEXT: &[u8] = b"Jane Doe\nSenior Engineer\nRust, SQL";

fn seed_resume_message(h: &TestHarness, message_id: &str) {
    h.mailbox.add_folder(None, folder("inbox", "Inbox"));
    h.mailbox.add_message(
        "inbox",
        message(message_id, "Application: Senior Engineer", days_ago(1)),
        vec![file("att-1", "resume.pdf", RESUME_TEXT)],
    );
}

fn completed_resume_id(outcome: ItemOutcome) -> String {
    match outcome {
        ItemOutcome::Completed {
            resume_id: Some(id),
        } => id,
        other => panic!("expected completion with a resume, got {other:?}"),
    }
}

#[tokio::test]
async fn test_item_runs_every_step_to_persisted() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");

    let outcome = h.item_pipeline().process(&scope, item.clone()).await.unwrap();
    let resume_id = completed_resume_id(outcome);

    let item = h.reload(&item);
    assert_eq!(item.step, ItemStep::Persisted);
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.resume_id.as_deref(), Some(resume_id.as_str()));
    assert_eq!(item.attachment_name.as_deref(), Some("resume.pdf"));

    let hash = content_hash(RESUME_TEXT);
    let expected_path = object_path(JOB_ID, &hash, "resume.pdf");
    assert_eq!(item.storage_path.as_deref(), Some(expected_path.as_str()));
    assert_eq!(h.storage.get(&expected_path).as_deref(), Some(RESUME_TEXT));

    let resume = resume_repo::find_by_id(&h.db, &resume_id).unwrap().unwrap();
    assert_eq!(resume.content_hash, hash);
    assert_eq!(resume.source_message_id, "msg-1");
    assert_eq!(resume.raw_text.as_deref(), Some("Jane Doe\nSenior Engineer\nRust, SQL"));
    assert_eq!(application_repo::count_for_job(&h.db, JOB_ID).unwrap(), 1);

    let job = enrichment_repo::find_by_resume_and_job(&h.db, &resume_id, JOB_ID)
        .unwrap()
        .unwrap();
    assert_eq!(job.status, EnrichmentStatus::Pending);
    assert_eq!(job.run_id.as_deref(), Some("run-1"));
    assert_eq!(item.enrichment_status, Some(EnrichmentStatus::Pending));
}

#[tokio::test]
async fn test_single_invocation_fetches_message_and_bytes_once() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");

    h.item_pipeline().process(&scope, item).await.unwrap();

    assert_eq!(h.mailbox.message_fetches(), 1);
    assert_eq!(h.mailbox.downloads(), 1);
    assert_eq!(h.storage.puts(), 1);
}

#[tokio::test]
async fn test_progress_reports_each_committed_step() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");

    h.item_pipeline().process(&scope, item).await.unwrap();

    let steps: Vec<ItemStep> = h
        .progress
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::StepCommitted { step, .. } => Some(step),
            _ => None,
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            ItemStep::Fetched,
            ItemStep::Saved,
            ItemStep::Uploaded,
            ItemStep::Parsed,
            ItemStep::Persisted,
        ]
    );
}

#[tokio::test]
async fn test_replaying_a_message_yields_one_resume_and_one_link() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    let pipeline = h.item_pipeline();

    let first_scope = h.new_run("run-1");
    let first = pipeline
        .process(&first_scope, h.new_item(&first_scope, "msg-1"))
        .await
        .unwrap();

    let second_scope = h.new_run("run-2");
    let second = pipeline
        .process(&second_scope, h.new_item(&second_scope, "msg-1"))
        .await
        .unwrap();

    assert_eq!(completed_resume_id(first), completed_resume_id(second));
    assert_eq!(resume_repo::count_by_hash(&h.db, &content_hash(RESUME_TEXT)).unwrap(), 1);
    assert_eq!(application_repo::count_for_job(&h.db, JOB_ID).unwrap(), 1);
    // The replay is completed against the existing resume at `saved`.
    assert_eq!(h.storage.puts(), 1);
    assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completed_item_is_skipped() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");
    let pipeline = h.item_pipeline();

    pipeline.process(&scope, item.clone()).await.unwrap();
    let again = pipeline.process(&scope, h.reload(&item)).await.unwrap();

    assert_eq!(again, ItemOutcome::Skipped);
    assert_eq!(h.mailbox.message_fetches(), 1);
}

#[tokio::test]
async fn test_same_bytes_in_two_messages_make_two_resumes() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    h.mailbox.add_message(
        "inbox",
        message("msg-2", "Fwd: Senior Engineer", days_ago(1)),
        vec![file("att-9", "resume.pdf", RESUME_TEXT)],
    );
    let scope = h.new_run("run-1");
    let pipeline = h.item_pipeline();

    let a = pipeline.process(&scope, h.new_item(&scope, "msg-1")).await.unwrap();
    let b = pipeline.process(&scope, h.new_item(&scope, "msg-2")).await.unwrap();

    assert_ne!(completed_resume_id(a), completed_resume_id(b));
    assert_eq!(resume_repo::count_by_hash(&h.db, &content_hash(RESUME_TEXT)).unwrap(), 2);
    assert_eq!(application_repo::count_for_job(&h.db, JOB_ID).unwrap(), 2);
}

#[tokio::test]
async fn test_executable_is_ignored_next_to_a_pdf() {
    let h = TestHarness::new();
    h.mailbox.add_message(
        "inbox",
        message("msg-1", "Engineer application", days_ago(1)),
        vec![
            file("att-exe", "resume.exe", b"MZ\x90\x00"),
            file("att-pdf", "resume.pdf", RESUME_TEXT),
        ],
    );
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");

    let resume_id = completed_resume_id(h.item_pipeline().process(&scope, item.clone()).await.unwrap());

    let item = h.reload(&item);
    assert_eq!(item.attachment_id.as_deref(), Some("att-pdf"));
    let resume = resume_repo::find_by_id(&h.db, &resume_id).unwrap().unwrap();
    assert_eq!(resume.filename, "resume.pdf");
    assert_eq!(h.storage.len(), 1);
}

#[tokio::test]
async fn test_no_eligible_attachment_completes_without_resume() {
    let h = TestHarness::new();
    h.mailbox.add_message(
        "inbox",
        message("msg-1", "Engineer application", days_ago(1)),
        vec![file("att-exe", "resume.exe", b"MZ\x90\x00")],
    );
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");

    let outcome = h.item_pipeline().process(&scope, item.clone()).await.unwrap();

    assert_eq!(outcome, ItemOutcome::Completed { resume_id: None });
    let item = h.reload(&item);
    assert_eq!(item.step, ItemStep::Persisted);
    assert_eq!(item.status, ItemStatus::Completed);
    assert!(item.resume_id.is_none());
    assert_eq!(h.mailbox.downloads(), 0);
    assert_eq!(h.storage.puts(), 0);
}

#[tokio::test]
async fn test_oversized_attachment_is_not_downloaded() {
    let mut h = TestHarness::new();
    h.eligibility.max_attachment_bytes = 10 * 1024 * 1024;
    h.mailbox.add_message(
        "inbox",
        message("msg-1", "Engineer application", days_ago(1)),
        vec![(attachment("att-1", "resume.pdf", 11 * 1024 * 1024), Vec::new())],
    );
    let scope = h.new_run("run-1");

    let outcome = h
        .item_pipeline()
        .process(&scope, h.new_item(&scope, "msg-1"))
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::Completed { resume_id: None });
    assert_eq!(h.mailbox.downloads(), 0);
}

#[tokio::test]
async fn test_restart_after_upload_does_not_upload_again() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    let scope = h.new_run("run-1");

    // State left behind by a process that died right after `uploaded`.
    let hash = content_hash(RESUME_TEXT);
    let mut item = h.new_item(&scope, "msg-1");
    item.step = ItemStep::Uploaded;
    item.attachment_id = Some("att-1".to_string());
    item.attachment_name = Some("resume.pdf".to_string());
    item.content_type = Some("application/pdf".to_string());
    item.content_hash = Some(hash.clone());
    item.storage_path = Some(object_path(JOB_ID, &hash, "resume.pdf"));
    item_repo::commit_step(&h.db, &item, &now_ts()).unwrap();

    let outcome = h.item_pipeline().process(&scope, h.reload(&item)).await.unwrap();

    completed_resume_id(outcome);
    assert_eq!(h.storage.puts(), 0);
    assert_eq!(h.mailbox.message_fetches(), 0);
    assert_eq!(h.reload(&item).step, ItemStep::Persisted);
}

#[tokio::test]
async fn test_transient_failure_keeps_committed_step() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    h.mailbox
        .fail_next_download(ProviderError::Http("connection reset".to_string()));
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");
    let pipeline = h.item_pipeline();

    let outcome = pipeline.process(&scope, item.clone()).await.unwrap();
    assert!(matches!(outcome, ItemOutcome::Failed { poisoned: false, .. }));

    let failed = h.reload(&item);
    assert_eq!(failed.status, ItemStatus::Failed);
    assert_eq!(failed.step, ItemStep::Fetched);
    assert_eq!(failed.attempts, 1);
    assert!(failed.last_error.unwrap().contains("connection reset"));

    let retried = pipeline.process(&scope, h.reload(&item)).await.unwrap();
    completed_resume_id(retried);
    // The retry resumed at `fetched` and did not fetch the message again.
    assert_eq!(h.mailbox.message_fetches(), 1);
    assert_eq!(h.reload(&item).attempts, 1);
}

#[tokio::test]
async fn test_item_out_of_attempts_is_skipped() {
    let mut h = TestHarness::new();
    h.pipeline.max_item_attempts = 1;
    seed_resume_message(&h, "msg-1");
    h.mailbox
        .fail_next_download(ProviderError::Http("connection reset".to_string()));
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");
    let pipeline = h.item_pipeline();

    pipeline.process(&scope, item.clone()).await.unwrap();
    let again = pipeline.process(&scope, h.reload(&item)).await.unwrap();

    assert_eq!(again, ItemOutcome::Skipped);
    assert_eq!(h.mailbox.downloads(), 1);
}

#[tokio::test]
async fn test_persisted_error_is_truncated() {
    let h = TestHarness::new();
    seed_resume_message(&h, "msg-1");
    h.mailbox.fail_next_download(ProviderError::Http("x".repeat(5000)));
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");

    h.item_pipeline().process(&scope, item.clone()).await.unwrap();

    let error = h.reload(&item).last_error.unwrap();
    assert!(error.len() <= MAX_ERROR_LENGTH);
}

#[tokio::test]
async fn test_scanned_document_poisons_item() {
    let h = TestHarness::new();
    let mut scanned = SCANNED_MARKER.to_vec();
    scanned.extend_from_slice(b" image data");
    h.mailbox.add_message(
        "inbox",
        message("msg-1", "Engineer application", days_ago(1)),
        vec![file("att-1", "scan.pdf", &scanned)],
    );
    let scope = h.new_run("run-1");
    let item = h.new_item(&scope, "msg-1");
    let pipeline = h.item_pipeline();

    let outcome = pipeline.process(&scope, item.clone()).await.unwrap();
    assert!(matches!(outcome, ItemOutcome::Failed { poisoned: true, .. }));

    let poisoned = h.reload(&item);
    assert_eq!(poisoned.step, ItemStep::FailedExtract);
    assert_eq!(poisoned.status, ItemStatus::Failed);
    assert_eq!(poisoned.attempts, h.pipeline.max_item_attempts);
    let resume_id = poisoned.resume_id.clone().unwrap();
    let resume = resume_repo::find_by_id(&h.db, &resume_id).unwrap().unwrap();
    assert_eq!(resume.raw_text.as_deref(), Some(NO_TEXT_LAYER_SENTINEL));
    assert_eq!(application_repo::count_for_job(&h.db, JOB_ID).unwrap(), 0);

    assert_eq!(
        pipeline.process(&scope, poisoned).await.unwrap(),
        ItemOutcome::Skipped
    );
    assert!(h.progress.events().iter().any(|event| matches!(
        event,
        ProgressEvent::ItemFailed { poisoned: true, .. }
    )));
}
