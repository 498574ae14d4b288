//! Test harness with counting fakes for every external interface.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use resume_intake::config::{CoordinatorConfig, EligibilityConfig, ItemPipelineConfig, SearchConfig};
use resume_intake::coordinator::RunCoordinator;
use resume_intake::db::item_repo::{self, ItemRow};
use resume_intake::db::run_repo::{self, RunRow, RunStatus};
use resume_intake::db::{now_ts, Database};
use resume_intake::enrichment::{Enricher, EnrichmentError, EnrichmentQueue, EnrichmentRequest};
use resume_intake::error::{ExtractError, StorageError};
use resume_intake::extract::{Extracted, TextExtractor};
use resume_intake::pipeline::{ItemPipeline, ProgressEvent, ProgressReporter, RunScope};
use resume_intake::provider::{
    AttachmentMeta, EligibilityFilter, EmailProvider, Folder, MessageDetail, MessageFilter,
    MessageSummary, Page, ProviderError,
};
use resume_intake::search::{CancelFlag, SearchMode, SearchOrchestrator};
use resume_intake::storage::ObjectStorage;

/// Bytes starting with this marker extract as a scanned document.
pub const SCANNED_MARKER: &[u8] = b"%SCANNED";

struct StoredMessage {
    folder_id: String,
    summary: MessageSummary,
    attachments: Vec<(AttachmentMeta, Vec<u8>)>,
}

/// In-memory mailbox. Search returns every stored message and leaves
/// filtering to the orchestrator. Message listings are paged with
/// `offset:N` cursors once a page size is set.
#[derive(Default)]
pub struct FakeMailbox {
    folders: Mutex<Vec<(Option<String>, Folder)>>,
    messages: Mutex<Vec<StoredMessage>>,
    search_failures: Mutex<Vec<ProviderError>>,
    download_failures: Mutex<Vec<ProviderError>>,
    page_size: AtomicUsize,
    endless: AtomicBool,
    cancel_hook: Mutex<Option<(usize, CancelFlag)>>,
    pub pages_served: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub folder_listings: AtomicUsize,
    pub get_message_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
}

impl FakeMailbox {
    pub fn add_folder(&self, parent: Option<&str>, folder: Folder) {
        self.folders
            .lock()
            .unwrap()
            .push((parent.map(str::to_string), folder));
    }

    pub fn add_message(
        &self,
        folder_id: &str,
        mut summary: MessageSummary,
        attachments: Vec<(AttachmentMeta, Vec<u8>)>,
    ) {
        summary.has_attachments = !attachments.is_empty();
        summary.folder_id = Some(folder_id.to_string());
        self.messages.lock().unwrap().push(StoredMessage {
            folder_id: folder_id.to_string(),
            summary,
            attachments,
        });
    }

    /// The next search call fails with `error`.
    pub fn fail_next_search(&self, error: ProviderError) {
        self.search_failures.lock().unwrap().push(error);
    }

    /// The next attachment download fails with `error`.
    pub fn fail_next_download(&self, error: ProviderError) {
        self.download_failures.lock().unwrap().push(error);
    }

    /// Messages per page; zero serves everything in one page.
    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size, Ordering::SeqCst);
    }

    /// Every page carries a continuation cursor, even past the last message.
    pub fn set_endless_cursor(&self) {
        self.endless.store(true, Ordering::SeqCst);
    }

    /// Sets `flag` once `pages` message pages have been served.
    pub fn cancel_after_pages(&self, pages: usize, flag: CancelFlag) {
        *self.cancel_hook.lock().unwrap() = Some((pages, flag));
    }

    pub fn pages(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    fn paginate(&self, items: Vec<MessageSummary>, cursor: Option<&str>) -> Page<MessageSummary> {
        let served = self.pages_served.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, flag)) = self.cancel_hook.lock().unwrap().as_ref() {
            if served >= *after {
                flag.cancel();
            }
        }

        let offset = cursor
            .and_then(|c| c.strip_prefix("offset:"))
            .and_then(|o| o.parse::<usize>().ok())
            .unwrap_or(0);
        let size = match self.page_size.load(Ordering::SeqCst) {
            0 => usize::MAX,
            n => n,
        };
        let end = offset.saturating_add(size);
        let more = end < items.len() || self.endless.load(Ordering::SeqCst);
        Page {
            items: items.into_iter().skip(offset).take(size).collect(),
            next: more.then(|| format!("offset:{end}")),
        }
    }

    pub fn downloads(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn message_fetches(&self) -> usize {
        self.get_message_calls.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailProvider for FakeMailbox {
    async fn search_messages(
        &self,
        _mailbox: &str,
        _query: &str,
        _filter: Option<&MessageFilter>,
        cursor: Option<&str>,
    ) -> Result<Page<MessageSummary>, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.search_failures.lock().unwrap().pop() {
            return Err(error);
        }
        let items = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.summary.clone())
            .collect();
        Ok(self.paginate(items, cursor))
    }

    async fn list_folders(
        &self,
        _mailbox: &str,
        parent: Option<&str>,
    ) -> Result<Vec<Folder>, ProviderError> {
        self.folder_listings.fetch_add(1, Ordering::SeqCst);
        let folders = self.folders.lock().unwrap();
        Ok(folders
            .iter()
            .filter(|(p, _)| p.as_deref() == parent)
            .map(|(_, folder)| {
                let children = folders
                    .iter()
                    .filter(|(p, _)| p.as_deref() == Some(folder.id.as_str()))
                    .count();
                Folder {
                    child_folder_count: children as u32,
                    ..folder.clone()
                }
            })
            .collect())
    }

    async fn list_folder_messages(
        &self,
        _mailbox: &str,
        folder_id: &str,
        _filter: &MessageFilter,
        cursor: Option<&str>,
    ) -> Result<Page<MessageSummary>, ProviderError> {
        let mut items: Vec<MessageSummary> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.folder_id == folder_id)
            .map(|m| m.summary.clone())
            .collect();
        items.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(self.paginate(items, cursor))
    }

    async fn get_message(
        &self,
        _mailbox: &str,
        message_id: &str,
    ) -> Result<MessageDetail, ProviderError> {
        self.get_message_calls.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.summary.id == message_id)
            .map(|m| MessageDetail {
                summary: m.summary.clone(),
                attachments: m.attachments.iter().map(|(meta, _)| meta.clone()).collect(),
            })
            .ok_or_else(|| ProviderError::NotFound(message_id.to_string()))
    }

    async fn get_attachment_bytes(
        &self,
        _mailbox: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.download_failures.lock().unwrap().pop() {
            return Err(error);
        }
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.summary.id == message_id)
            .and_then(|m| m.attachments.iter().find(|(meta, _)| meta.id == attachment_id))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| ProviderError::NotFound(attachment_id.to_string()))
    }
}

/// Object store kept in a map. Re-putting an existing key is a success.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub put_calls: AtomicUsize,
}

impl MemoryStorage {
    pub fn puts(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert_with(|| bytes.to_vec());
        Ok(path.to_string())
    }
}

/// Treats attachment bytes as UTF-8 text, except for [`SCANNED_MARKER`].
#[derive(Default)]
pub struct StubExtractor {
    pub calls: AtomicUsize,
}

impl TextExtractor for StubExtractor {
    fn extract(
        &self,
        bytes: &[u8],
        _filename: &str,
        _mime: Option<&str>,
    ) -> Result<Extracted, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if bytes.starts_with(SCANNED_MARKER) {
            return Err(ExtractError::NoTextLayer("page is an image".to_string()));
        }
        Ok(Extracted::Text(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Succeeds unless a failure was scripted.
#[derive(Default)]
pub struct RecordingEnricher {
    failures: Mutex<Vec<EnrichmentError>>,
    pub requests: Mutex<Vec<EnrichmentRequest>>,
}

impl RecordingEnricher {
    pub fn fail_next(&self, error: EnrichmentError) {
        self.failures.lock().unwrap().push(error);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Enricher for RecordingEnricher {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<(), EnrichmentError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.failures.lock().unwrap().pop() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub const MAILBOX: &str = "careers@example.com";
pub const JOB_ID: &str = "job-42";

pub struct TestHarness {
    pub db: Database,
    pub mailbox: Arc<FakeMailbox>,
    pub storage: Arc<MemoryStorage>,
    pub extractor: Arc<StubExtractor>,
    pub progress: Arc<RecordingProgress>,
    pub queue: EnrichmentQueue,
    pub search: SearchConfig,
    pub eligibility: EligibilityConfig,
    pub pipeline: ItemPipelineConfig,
    pub coordinator: CoordinatorConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        let db = Database::open_in_memory().expect("Failed to create test database");
        Self {
            queue: EnrichmentQueue::new(db.clone()),
            db,
            mailbox: Arc::new(FakeMailbox::default()),
            storage: Arc::new(MemoryStorage::default()),
            extractor: Arc::new(StubExtractor::default()),
            progress: Arc::new(RecordingProgress::default()),
            search: SearchConfig::default(),
            eligibility: EligibilityConfig::default(),
            pipeline: ItemPipelineConfig {
                retry_delay_ms: 0,
                ..ItemPipelineConfig::default()
            },
            coordinator: CoordinatorConfig::default(),
        }
    }

    pub fn orchestrator(&self) -> SearchOrchestrator {
        SearchOrchestrator::new(self.mailbox.clone(), self.search.clone())
    }

    pub fn item_pipeline(&self) -> ItemPipeline {
        ItemPipeline::new(
            self.db.clone(),
            self.mailbox.clone(),
            self.storage.clone(),
            self.extractor.clone(),
            self.queue.clone(),
            EligibilityFilter::from_config(&self.eligibility),
            self.pipeline.clone(),
            self.progress.clone(),
        )
    }

    pub fn run_coordinator(&self) -> RunCoordinator {
        RunCoordinator::new(
            self.db.clone(),
            self.orchestrator(),
            self.item_pipeline(),
            self.coordinator.clone(),
            self.progress.clone(),
        )
    }

    /// Records a run row so items can reference it.
    pub fn new_run(&self, id: &str) -> RunScope {
        let now = now_ts();
        run_repo::insert(
            &self.db,
            &RunRow {
                id: id.to_string(),
                mailbox: MAILBOX.to_string(),
                job_id: JOB_ID.to_string(),
                search_text: Some("Engineer".to_string()),
                mode: SearchMode::GraphSearch,
                lookback_days: 30,
                status: RunStatus::Enqueued,
                attempts: 0,
                total_messages: 0,
                processed_messages: 0,
                last_error: None,
                enqueued_at: now.clone(),
                started_at: None,
                finished_at: None,
                updated_at: now,
            },
        )
        .expect("Failed to insert run");
        RunScope {
            run_id: id.to_string(),
            mailbox: MAILBOX.to_string(),
            job_id: JOB_ID.to_string(),
        }
    }

    /// A fresh, persisted item for `message_id` in the run.
    pub fn new_item(&self, scope: &RunScope, message_id: &str) -> ItemRow {
        let item = ItemRow::new(&scope.run_id, message_id, None, None, &now_ts());
        item_repo::upsert(&self.db, &item).expect("Failed to insert item")
    }

    pub fn reload(&self, item: &ItemRow) -> ItemRow {
        item_repo::find_by_id(&self.db, &item.id)
            .expect("Failed to load item")
            .expect("Item missing")
    }
}
