//! Resumable per-message state machine.
//!
//! Each call to [`ItemPipeline::process`] advances an item from its last
//! committed step. A transition returns the next step and the side effects
//! it performed; the step and its artifacts are written in one statement
//! before the next transition starts.

use std::sync::Arc;

use tracing::Instrument;

use crate::config::ItemPipelineConfig;
use crate::db::application_repo::{self, LinkOutcome};
use crate::db::enrichment_repo::EnqueueOutcome;
use crate::db::item_repo::{self, ItemRow, ItemStatus, ItemStep};
use crate::db::resume_repo::{self, ResumeRow};
use crate::db::{now_ts, Database, DatabaseError};
use crate::dedup;
use crate::enrichment::EnrichmentQueue;
use crate::extract::{Extracted, TextExtractor, NO_TEXT_LAYER_SENTINEL, UNSUPPORTED_SENTINEL};
use crate::error::ExtractError;
use crate::provider::eligibility::EligibilityFilter;
use crate::provider::EmailProvider;
use crate::sanitize::{redact_subject, truncate_error};
use crate::storage::{object_path, ObjectStorage};

use super::context::{ItemContext, RunScope};
use super::error::PipelineError;
use super::progress::{ProgressEvent, ProgressReporter};

/// Work done by a transition beyond moving the step.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    NoEligibleAttachment,
    AttachmentSelected { name: String },
    Downloaded { bytes: usize },
    ResumeReused { resume_id: String },
    Uploaded { storage_path: String },
    ResumeCreated { resume_id: String },
    TextStored { sentinel: Option<&'static str> },
    Enrichment(EnqueueOutcome),
    Linked(LinkOutcome),
}

#[derive(Debug)]
pub struct Transition {
    pub next: ItemStep,
    pub effects: Vec<SideEffect>,
}

impl Transition {
    fn to(next: ItemStep) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(mut self, effect: SideEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The item reached `persisted`. No resume means no eligible attachment.
    Completed { resume_id: Option<String> },
    /// Already completed, poisoned, or out of attempts.
    Skipped,
    Failed {
        error: String,
        poisoned: bool,
        retryable: bool,
    },
}

impl ItemOutcome {
    /// A failure the run should attempt again while attempts remain.
    pub fn is_retryable_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::Failed {
                poisoned: false,
                retryable: true,
                ..
            }
        )
    }
}

pub struct ItemPipeline {
    db: Database,
    provider: Arc<dyn EmailProvider>,
    storage: Arc<dyn ObjectStorage>,
    extractor: Arc<dyn TextExtractor>,
    enrichment: EnrichmentQueue,
    eligibility: EligibilityFilter,
    config: ItemPipelineConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl ItemPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        provider: Arc<dyn EmailProvider>,
        storage: Arc<dyn ObjectStorage>,
        extractor: Arc<dyn TextExtractor>,
        enrichment: EnrichmentQueue,
        eligibility: EligibilityFilter,
        config: ItemPipelineConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            db,
            provider,
            storage,
            extractor,
            enrichment,
            eligibility,
            config,
            progress,
        }
    }

    pub fn config(&self) -> &ItemPipelineConfig {
        &self.config
    }

    /// Whether a run should hand this item to [`process`](Self::process).
    pub fn should_process(&self, item: &ItemRow) -> bool {
        item.status != ItemStatus::Completed
            && !item.step.is_terminal()
            && item.attempts < self.config.max_item_attempts
    }

    /// Advances `item` until it is persisted or a step fails.
    ///
    /// Step failures are recorded on the item and returned as
    /// [`ItemOutcome::Failed`]; only database errors while recording them
    /// are returned as `Err`.
    pub async fn process(
        &self,
        scope: &RunScope,
        item: ItemRow,
    ) -> Result<ItemOutcome, DatabaseError> {
        let span = tracing::info_span!(
            "item",
            run_id = %scope.run_id,
            item_id = %item.id,
            message_id = %item.external_message_id,
            subject = %redact_subject(item.subject.as_deref().unwrap_or_default()),
        );
        self.process_inner(scope, item).instrument(span).await
    }

    async fn process_inner(
        &self,
        scope: &RunScope,
        item: ItemRow,
    ) -> Result<ItemOutcome, DatabaseError> {
        if !self.should_process(&item) {
            tracing::debug!(step = %item.step, attempts = item.attempts, "Skipping item");
            return Ok(ItemOutcome::Skipped);
        }

        let mut ctx = ItemContext::new(item);
        while !ctx.step().is_terminal() {
            let from = ctx.step();
            match self.advance(scope, &mut ctx).await {
                Ok(transition) => {
                    ctx.item.step = transition.next;
                    ctx.item.status = if transition.next == ItemStep::Persisted {
                        ItemStatus::Completed
                    } else {
                        ItemStatus::Pending
                    };
                    item_repo::commit_step(&self.db, &ctx.item, &now_ts())?;
                    tracing::debug!(
                        from = %from,
                        to = %transition.next,
                        effects = ?transition.effects,
                        "Step committed"
                    );
                    self.progress.report(ProgressEvent::StepCommitted {
                        run_id: scope.run_id.clone(),
                        item_id: ctx.item.id.clone(),
                        step: transition.next,
                    });
                }
                Err(e) => return self.fail(scope, &ctx.item, from, e),
            }
        }

        if let Some(resume_id) = ctx.item.resume_id.as_deref() {
            self.enrichment.mirror(resume_id, &scope.job_id)?;
        }
        Ok(ItemOutcome::Completed {
            resume_id: ctx.item.resume_id,
        })
    }

    fn fail(
        &self,
        scope: &RunScope,
        item: &ItemRow,
        step: ItemStep,
        error: PipelineError,
    ) -> Result<ItemOutcome, DatabaseError> {
        let message = truncate_error(&error.to_string());
        let poisoned = error.is_poison();
        let retryable = error.is_retryable();
        if poisoned {
            item_repo::mark_poisoned(
                &self.db,
                &item.id,
                &message,
                self.config.max_item_attempts,
                &now_ts(),
            )?;
            tracing::warn!(step = %step, error = %message, "Item poisoned");
        } else {
            item_repo::record_failure(&self.db, &item.id, &message, &now_ts())?;
            tracing::warn!(
                step = %step,
                error = %message,
                retryable,
                "Item step failed"
            );
        }
        self.progress.report(ProgressEvent::ItemFailed {
            run_id: scope.run_id.clone(),
            item_id: item.id.clone(),
            error: message.clone(),
            poisoned,
        });
        Ok(ItemOutcome::Failed {
            error: message,
            poisoned,
            retryable,
        })
    }

    async fn advance(
        &self,
        scope: &RunScope,
        ctx: &mut ItemContext,
    ) -> Result<Transition, PipelineError> {
        match ctx.step() {
            ItemStep::None => self.fetch(scope, ctx).await,
            ItemStep::Fetched => self.save(scope, ctx).await,
            ItemStep::Saved => self.upload(scope, ctx).await,
            ItemStep::Uploaded => self.parse(scope, ctx).await,
            ItemStep::Parsed => self.persist(scope, ctx),
            // Terminal steps never reach here.
            ItemStep::Persisted | ItemStep::FailedExtract => Ok(Transition::to(ctx.step())),
        }
    }

    /// none → fetched: pick the first eligible attachment.
    async fn fetch(
        &self,
        scope: &RunScope,
        ctx: &mut ItemContext,
    ) -> Result<Transition, PipelineError> {
        let chosen = {
            let message = ctx.message(self.provider.as_ref(), &scope.mailbox).await?;
            self.eligibility
                .eligible(&message.attachments)
                .first()
                .map(|a| (*a).clone())
        };

        match chosen {
            Some(attachment) => {
                ctx.select_attachment(&attachment);
                Ok(Transition::to(ItemStep::Fetched).with(SideEffect::AttachmentSelected {
                    name: attachment.name,
                }))
            }
            None => Ok(Transition::to(ItemStep::Persisted).with(SideEffect::NoEligibleAttachment)),
        }
    }

    /// fetched → saved: download and hash. An exact (hash, message) match
    /// completes the item against the existing resume.
    async fn save(
        &self,
        scope: &RunScope,
        ctx: &mut ItemContext,
    ) -> Result<Transition, PipelineError> {
        let (hash, size) = {
            let bytes = ctx.bytes(self.provider.as_ref(), &scope.mailbox).await?;
            (dedup::content_hash(bytes), bytes.len())
        };
        ctx.item.content_hash = Some(hash.clone());
        let downloaded = SideEffect::Downloaded { bytes: size };

        let Some(existing) = dedup::find_existing(&self.db, &hash, &ctx.item.external_message_id)?
        else {
            return Ok(Transition::to(ItemStep::Saved).with(downloaded));
        };

        if existing.raw_text.as_deref() == Some(NO_TEXT_LAYER_SENTINEL) {
            ctx.item.resume_id = Some(existing.id.clone());
            item_repo::commit_step(&self.db, &ctx.item, &now_ts())?;
            return Err(PipelineError::NoTextLayer(format!(
                "resume {} has no text layer",
                existing.id
            )));
        }

        tracing::info!(resume_id = %existing.id, "Reusing existing resume");
        ctx.item.resume_id = Some(existing.id.clone());
        ctx.item.storage_path = Some(existing.storage_path.clone());
        let mut transition = Transition::to(ItemStep::Persisted)
            .with(downloaded)
            .with(SideEffect::ResumeReused {
                resume_id: existing.id.clone(),
            });
        transition.effects.extend(self.finalize(scope, &existing.id)?);
        Ok(transition)
    }

    /// saved → uploaded.
    async fn upload(
        &self,
        scope: &RunScope,
        ctx: &mut ItemContext,
    ) -> Result<Transition, PipelineError> {
        let hash = ctx.require(ctx.item.content_hash.clone(), "content_hash")?;
        let name = ctx.require(ctx.item.attachment_name.clone(), "attachment_name")?;
        let content_type = ctx.item.content_type.clone();
        let path = object_path(&scope.job_id, &hash, &name);

        let bytes = ctx.bytes(self.provider.as_ref(), &scope.mailbox).await?;
        let stored = self
            .storage
            .put(&path, bytes, content_type.as_deref())
            .await?;
        ctx.item.storage_path = Some(stored.clone());

        Ok(Transition::to(ItemStep::Uploaded).with(SideEffect::Uploaded {
            storage_path: stored,
        }))
    }

    /// uploaded → parsed: create the resume and extract its text once.
    async fn parse(
        &self,
        scope: &RunScope,
        ctx: &mut ItemContext,
    ) -> Result<Transition, PipelineError> {
        let now = now_ts();
        let candidate = ResumeRow {
            id: uuid::Uuid::new_v4().to_string(),
            content_hash: ctx.require(ctx.item.content_hash.clone(), "content_hash")?,
            source_message_id: ctx.item.external_message_id.clone(),
            filename: ctx.require(ctx.item.attachment_name.clone(), "attachment_name")?,
            content_type: ctx.item.content_type.clone(),
            storage_path: ctx.require(ctx.item.storage_path.clone(), "storage_path")?,
            raw_text: None,
            parsed_at: None,
            created_at: now.clone(),
        };
        let (resume, created) = resume_repo::get_or_create(&self.db, &candidate)?;
        ctx.item.resume_id = Some(resume.id.clone());

        let mut transition = Transition::to(ItemStep::Parsed);
        transition.effects.push(if created {
            SideEffect::ResumeCreated {
                resume_id: resume.id.clone(),
            }
        } else {
            SideEffect::ResumeReused {
                resume_id: resume.id.clone(),
            }
        });

        match resume.raw_text.as_deref() {
            Some(NO_TEXT_LAYER_SENTINEL) => {
                item_repo::commit_step(&self.db, &ctx.item, &now)?;
                return Err(PipelineError::NoTextLayer(format!(
                    "resume {} has no text layer",
                    resume.id
                )));
            }
            Some(_) => return Ok(transition),
            None => {}
        }

        let bytes = ctx
            .bytes(self.provider.as_ref(), &scope.mailbox)
            .await?
            .to_vec();
        let extractor = Arc::clone(&self.extractor);
        let filename = resume.filename.clone();
        let mime = resume.content_type.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extractor.extract(&bytes, &filename, mime.as_deref())
        })
        .await
        .map_err(|e| PipelineError::Extractor(e.to_string()))?;

        let (text, sentinel) = match extracted {
            Ok(Extracted::Text(text)) => (text, None),
            Ok(Extracted::Unsupported(kind)) => {
                tracing::info!(kind = %kind, "Unsupported document format");
                (UNSUPPORTED_SENTINEL.to_string(), Some(UNSUPPORTED_SENTINEL))
            }
            Err(ExtractError::NoTextLayer(reason)) => {
                resume_repo::set_text(&self.db, &resume.id, NO_TEXT_LAYER_SENTINEL, &now)?;
                item_repo::commit_step(&self.db, &ctx.item, &now)?;
                return Err(PipelineError::NoTextLayer(reason));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Text extraction failed");
                (UNSUPPORTED_SENTINEL.to_string(), Some(UNSUPPORTED_SENTINEL))
            }
        };
        resume_repo::set_text(&self.db, &resume.id, &text, &now)?;
        Ok(transition.with(SideEffect::TextStored { sentinel }))
    }

    /// parsed → persisted.
    fn persist(&self, scope: &RunScope, ctx: &mut ItemContext) -> Result<Transition, PipelineError> {
        let resume_id = ctx.require(ctx.item.resume_id.clone(), "resume_id")?;
        let mut transition = Transition::to(ItemStep::Persisted);
        transition.effects.extend(self.finalize(scope, &resume_id)?);
        Ok(transition)
    }

    /// Enqueues enrichment and links the resume to the job. Both are
    /// idempotent.
    fn finalize(&self, scope: &RunScope, resume_id: &str) -> Result<Vec<SideEffect>, PipelineError> {
        let enqueued = self
            .enrichment
            .enqueue(resume_id, &scope.job_id, Some(&scope.run_id))?;
        let linked = application_repo::link(&self.db, &scope.job_id, resume_id, &now_ts())?;
        Ok(vec![SideEffect::Enrichment(enqueued), SideEffect::Linked(linked)])
    }
}
