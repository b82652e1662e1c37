//! Acquisition orchestrator
//!
//! Drives one source fetcher through the download state machine:
//!
//! ```text
//! IDLE -> FETCHING -> { PAGE_COMPLETE -> FETCHING (loop)
//!                     | RATE_LIMITED  -> RETRYING -> FETCHING
//!                     | SOURCE_ERROR  -> RETRYING -> FETCHING
//!                     | DRAINED       -> COMPLETED }
//! ```
//!
//! Rate limits cool down and retry until the per-source daily ceiling,
//! then FAIL for the rest of the UTC day; transient network errors retry
//! after a short fixed delay with bounded attempts; permanent source
//! errors FAIL immediately. Every transition that changes status or
//! cursor is persisted to the state store before the next fetch begins,
//! so a crash at any point resumes from the last committed page.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::fetch::SourceFetcher;
use crate::models::{DownloadStatus, ErrorKind, NormalizedRecord, RunSummary};
use crate::normalize::RecordValidator;
use crate::rate_limit::SourceRateLimiter;
use crate::state::{DownloadState, StateStore};

/// Result of one orchestrated run: the summary plus the normalized
/// records buffered for consolidation
#[derive(Debug)]
pub struct RunOutput {
    pub summary: RunSummary,
    pub records: Vec<NormalizedRecord>,
}

enum SleepOutcome {
    Completed,
    Cancelled,
    DeadlineExceeded,
}

/// Generic, resumable acquisition driver for one source
pub struct AcquisitionOrchestrator {
    config: SourceConfig,
    run_deadline: Duration,
    state_store: Arc<dyn StateStore>,
    limiter: SourceRateLimiter,
}

impl AcquisitionOrchestrator {
    pub fn new(
        config: SourceConfig,
        run_deadline: Duration,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        let limiter = SourceRateLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_window(),
        );
        Self {
            config,
            run_deadline,
            state_store,
            limiter,
        }
    }

    /// Run acquisition for this source until drained, failed, cancelled,
    /// or past the deadline
    ///
    /// Resume is idempotent: a source already COMPLETED fetches nothing
    /// unless `force_fresh` discards its progress first.
    pub async fn run(
        &self,
        fetcher: &dyn SourceFetcher,
        validator: &dyn RecordValidator,
        force_fresh: bool,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let started = Instant::now();
        let deadline = started + self.run_deadline;
        let run_id = Uuid::new_v4();
        let source_id = &self.config.source_id;

        info!(source_id = %source_id, run_id = %run_id, "Starting acquisition run");

        let mut state = self
            .state_store
            .load(source_id)
            .await
            .with_context(|| format!("Failed to load download state for {}", source_id))?
            .unwrap_or_else(|| DownloadState::new(source_id));

        if force_fresh {
            info!(source_id = %source_id, "Force-fresh run, discarding previous progress");
            state.reset_progress();
        }
        state.roll_daily_window(chrono::Utc::now().date_naive());

        let mut items_fetched: u64 = 0;
        let mut items_valid: u64 = 0;
        let mut items_rejected: u64 = 0;
        let mut records: Vec<NormalizedRecord> = Vec::new();

        if state.status == DownloadStatus::Completed {
            info!(source_id = %source_id, "Source already completed, nothing to fetch");
            return Ok(RunOutput {
                summary: self.summary(run_id, &state, 0, 0, 0, started),
                records,
            });
        }

        if state.status == DownloadStatus::Failed
            && state.last_error_kind == Some(ErrorKind::PermanentSource)
        {
            warn!(
                source_id = %source_id,
                "Source failed permanently, operator reset required"
            );
            return Ok(RunOutput {
                summary: self.summary(run_id, &state, 0, 0, 0, started),
                records,
            });
        }

        loop {
            if cancel.is_cancelled() {
                self.fail(&mut state, ErrorKind::Cancelled).await?;
                break;
            }

            // Daily ceiling: refuse locally, no network call
            if state.daily_retry_count >= self.config.max_daily_retries {
                warn!(
                    source_id = %source_id,
                    daily_retry_count = state.daily_retry_count,
                    "Daily retry ceiling reached, refusing further attempts today"
                );
                if state.status != DownloadStatus::Failed {
                    self.transition(&mut state, DownloadStatus::Failed).await?;
                }
                break;
            }

            // Honor a cool-down carried over from a previous attempt
            if let Some(next_allowed) = state.next_allowed_attempt {
                let now = chrono::Utc::now();
                if next_allowed > now {
                    let wait = (next_allowed - now).to_std().unwrap_or_default();
                    match self.interruptible_sleep(wait, cancel, deadline).await {
                        SleepOutcome::Completed => {
                            state.next_allowed_attempt = None;
                            self.transition(&mut state, DownloadStatus::Retrying).await?;
                        },
                        SleepOutcome::Cancelled => {
                            self.fail(&mut state, ErrorKind::Cancelled).await?;
                            break;
                        },
                        SleepOutcome::DeadlineExceeded => {
                            info!(source_id = %source_id, "Run deadline reached during cool-down");
                            break;
                        },
                    }
                } else {
                    state.next_allowed_attempt = None;
                }
            }

            // Never start a new page past the deadline
            if Instant::now() >= deadline {
                info!(source_id = %source_id, "Run deadline reached, exiting resumably");
                break;
            }

            // Persist FETCHING before the network call so a crash leaves
            // the committed cursor intact
            self.transition(&mut state, DownloadStatus::Fetching).await?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.fail(&mut state, ErrorKind::Cancelled).await?;
                    break;
                },
                _ = self.limiter.acquire() => {},
            }

            match fetcher.fetch_page(state.cursor.as_deref()).await {
                Ok(page) => {
                    items_fetched += page.records.len() as u64;

                    let mut page_valid: u64 = 0;
                    for raw in &page.records {
                        match validator.normalize(raw) {
                            Ok(record) => {
                                records.push(record);
                                page_valid += 1;
                            },
                            Err(e) => {
                                warn!(
                                    source_id = %source_id,
                                    error = %e,
                                    "Record rejected during normalization"
                                );
                                items_rejected += 1;
                            },
                        }
                    }
                    items_valid += page_valid;

                    state.completed_count += page_valid;
                    state.cursor = page.next_cursor.clone();
                    state.retry_count = 0;
                    state.last_error_kind = None;

                    if page.next_cursor.is_none() {
                        self.transition(&mut state, DownloadStatus::Draining).await?;
                        // All fetched pages are normalized inline, so the
                        // drain is confirmed as soon as the last page is
                        // committed
                        self.transition(&mut state, DownloadStatus::Completed).await?;
                        info!(
                            source_id = %source_id,
                            completed_count = state.completed_count,
                            "Source drained and completed"
                        );
                        break;
                    }

                    self.transition(&mut state, DownloadStatus::PageComplete).await?;
                },
                Err(SourceError::RateLimited { retry_after }) => {
                    state.daily_retry_count += 1;
                    state.last_error_kind = Some(ErrorKind::RateLimited);

                    if state.daily_retry_count >= self.config.max_daily_retries {
                        warn!(
                            source_id = %source_id,
                            daily_retry_count = state.daily_retry_count,
                            "Daily retry ceiling exhausted by rate limiting"
                        );
                        self.transition(&mut state, DownloadStatus::Failed).await?;
                        break;
                    }

                    let cooldown = retry_after.unwrap_or_else(|| self.config.cooldown());
                    state.next_allowed_attempt = chrono::Duration::from_std(cooldown)
                        .ok()
                        .map(|d| chrono::Utc::now() + d);
                    self.transition(&mut state, DownloadStatus::RateLimited).await?;

                    warn!(
                        source_id = %source_id,
                        cooldown_secs = cooldown.as_secs(),
                        attempt = state.daily_retry_count,
                        "Rate limited, cooling down"
                    );

                    match self.interruptible_sleep(cooldown, cancel, deadline).await {
                        SleepOutcome::Completed => {
                            state.next_allowed_attempt = None;
                            self.transition(&mut state, DownloadStatus::Retrying).await?;
                        },
                        SleepOutcome::Cancelled => {
                            self.fail(&mut state, ErrorKind::Cancelled).await?;
                            break;
                        },
                        SleepOutcome::DeadlineExceeded => {
                            info!(source_id = %source_id, "Run deadline reached during cool-down");
                            break;
                        },
                    }
                },
                Err(SourceError::TransientNetwork(msg)) => {
                    state.retry_count += 1;
                    state.last_error_kind = Some(ErrorKind::TransientNetwork);

                    if state.retry_count > self.config.max_transient_retries {
                        error!(
                            source_id = %source_id,
                            attempts = state.retry_count,
                            error = %msg,
                            "Transient retries exhausted"
                        );
                        self.transition(&mut state, DownloadStatus::Failed).await?;
                        break;
                    }

                    self.transition(&mut state, DownloadStatus::SourceError).await?;
                    warn!(
                        source_id = %source_id,
                        attempt = state.retry_count,
                        error = %msg,
                        "Transient network error, retrying shortly"
                    );

                    match self
                        .interruptible_sleep(self.config.transient_retry_delay(), cancel, deadline)
                        .await
                    {
                        SleepOutcome::Completed => {
                            self.transition(&mut state, DownloadStatus::Retrying).await?;
                        },
                        SleepOutcome::Cancelled => {
                            self.fail(&mut state, ErrorKind::Cancelled).await?;
                            break;
                        },
                        SleepOutcome::DeadlineExceeded => {
                            info!(source_id = %source_id, "Run deadline reached during retry delay");
                            break;
                        },
                    }
                },
                Err(SourceError::PermanentSource(msg)) => {
                    error!(
                        source_id = %source_id,
                        error = %msg,
                        "Permanent source error, operator intervention required"
                    );
                    state.last_error_kind = Some(ErrorKind::PermanentSource);
                    self.transition(&mut state, DownloadStatus::Failed).await?;
                    break;
                },
            }
        }

        Ok(RunOutput {
            summary: self.summary(run_id, &state, items_fetched, items_valid, items_rejected, started),
            records,
        })
    }

    /// Persist a status transition synchronously
    async fn transition(&self, state: &mut DownloadState, status: DownloadStatus) -> Result<()> {
        state.status = status;
        self.state_store
            .save(state)
            .await
            .with_context(|| {
                format!(
                    "Failed to persist {} state for {}",
                    status.as_str(),
                    state.source_id
                )
            })
    }

    async fn fail(&self, state: &mut DownloadState, kind: ErrorKind) -> Result<()> {
        state.last_error_kind = Some(kind);
        self.transition(state, DownloadStatus::Failed).await
    }

    /// Sleep that aborts on cancellation or the run deadline
    async fn interruptible_sleep(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> SleepOutcome {
        tokio::select! {
            _ = cancel.cancelled() => SleepOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => SleepOutcome::DeadlineExceeded,
            _ = tokio::time::sleep(wait) => SleepOutcome::Completed,
        }
    }

    fn summary(
        &self,
        run_id: Uuid,
        state: &DownloadState,
        items_fetched: u64,
        items_valid: u64,
        items_rejected: u64,
        started: Instant,
    ) -> RunSummary {
        RunSummary {
            run_id,
            source_id: self.config.source_id.clone(),
            items_fetched,
            items_valid,
            items_rejected,
            final_status: state.status,
            last_error_kind: state.last_error_kind,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }
}
