// Sync run coordination: one fetch -> parse -> reconcile pipeline per provider
//
// Providers are isolated from each other. A provider that fails to fetch or parse
// never blocks the others and never reaches reconciliation, so its stored data is
// left exactly as the last successful run wrote it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};

use crate::config::{ProviderConfig, SyncSettings};
use crate::model::ItemError;
use crate::provider_client::{FeedSource, FetchError};
use crate::reconcile::{ReconcileCounts, ReconcileError, ReconciliationEngine};
use crate::store::{EventStore, StoreError};
use crate::xml_parser::{parse_feed, StructuralParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Fetching,
    Parsing,
    Reconciling,
    Done,
    Failed,
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Skipped)
    }

    fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Fetching) | (Pending, Skipped) => true,
            (Fetching, Parsing) | (Parsing, Reconciling) | (Reconciling, Done) => true,
            (state, Failed) => !state.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("provider {provider} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub provider: String,
    pub from: RunState,
    pub to: RunState,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] StructuralParseError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("background task failed: {0}")]
    Task(#[from] task::JoinError),

    #[error(transparent)]
    State(#[from] TransitionError),

    #[error("provider {provider} lost its sync lock before the run completed")]
    LockLost { provider: String },
}

/// State machine of a single provider within one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRun {
    provider: String,
    state: RunState,
}

impl ProviderRun {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            state: RunState::Pending,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(TransitionError {
                provider: self.provider.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = RunState::Failed;
        }
    }
}

#[derive(Debug)]
pub struct ProviderOutcome {
    pub provider: String,
    pub state: RunState,
    /// For a failed reconciliation, the counts of the batches that did commit.
    pub counts: ReconcileCounts,
    pub item_errors: Vec<ItemError>,
    pub error: Option<SyncError>,
}

#[derive(Debug)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<ProviderOutcome>,
}

impl SyncReport {
    pub fn outcome(&self, provider: &str) -> Option<&ProviderOutcome> {
        self.outcomes.iter().find(|o| o.provider == provider)
    }

    fn count(&self, state: RunState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(RunState::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(RunState::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(RunState::Skipped)
    }

    pub fn item_errors(&self) -> usize {
        self.outcomes.iter().map(|o| o.item_errors.len()).sum()
    }
}

pub struct SyncOrchestrator {
    store: EventStore,
    engine: ReconciliationEngine,
    source: Arc<dyn FeedSource>,
    settings: SyncSettings,
    owner_id: String,
}

impl SyncOrchestrator {
    pub fn new(store: EventStore, source: Arc<dyn FeedSource>, settings: SyncSettings) -> Self {
        let engine = ReconciliationEngine::new(store.clone(), settings.batch_size);
        Self {
            store,
            engine,
            source,
            settings,
            owner_id: format!("sync-{:016x}", rand::random::<u64>()),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Syncs every provider once, all sharing `now` as the run timestamp.
    pub async fn run_sync(&self, providers: &[ProviderConfig], now: DateTime<Utc>) -> SyncReport {
        info!(
            providers = providers.len(),
            parallel = self.settings.parallel,
            owner = %self.owner_id,
            "sync run started"
        );

        let outcomes = if self.settings.parallel {
            join_all(providers.iter().map(|provider| self.sync_provider(provider, now))).await
        } else {
            let mut outcomes = Vec::with_capacity(providers.len());
            for provider in providers {
                outcomes.push(self.sync_provider(provider, now).await);
            }
            outcomes
        };

        let report = SyncReport {
            started_at: now,
            outcomes,
        };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            item_errors = report.item_errors(),
            "sync run finished"
        );
        report
    }

    async fn sync_provider(&self, provider: &ProviderConfig, now: DateTime<Utc>) -> ProviderOutcome {
        let mut run = ProviderRun::new(&provider.name);
        let mut outcome = ProviderOutcome {
            provider: provider.name.clone(),
            state: RunState::Pending,
            counts: ReconcileCounts::default(),
            item_errors: Vec::new(),
            error: None,
        };

        match self.acquire_lock(&provider.name, now).await {
            Ok(true) => {}
            Ok(false) => {
                info!(provider = %provider.name, "sync already in progress elsewhere, skipping");
                if let Err(err) = run.advance(RunState::Skipped) {
                    outcome.error = Some(err.into());
                }
                outcome.state = run.state();
                return outcome;
            }
            Err(err) => {
                error!(provider = %provider.name, error = %err, "could not take sync lock");
                run.fail();
                outcome.state = run.state();
                outcome.error = Some(err);
                return outcome;
            }
        }

        let result = match self.run_locked(provider, now, &mut run, &mut outcome).await {
            Ok(()) => self.complete(&provider.name, now, &mut run).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            run.fail();
            warn!(provider = %provider.name, error = %err, "provider sync failed");
            let message = err.to_string();
            match self
                .blocking_store(
                    move |store, name, owner| store.fail_run(&name, &owner, now, &message),
                    &provider.name,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(provider = %provider.name, "sync lock held by another owner, failure not recorded")
                }
                Err(release_err) => {
                    error!(provider = %provider.name, error = %release_err, "could not record failed run")
                }
            }
            outcome.error = Some(err);
        } else {
            info!(
                provider = %provider.name,
                created = outcome.counts.created(),
                updated = outcome.counts.updated(),
                item_errors = outcome.item_errors.len(),
                "provider sync done"
            );
        }

        outcome.state = run.state();
        outcome
    }

    async fn run_locked(
        &self,
        provider: &ProviderConfig,
        now: DateTime<Utc>,
        run: &mut ProviderRun,
        outcome: &mut ProviderOutcome,
    ) -> Result<(), SyncError> {
        run.advance(RunState::Fetching)?;
        let body = self.source.fetch(provider).await?;

        run.advance(RunState::Parsing)?;
        let feed = task::spawn_blocking(move || parse_feed(&body)).await??;
        outcome.item_errors = feed.item_errors;

        run.advance(RunState::Reconciling)?;
        let engine = self.engine.clone();
        let name = provider.name.clone();
        let events = feed.events;
        match task::spawn_blocking(move || engine.upsert(&name, &events, now)).await? {
            Ok(counts) => {
                outcome.counts = counts;
                Ok(())
            }
            Err(err) => {
                outcome.counts = err.committed();
                Err(err.into())
            }
        }
    }

    // Marks the run successful, unless the lock expired and another owner took it
    // over while this run was still working.
    async fn complete(
        &self,
        provider: &str,
        now: DateTime<Utc>,
        run: &mut ProviderRun,
    ) -> Result<(), SyncError> {
        let released = self
            .blocking_store(move |store, name, owner| store.complete_run(&name, &owner, now), provider)
            .await?;
        if !released {
            return Err(SyncError::LockLost {
                provider: provider.to_string(),
            });
        }
        run.advance(RunState::Done)?;
        Ok(())
    }

    async fn acquire_lock(&self, provider: &str, now: DateTime<Utc>) -> Result<bool, SyncError> {
        let ttl = Duration::from_secs(self.settings.lock_ttl_seconds);
        self.blocking_store(
            move |store, name, owner| store.try_acquire_lock(&name, &owner, now, ttl),
            provider,
        )
        .await
    }

    // Runs a store call on the blocking pool with owned copies of the provider and owner ids.
    async fn blocking_store<T, F>(&self, f: F, provider: &str) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(EventStore, String, String) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        let name = provider.to_string();
        let owner = self.owner_id.clone();
        Ok(task::spawn_blocking(move || f(store, name, owner)).await??)
    }
}
