//! Two-phase generation driver: objects -> concepts, then (object, concept) -> values.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::attributes::{AttributeSet, load_objects};
use crate::clients::{CompletionClient, OpenAiCompatibleClient};
use crate::config::GenerationConfig;
use crate::error::{AttrGenError, Result};
use crate::keys::{KeyPool, load_keys};
use crate::llm::LlmCaller;
use crate::prompts::{concept_prompt, parse_list, value_prompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Concepts,
    Values,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Concepts => write!(f, "concept generation"),
            Phase::Values => write!(f, "value generation"),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct PhaseStats {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Already present in the existing output
    pub skipped: usize,
}

/// Statistics for one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStats {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub objects_total: usize,
    pub concepts: PhaseStats,
    pub values: PhaseStats,
    pub keys_disabled: usize,
}

impl GenerationStats {
    fn start() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            objects_total: 0,
            concepts: PhaseStats::default(),
            values: PhaseStats::default(),
            keys_disabled: 0,
        }
    }

    pub fn total_failed(&self) -> usize {
        self.concepts.failed + self.values.failed
    }
}

pub struct Pipeline {
    config: GenerationConfig,
    caller: LlmCaller,
    limit: Option<usize>,
}

impl Pipeline {
    pub fn new(config: GenerationConfig, caller: LlmCaller) -> Self {
        Self {
            config,
            caller,
            limit: None,
        }
    }

    /// Build the production stack: keys file -> key pool -> HTTP client -> caller.
    pub fn from_config(config: GenerationConfig) -> Result<Self> {
        let keys = load_keys(&config.keys_path)?;
        let pool = KeyPool::new(
            keys,
            config.max_concurrent_per_key,
            config.requests_per_minute_per_key,
        )?;
        let client: Arc<dyn CompletionClient> = Arc::new(OpenAiCompatibleClient::new(
            &config.api_base,
            config.request_timeout_ms,
        )?);
        let caller = LlmCaller::new(client, Arc::new(pool), &config);
        Ok(Self::new(config, caller))
    }

    /// Only process the first `limit` objects of the input.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    fn resolve_objects(&self, existing: &AttributeSet) -> Result<Vec<String>> {
        let objects = match load_objects(&self.config.input_file) {
            Ok(objects) => objects,
            // Value-only runs can work from the previous output alone
            Err(AttrGenError::Io { path, source })
                if !self.config.run_concept_generation
                    && source.kind() == std::io::ErrorKind::NotFound =>
            {
                info!("Input {} not found, using objects from existing output", path);
                existing.object_names()
            }
            Err(e) => return Err(e),
        };
        Ok(match self.limit {
            Some(limit) => objects.into_iter().take(limit).collect(),
            None => objects,
        })
    }

    pub async fn run(&self) -> Result<GenerationStats> {
        let mut stats = GenerationStats::start();
        let mut set = AttributeSet::load(&self.config.output_file)?;
        let objects = self.resolve_objects(&set)?;
        stats.objects_total = objects.len();

        info!(
            "Starting run {} (model={}, objects={}, keys={}, max_concurrent_per_key={})",
            stats.run_id,
            self.config.model_name,
            objects.len(),
            self.caller.pool().len(),
            self.caller.pool().max_concurrent_per_key()
        );

        if self.config.run_concept_generation {
            let pending = set.pending_objects(&objects);
            stats.concepts.skipped = objects.len() - pending.len();
            let n = self.config.concepts_per_object;
            self.run_phase(
                Phase::Concepts,
                pending,
                &mut set,
                &mut stats.concepts,
                |object| concept_prompt(object, n),
                |set, object, concepts| set.set_concepts(object, concepts),
                n,
            )
            .await?;
            set.save(&self.config.output_file)?;
        }

        if self.config.run_value_generation {
            if !self.config.run_concept_generation && set.concept_count() == 0 {
                warn!(
                    "Value generation requested but {} holds no concepts",
                    self.config.output_file.display()
                );
            }
            let pending = set.pending_concepts(&objects);
            let known: usize = objects.iter().map(|o| set.concepts(o).len()).sum();
            stats.values.skipped = known - pending.len();
            let n = self.config.values_per_concept;
            self.run_phase(
                Phase::Values,
                pending,
                &mut set,
                &mut stats.values,
                |(object, concept)| value_prompt(object, concept, n),
                |set, (object, concept), values| set.set_values(object, concept, values),
                n,
            )
            .await?;
            set.save(&self.config.output_file)?;
        }

        stats.keys_disabled = self.caller.pool().len() - self.caller.pool().enabled_count();
        stats.finished_at = Some(Utc::now());
        info!(
            "Run {} finished: concepts {}/{} ok, values {}/{} ok, output {}",
            stats.run_id,
            stats.concepts.succeeded,
            stats.concepts.requested,
            stats.values.succeeded,
            stats.values.requested,
            self.config.output_file.display()
        );
        Ok(stats)
    }

    /// Fan `jobs` out over the key pool and merge each parsed reply into `set`.
    /// Per-job failures are counted; losing every key aborts after a checkpoint.
    #[allow(clippy::too_many_arguments)]
    async fn run_phase<J, B, A>(
        &self,
        phase: Phase,
        jobs: Vec<J>,
        set: &mut AttributeSet,
        stats: &mut PhaseStats,
        build_prompt: B,
        apply: A,
        per_job: usize,
    ) -> Result<()>
    where
        J: std::fmt::Debug,
        B: Fn(&J) -> String,
        A: Fn(&mut AttributeSet, &J, Vec<String>),
    {
        stats.requested = jobs.len();
        if jobs.is_empty() {
            info!("Skipping {}: nothing pending", phase);
            return Ok(());
        }
        let width = self.caller.pool().capacity().max(1);
        info!("Running {} for {} items ({} in flight)", phase, jobs.len(), width);

        let caller = &self.caller;
        let build_prompt = &build_prompt;
        let mut results = stream::iter(jobs.into_iter().map(|job| async move {
            let prompt = build_prompt(&job);
            let outcome = caller.ask(prompt, |reply| parse_list(reply, per_job)).await;
            (job, outcome)
        }))
        .buffer_unordered(width);

        let mut completed = 0usize;
        while let Some((job, outcome)) = results.next().await {
            completed += 1;
            match outcome {
                Ok(items) => {
                    if items.len() < per_job {
                        debug!("{:?}: got {} of {} items", job, items.len(), per_job);
                    }
                    apply(set, &job, items);
                    stats.succeeded += 1;
                }
                Err(e @ AttrGenError::NoUsableKeys { .. }) => {
                    drop(results);
                    set.save(&self.config.output_file)?;
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} failed for {:?}: {}", phase, job, e);
                    stats.failed += 1;
                }
            }

            if self.config.save_every > 0 && completed % self.config.save_every == 0 {
                set.save(&self.config.output_file)?;
                debug!("Checkpoint after {} {} results", completed, phase);
            }
        }
        Ok(())
    }
}
