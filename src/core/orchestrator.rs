use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::parser::{assemble_field_prompt, assemble_full_prompt, parse_output, target_keys};
use crate::core::prompts::{SYSTEM_PROMPT_ANALYZE, SYSTEM_PROMPT_FIELD};
use crate::core::provider::{build_providers, ProviderHandle, ProviderReply, ProviderRequest};
use crate::core::validator::CompletenessValidator;
use crate::error::{PipelineError, ProviderError};
use crate::models::{
    AttemptNote, CallTarget, Config, ConfigError, FieldCandidate, FieldDef, FieldKey, Gap,
    HeuristicsConfig, ProviderErrorKind, ProviderResult, Report, SectionSchema, TimeoutConfig,
};

/// Report, gaps and score after a pass
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub report: Report,
    pub gaps: Vec<Gap>,
    pub score: f64,
}

/// One targeted call planned against a gap
#[derive(Debug, Clone)]
pub struct GapPlan {
    pub key: FieldKey,
    /// Index into the orchestrator's provider list
    pub provider: usize,
    pub excerpt: String,
    /// Add the strict output-format reminder
    pub strict_format: bool,
    pub call_timeout: Duration,
    /// Backoff slept before acquiring the rate limiter
    pub delay: Duration,
}

/// Per-job provider bookkeeping: quota streaks, circuit breaker, routing history
#[derive(Debug)]
pub struct JobContext {
    pub job_id: String,
    pub cancel: CancellationToken,
    breaker_threshold: u32,
    pass: u32,
    quota_streak: HashMap<String, u32>,
    excluded: HashSet<String>,
    last_failure: HashMap<(String, FieldKey), u32>,
    cursor: usize,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, cancel: CancellationToken, breaker_threshold: u32) -> Self {
        Self {
            job_id: job_id.into(),
            cancel,
            breaker_threshold: breaker_threshold.max(1),
            pass: 0,
            quota_streak: HashMap::new(),
            excluded: HashSet::new(),
            last_failure: HashMap::new(),
            cursor: 0,
        }
    }

    /// Consecutive QuotaExceeded results from a provider within this job
    pub fn quota_streak(&self, provider_id: &str) -> u32 {
        self.quota_streak.get(provider_id).copied().unwrap_or(0)
    }

    pub fn is_excluded(&self, provider_id: &str) -> bool {
        self.excluded.contains(provider_id)
    }

    /// Passes run so far, full pass included
    pub fn passes_run(&self) -> u32 {
        self.pass
    }

    fn observe(&mut self, provider_id: &str, error: Option<ProviderErrorKind>) {
        match error {
            Some(ProviderErrorKind::QuotaExceeded) => {
                let streak = self.quota_streak.entry(provider_id.to_string()).or_insert(0);
                *streak += 1;
                if *streak >= self.breaker_threshold && self.excluded.insert(provider_id.to_string()) {
                    warn!(
                        job_id = %self.job_id,
                        provider = %provider_id,
                        streak = *streak,
                        "Circuit open: provider excluded for the rest of the job"
                    );
                }
            }
            Some(ProviderErrorKind::Cancelled) => {}
            _ => {
                self.quota_streak.insert(provider_id.to_string(), 0);
            }
        }
    }

    fn record_failure(&mut self, provider_id: &str, key: &FieldKey) {
        self.last_failure
            .insert((provider_id.to_string(), key.clone()), self.pass);
    }
}

/// Fans passes out to providers and merges what comes back
pub struct Orchestrator {
    providers: Vec<ProviderHandle>,
    schema: Arc<SectionSchema>,
    validator: CompletenessValidator,
    timeouts: TimeoutConfig,
    heuristics: HeuristicsConfig,
}

impl Orchestrator {
    pub fn new(
        providers: Vec<ProviderHandle>,
        schema: Arc<SectionSchema>,
        timeouts: TimeoutConfig,
        heuristics: HeuristicsConfig,
    ) -> Self {
        let validator = CompletenessValidator::new(schema.clone(), heuristics.placeholder_markers.clone());
        Self {
            providers,
            schema,
            validator,
            timeouts,
            heuristics,
        }
    }

    /// Build HTTP providers from configuration
    pub fn from_config(config: &Config, schema: Arc<SectionSchema>) -> Result<Self, ConfigError> {
        let providers = build_providers(&config.providers)?;
        Ok(Self::new(
            providers,
            schema,
            config.timeouts.clone(),
            config.heuristics.clone(),
        ))
    }

    pub fn schema(&self) -> &SectionSchema {
        &self.schema
    }

    pub fn validator(&self) -> &CompletenessValidator {
        &self.validator
    }

    pub fn providers(&self) -> &[ProviderHandle] {
        &self.providers
    }

    pub fn heuristics(&self) -> &HeuristicsConfig {
        &self.heuristics
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// First pass: every non-excluded provider gets the whole transcript
    pub async fn run_full_pass(&self, ctx: &mut JobContext, transcript: &str) -> Result<PassOutcome, PipelineError> {
        let active: Vec<&ProviderHandle> = self
            .providers
            .iter()
            .filter(|p| !ctx.is_excluded(p.id()))
            .collect();
        if active.is_empty() {
            return Err(PipelineError::NoProviders);
        }

        ctx.pass += 1;
        let deadline = Instant::now() + self.timeouts.pass();
        let prompt = assemble_full_prompt(&self.schema, transcript);
        info!(job_id = %ctx.job_id, pass = ctx.pass, providers = active.len(), "Starting full pass");

        let calls = active.iter().map(|provider| {
            let request = ProviderRequest {
                system_prompt: SYSTEM_PROMPT_ANALYZE.to_string(),
                prompt: prompt.clone(),
                target: CallTarget::Full,
            };
            self.execute(provider, request, self.timeouts.call(), Duration::ZERO, deadline, &ctx.cancel)
        });
        let results = join_all(calls).await;

        if ctx.cancel.is_cancelled() {
            debug!(job_id = %ctx.job_id, "Discarding full pass results after cancellation");
            return Err(PipelineError::Cancelled);
        }

        let mut report = Report::empty(&self.schema);
        self.absorb(ctx, &mut report, &results);
        Ok(self.outcome(ctx, report))
    }

    /// Pick the provider for a gap.
    ///
    /// Excluded providers are skipped. A provider that never failed this
    /// field beats one that did, otherwise the least recent failure wins.
    /// Ties go round-robin from the last pick.
    pub fn route(&self, ctx: &mut JobContext, key: &FieldKey) -> Option<usize> {
        let n = self.providers.len();
        let mut best: Option<(usize, Option<u32>)> = None;

        for step in 0..n {
            let index = (ctx.cursor + step) % n;
            let id = self.providers[index].id();
            if ctx.is_excluded(id) {
                continue;
            }
            let failed = ctx.last_failure.get(&(id.to_string(), key.clone())).copied();
            let better = match (best, failed) {
                (None, _) => true,
                (Some((_, None)), _) => false,
                (Some((_, Some(_))), None) => true,
                (Some((_, Some(current))), Some(candidate)) => candidate < current,
            };
            if better {
                best = Some((index, failed));
            }
        }

        let (index, _) = best?;
        ctx.cursor = (index + 1) % n;
        Some(index)
    }

    /// Targeted pass: one narrow call per planned gap
    pub async fn run_targeted_pass(
        &self,
        ctx: &mut JobContext,
        report: &Report,
        plans: Vec<GapPlan>,
    ) -> Result<PassOutcome, PipelineError> {
        if self.providers.is_empty() {
            return Err(PipelineError::NoProviders);
        }

        ctx.pass += 1;
        let deadline = Instant::now() + self.timeouts.pass();
        info!(job_id = %ctx.job_id, pass = ctx.pass, gaps = plans.len(), "Starting targeted pass");

        let mut calls = Vec::new();
        for plan in &plans {
            let (Some(provider), Some(section), Some(field)) = (
                self.providers.get(plan.provider),
                self.schema.section(&plan.key.section),
                self.schema.field(&plan.key),
            ) else {
                warn!(job_id = %ctx.job_id, field = %plan.key, "Skipping plan with unknown provider or field");
                continue;
            };
            let request = ProviderRequest {
                system_prompt: SYSTEM_PROMPT_FIELD.to_string(),
                prompt: assemble_field_prompt(section, field, &plan.excerpt, plan.strict_format),
                target: CallTarget::Field(plan.key.clone()),
            };
            debug!(
                job_id = %ctx.job_id,
                field = %plan.key,
                provider = %provider.id(),
                delay_ms = plan.delay.as_millis() as u64,
                timeout_ms = plan.call_timeout.as_millis() as u64,
                "Planned targeted call"
            );
            calls.push(self.execute(provider, request, plan.call_timeout, plan.delay, deadline, &ctx.cancel));
        }
        let results = join_all(calls).await;

        if ctx.cancel.is_cancelled() {
            debug!(job_id = %ctx.job_id, "Discarding targeted pass results after cancellation");
            return Err(PipelineError::Cancelled);
        }

        let mut report = report.clone();
        for plan in &plans {
            report.record_attempt(&plan.key);
        }
        self.absorb(ctx, &mut report, &results);
        Ok(self.outcome(ctx, report))
    }

    fn outcome(&self, ctx: &JobContext, report: Report) -> PassOutcome {
        let validation = self.validator.validate(&report);
        info!(
            job_id = %ctx.job_id,
            pass = ctx.pass,
            score = validation.score,
            gaps = validation.gaps.len(),
            "Pass complete"
        );
        PassOutcome {
            report,
            gaps: validation.gaps,
            score: validation.score,
        }
    }

    /// Run one provider call: backoff, rate limiter, then the call itself.
    ///
    /// All three are bounded by the pass deadline and raced against
    /// cancellation. A call with no time left is never issued.
    async fn execute(
        &self,
        provider: &ProviderHandle,
        request: ProviderRequest,
        call_timeout: Duration,
        delay: Duration,
        pass_deadline: Instant,
        cancel: &CancellationToken,
    ) -> ProviderResult {
        let started = Instant::now();
        let work = async {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            provider.acquire().await;
            let remaining = pass_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProviderError::Timeout(started.elapsed().as_millis() as u64));
            }
            let timeout = call_timeout.min(remaining);
            match tokio::time::timeout(timeout, provider.call(&request, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout.as_millis() as u64)),
            }
        };
        let bounded = async {
            match tokio::time::timeout_at(pass_deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(started.elapsed().as_millis() as u64)),
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = bounded => result,
        };
        let latency = started.elapsed();

        match outcome {
            Ok(reply) => {
                let truncated = self.is_truncated(&reply, provider.max_output_tokens());
                let parsed = parse_output(&reply.text, &self.schema, &request.target);
                debug!(
                    provider = %provider.id(),
                    target = %request.target,
                    latency_ms = latency.as_millis() as u64,
                    chars = reply.text.len(),
                    truncated,
                    fields = parsed.fields().len(),
                    "Provider call finished"
                );
                ProviderResult {
                    provider_id: provider.id().to_string(),
                    target: request.target,
                    raw_output: reply.text,
                    parsed,
                    latency,
                    truncated,
                    error: None,
                }
            }
            Err(e) => {
                if !matches!(e, ProviderError::Cancelled) {
                    warn!(provider = %provider.id(), target = %request.target, "Provider call failed: {}", e);
                }
                ProviderResult::failed(provider.id(), request.target, latency, e.kind())
            }
        }
    }

    fn is_truncated(&self, reply: &ProviderReply, max_output_tokens: u32) -> bool {
        if reply.hit_length_limit {
            return true;
        }
        if max_output_tokens == 0 {
            return false;
        }
        let produced = reply
            .output_tokens
            .map(f64::from)
            .unwrap_or_else(|| reply.text.chars().count() as f64 / 4.0);
        produced >= f64::from(max_output_tokens) * self.heuristics.token_limit_ratio
    }

    /// Derive a confidence for a schema-valid value from its length, how
    /// it was parsed, and boilerplate markers
    fn confidence(&self, def: &FieldDef, value: &Value, via_fallback: bool) -> f64 {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            other => other.to_string(),
        };
        let length = (text.chars().count() as f64 / def.kind.ideal_chars() as f64).min(1.0);
        let mut confidence = 0.4 + 0.4 * length;
        if !via_fallback {
            confidence += 0.2;
        }
        let lower = text.to_lowercase();
        if self
            .heuristics
            .boilerplate_markers
            .iter()
            .any(|m| lower.contains(&m.to_lowercase()))
        {
            confidence -= 0.25;
        }
        confidence.clamp(0.05, 1.0)
    }

    /// Merge every schema-valid value into the report and leave per-field
    /// notes for cause inference
    fn absorb(&self, ctx: &mut JobContext, report: &mut Report, results: &[ProviderResult]) {
        let mut notes: BTreeMap<FieldKey, Vec<AttemptNote>> = BTreeMap::new();

        for result in results {
            ctx.observe(&result.provider_id, result.error);

            for key in target_keys(&self.schema, &result.target) {
                let Some(def) = self.schema.field(&key) else {
                    continue;
                };
                let extracted = result.parsed.fields().iter().find(|f| f.key == key);

                let rejected = match (result.error, extracted) {
                    (Some(_), _) => None,
                    (None, None) => Some("field not found in response".to_string()),
                    (None, Some(field)) => {
                        match def.check(&field.value, &self.heuristics.placeholder_markers) {
                            Ok(value) => {
                                let confidence = self.confidence(def, &value, field.via_fallback);
                                report.merge(FieldCandidate {
                                    key: key.clone(),
                                    value,
                                    confidence,
                                    provider_id: result.provider_id.clone(),
                                });
                                None
                            }
                            Err(violation) => Some(violation.to_string()),
                        }
                    }
                };

                let accepted = result.error.is_none() && rejected.is_none();
                if !accepted {
                    ctx.record_failure(&result.provider_id, &key);
                }
                notes.entry(key).or_default().push(AttemptNote {
                    provider_id: result.provider_id.clone(),
                    error: result.error,
                    output_chars: result.output_chars(),
                    truncated: result.truncated,
                    rejected,
                });
            }
        }

        for (key, notes) in notes {
            report.record_notes(&key, notes);
        }
    }
}
