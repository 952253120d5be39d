use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::orchestrator::{GapPlan, JobContext, Orchestrator, PassOutcome};
use crate::core::parser::select_excerpt;
use crate::error::PipelineError;
use crate::models::{FieldKey, Gap, GapCause, Report, RetryConfig};

/// Where gap-filling ended
#[derive(Debug, Clone)]
pub struct Resolution {
    pub report: Report,
    pub gaps: Vec<Gap>,
    pub score: f64,
    /// Gaps remain and no further pass will be attempted
    pub exhausted: bool,
    pub passes_used: u32,
}

/// Exponential backoff for quota errors, non-decreasing per provider
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: Duration,
    last: HashMap<String, Duration>,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
            last: HashMap::new(),
        }
    }

    /// Delay before the next call to `provider_id` given its quota streak.
    ///
    /// `min(base * 2^streak, cap) + jitter`, raised to the previous delay for
    /// this provider so consecutive delays never shrink.
    pub fn delay(&mut self, provider_id: &str, streak: u32) -> Duration {
        let factor = 2u32.saturating_pow(streak.min(20));
        let exponential = self.base.saturating_mul(factor).min(self.cap);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        let delay = exponential + jitter;
        let delay = match self.last.get(provider_id) {
            Some(previous) if *previous > delay => *previous,
            _ => delay,
        };
        self.last.insert(provider_id.to_string(), delay);
        delay
    }

    /// Delay before calling a provider; none while its quota streak is zero
    pub fn before_call(&mut self, provider_id: &str, streak: u32) -> Duration {
        if streak == 0 {
            return Duration::ZERO;
        }
        self.delay(provider_id, streak)
    }

    /// Forget the provider's history after it answers without a quota error
    pub fn reset(&mut self, provider_id: &str) {
        self.last.remove(provider_id);
    }
}

/// Per-gap memory across targeted passes
#[derive(Debug, Default, Clone)]
struct GapHistory {
    timeouts: u32,
    token_limits: u32,
}

/// Bounded, cause-aware retries against the missing parts of a report
pub struct GapFiller {
    orchestrator: Arc<Orchestrator>,
    config: RetryConfig,
}

impl GapFiller {
    pub fn new(orchestrator: Arc<Orchestrator>, config: RetryConfig) -> Self {
        Self { orchestrator, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run targeted passes until the report is complete, the pass budget is
    /// spent, or only terminal gaps remain.
    ///
    /// `on_pass` sees every intermediate outcome with the number of passes
    /// used so far.
    pub async fn resolve_gaps<F>(
        &self,
        ctx: &mut JobContext,
        transcript: &str,
        report: Report,
        gaps: Vec<Gap>,
        mut on_pass: F,
    ) -> Result<Resolution, PipelineError>
    where
        F: FnMut(&PassOutcome, u32),
    {
        let mut report = report;
        let mut gaps = gaps;
        let mut score = self.orchestrator.validator().validate(&report).score;
        let mut passes_used = 0u32;
        let mut history: HashMap<FieldKey, GapHistory> = HashMap::new();
        let mut backoff = Backoff::new(&self.config);

        loop {
            if gaps.is_empty() {
                break;
            }
            if passes_used >= self.config.max_targeted_passes {
                info!(job_id = %ctx.job_id, passes_used, gaps = gaps.len(), "Retry budget exhausted");
                break;
            }

            for gap in &gaps {
                let entry = history.entry(gap.key()).or_default();
                match gap.cause {
                    GapCause::Timeout => entry.timeouts += 1,
                    GapCause::TokenLimit => entry.token_limits += 1,
                    _ => {}
                }
            }

            let plans = self.plan(ctx, transcript, &gaps, &history, &mut backoff);
            if plans.is_empty() {
                info!(job_id = %ctx.job_id, gaps = gaps.len(), "Only terminal gaps remain");
                break;
            }

            let outcome = self.orchestrator.run_targeted_pass(ctx, &report, plans).await?;
            passes_used += 1;
            if outcome.score < score {
                warn!(job_id = %ctx.job_id, before = score, after = outcome.score, "Completeness dropped after a pass");
            }
            on_pass(&outcome, passes_used);

            for provider in self.orchestrator.providers() {
                if ctx.quota_streak(provider.id()) == 0 {
                    backoff.reset(provider.id());
                }
            }

            report = outcome.report;
            gaps = outcome.gaps;
            score = outcome.score;
        }

        Ok(Resolution {
            exhausted: !gaps.is_empty(),
            report,
            gaps,
            score,
            passes_used,
        })
    }

    /// Whether a gap has used up its retries
    fn is_terminal(&self, gap: &Gap, history: &GapHistory) -> bool {
        gap.attempts_made >= self.config.max_attempts_per_gap
            || (gap.cause == GapCause::Timeout && history.timeouts >= 2)
    }

    fn plan(
        &self,
        ctx: &mut JobContext,
        transcript: &str,
        gaps: &[Gap],
        history: &HashMap<FieldKey, GapHistory>,
        backoff: &mut Backoff,
    ) -> Vec<GapPlan> {
        let schema = self.orchestrator.schema();
        let heuristics = self.orchestrator.heuristics();
        let timeouts = self.orchestrator.timeouts();
        let mut plans = Vec::new();

        for gap in gaps {
            let key = gap.key();
            let seen = history.get(&key).cloned().unwrap_or_default();
            if self.is_terminal(gap, &seen) {
                debug!(job_id = %ctx.job_id, gap = %gap, "Gap is terminal");
                continue;
            }
            let Some(field) = schema.field(&key) else {
                continue;
            };
            let Some(provider) = self.orchestrator.route(ctx, &key) else {
                debug!(job_id = %ctx.job_id, gap = %gap, "No provider available");
                continue;
            };
            let provider_id = self.orchestrator.providers()[provider].id().to_string();

            let mut budget = heuristics.excerpt_chars;
            let mut strict_format = false;
            let mut call_timeout = timeouts.call();
            match gap.cause {
                GapCause::TokenLimit => {
                    let halvings = seen.token_limits.min(16);
                    budget = (heuristics.excerpt_chars >> halvings).max(heuristics.min_excerpt_chars);
                }
                GapCause::ParseFailure => strict_format = true,
                GapCause::Timeout => {
                    call_timeout = call_timeout.mul_f64(timeouts.timeout_retry_multiplier);
                }
                GapCause::QuotaExceeded | GapCause::Unknown => {}
            }

            let delay = backoff.before_call(&provider_id, ctx.quota_streak(&provider_id));

            plans.push(GapPlan {
                excerpt: select_excerpt(transcript, &field.keywords, budget),
                key,
                provider,
                strict_format,
                call_timeout,
                delay,
            });
        }
        plans
    }
}
