//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use sessionlens::core::{
    MemoryReportStore, Orchestrator, ProviderClient, ProviderHandle, ProviderReply,
    ProviderRequest, QueueManager, TranscriptSource,
};
use sessionlens::error::{ProviderError, TranscriptError};
use sessionlens::models::{
    CallTarget, Config, FieldDef, FieldKey, FieldKind, JobState, QueueConfig, RetryConfig,
    SectionDef, SectionSchema,
};

pub const SECTIONS: usize = 9;

/// What a scripted provider does for one call
pub enum Step {
    Reply(String),
    /// Reply whose output hit the provider's length limit
    Truncated(String),
    Fail(ProviderError),
    /// Never answer; the caller's timeout decides
    Stall,
}

type Responder = Box<dyn Fn(&CallTarget, usize) -> Step + Send + Sync>;

/// Provider whose answers are decided by a closure over the call target and
/// the number of calls made so far
pub struct ScriptedProvider {
    id: String,
    respond: Responder,
    calls: Mutex<Vec<ProviderRequest>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedProvider {
    pub fn new<F>(id: &str, respond: F) -> Self
    where
        F: Fn(&CallTarget, usize) -> Step + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Hold every call until the semaphore hands out a permit
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Targets of every call made so far
    pub fn calls(&self) -> Vec<CallTarget> {
        self.calls.lock().unwrap().iter().map(|r| r.target.clone()).collect()
    }

    /// User prompts of every call made so far
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|r| r.prompt.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_output_tokens(&self) -> u32 {
        4096
    }

    async fn call(&self, request: &ProviderRequest, _timeout: Duration) -> Result<ProviderReply, ProviderError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len() - 1
        };
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.map_err(|_| ProviderError::Cancelled)?;
        }

        match (self.respond)(&request.target, index) {
            Step::Reply(text) => Ok(ProviderReply {
                text,
                ..Default::default()
            }),
            Step::Truncated(text) => Ok(ProviderReply {
                text,
                output_tokens: Some(4096),
                hit_length_limit: true,
            }),
            Step::Fail(e) => Err(e),
            Step::Stall => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(ProviderError::Timeout(0))
            }
        }
    }
}

/// Transcripts held in memory; records the order media refs were requested
#[derive(Default)]
pub struct MemoryTranscripts {
    texts: HashMap<String, String>,
    requested: Mutex<Vec<String>>,
}

impl MemoryTranscripts {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            texts: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscriptSource for MemoryTranscripts {
    async fn transcript(&self, media_ref: &str) -> Result<String, TranscriptError> {
        self.requested.lock().unwrap().push(media_ref.to_string());
        self.texts
            .get(media_ref)
            .cloned()
            .ok_or_else(|| TranscriptError::NotFound(media_ref.to_string()))
    }
}

/// Nine sections with one text field each
pub fn compact_schema() -> SectionSchema {
    SectionSchema {
        sections: (1..=SECTIONS)
            .map(|i| SectionDef {
                id: format!("s{}", i),
                title: format!("Section {}", i),
                description: format!("Observations for part {}", i),
                fields: vec![FieldDef {
                    id: "notes".to_string(),
                    description: "What happened".to_string(),
                    kind: FieldKind::Text { min_chars: 10 },
                    keywords: vec![format!("part{}", i)],
                }],
            })
            .collect(),
    }
}

pub fn key(section: usize) -> FieldKey {
    FieldKey::new(format!("s{}", section), "notes")
}

/// Section number of a targeted call, if it was one
pub fn target_section(target: &CallTarget) -> Option<usize> {
    match target {
        CallTarget::Full => None,
        CallTarget::Field(key) => key.section.trim_start_matches('s').parse().ok(),
    }
}

pub fn notes_for(section: usize) -> String {
    format!("Detailed notes about part {} of the session", section)
}

/// Full-pass JSON answer filling the given sections
pub fn full_reply(sections: impl IntoIterator<Item = usize>) -> String {
    let mut map = Map::new();
    for i in sections {
        map.insert(format!("s{}", i), json!({ "notes": notes_for(i) }));
    }
    Value::Object(map).to_string()
}

/// Single-field JSON answer for a targeted call
pub fn field_reply(section: usize) -> String {
    json!({ "value": notes_for(section) }).to_string()
}

/// Answer every call completely
pub fn complete_responder(target: &CallTarget, _call: usize) -> Step {
    match target_section(target) {
        None => Step::Reply(full_reply(1..=SECTIONS)),
        Some(section) => Step::Reply(field_reply(section)),
    }
}

pub fn handle(provider: Arc<ScriptedProvider>) -> ProviderHandle {
    ProviderHandle::new(provider, 6000, 100).unwrap()
}

/// Config with fast backoff and the given worker count
pub fn test_config(workers: usize) -> Config {
    Config {
        queue: QueueConfig {
            workers,
            ..QueueConfig::default()
        },
        retry: RetryConfig {
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
            backoff_jitter_ms: 0,
            ..RetryConfig::default()
        },
        ..Config::default()
    }
}

pub fn orchestrator(config: &Config, providers: &[Arc<ScriptedProvider>]) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        providers.iter().cloned().map(handle).collect(),
        Arc::new(compact_schema()),
        config.timeouts.clone(),
        config.heuristics.clone(),
    ))
}

/// Everything a queue test needs to inspect
pub struct Harness {
    pub queue: QueueManager,
    pub store: Arc<MemoryReportStore>,
    pub transcripts: Arc<MemoryTranscripts>,
}

pub fn harness(config: &Config, providers: &[Arc<ScriptedProvider>], media: &[&str]) -> Harness {
    let store = Arc::new(MemoryReportStore::new());
    let entries: Vec<(&str, &str)> = media.iter().map(|m| (*m, TRANSCRIPT)).collect();
    let transcripts = Arc::new(MemoryTranscripts::new(&entries));
    let queue = QueueManager::new(
        config,
        orchestrator(config, providers),
        store.clone(),
        transcripts.clone(),
    );
    Harness {
        queue,
        store,
        transcripts,
    }
}

/// Poll until the job reaches `state` or a terminal state
pub async fn wait_for_state(queue: &QueueManager, job_id: &str, state: JobState) -> JobState {
    let mut rx = queue.subscribe(job_id).await.unwrap();
    let progress = rx
        .wait_for(|p| p.job.state == state || p.job.state.is_terminal())
        .await
        .unwrap();
    progress.job.state
}

pub const TRANSCRIPT: &str = "Coach: Welcome everyone, today is part1 of the plan.\n\
Coach: In part2 we warm up with a passing drill.\n\
Coach: part3 covers pressing, part4 is about communication.\n\
Coach: part5 small-sided game, part6 review the goals.\n\
Coach: part7 water break, part8 finishing drill.\n\
Coach: part9 wrap up, well done all.";
