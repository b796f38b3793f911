//! Scripted ML adapter
//!
//! Answers every stage from a script instead of a real service and records the order in
//! which calls start and finish.

use async_trait::async_trait;
use serde_json::{json, Value};
use spk_common::events::StageName;
use spk_sa::adapter::{AdapterError, MlAdapter, SessionContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
enum Script {
    Ready(Value),
    Fail(String),
    /// Never answers; only a timeout or cancellation ends the call
    Hang,
}

/// Call log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Started(StageName),
    Finished(StageName),
}

pub struct ScriptedAdapter {
    scripts: Mutex<HashMap<StageName, Script>>,
    delays: Mutex<HashMap<StageName, Duration>>,
    gates: Mutex<HashMap<StageName, Arc<Notify>>>,
    log: Mutex<Vec<CallEvent>>,
    contexts: Mutex<Vec<(StageName, SessionContext)>>,
    reachable: AtomicBool,
}

/// Payload the scripted service returns for a stage by default
pub fn default_payload(stage: StageName) -> Value {
    match stage {
        StageName::Transcription => json!({
            "text": "Good morning everyone, today I want to talk about our product",
            "segments": [
                {"start": 0.0, "end": 5.5, "text": "Good morning everyone,"},
                {"start": 5.5, "end": 12.0, "text": "today I want to talk about our product"}
            ]
        }),
        StageName::Metrics => json!({"wordsPerMinute": 142, "fillerWords": 1, "pauses": 2}),
        StageName::PitchEvaluation => json!({"score": 7.5, "structure": "clear"}),
        StageName::Questions => json!({"questions": ["What is the pricing model?"]}),
        StageName::Feedback => json!({"strengths": ["pace"], "improvements": ["eye contact"]}),
    }
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAdapter {
    /// Every stage succeeds immediately with its default payload
    pub fn new() -> Self {
        let scripts = StageName::ALL
            .iter()
            .map(|stage| (*stage, Script::Ready(default_payload(*stage))))
            .collect();
        Self {
            scripts: Mutex::new(scripts),
            delays: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn with_delay(self, stage: StageName, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(stage, delay);
        self
    }

    pub fn failing(self, stage: StageName, reason: &str) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(stage, Script::Fail(reason.to_string()));
        self
    }

    pub fn hanging(self, stage: StageName) -> Self {
        self.scripts.lock().unwrap().insert(stage, Script::Hang);
        self
    }

    pub fn unreachable(self) -> Self {
        self.reachable.store(false, Ordering::SeqCst);
        self
    }

    /// Hold calls of `stage` until the returned gate is notified
    pub fn gate(&self, stage: StageName) -> Arc<Notify> {
        Arc::clone(
            self.gates
                .lock()
                .unwrap()
                .entry(stage)
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    pub fn log(&self) -> Vec<CallEvent> {
        self.log.lock().unwrap().clone()
    }

    /// Stages in invocation order
    pub fn invocations(&self) -> Vec<StageName> {
        self.log()
            .into_iter()
            .filter_map(|event| match event {
                CallEvent::Started(stage) => Some(stage),
                CallEvent::Finished(_) => None,
            })
            .collect()
    }

    pub fn invocation_count(&self, stage: StageName) -> usize {
        self.invocations().iter().filter(|s| **s == stage).count()
    }

    /// Context a stage was last invoked with
    pub fn context_for(&self, stage: StageName) -> Option<SessionContext> {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, _)| *s == stage)
            .map(|(_, context)| context.clone())
    }

    /// Position of an entry in the call log
    pub fn position(&self, event: CallEvent) -> Option<usize> {
        self.log().iter().position(|e| *e == event)
    }

    /// Wait until `stage` has been invoked
    pub async fn wait_for_start(&self, stage: StageName, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        while self.invocation_count(stage) == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} was never invoked",
                stage
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MlAdapter for ScriptedAdapter {
    async fn invoke(&self, stage: StageName, context: &SessionContext) -> Result<Value, AdapterError> {
        self.log.lock().unwrap().push(CallEvent::Started(stage));
        self.contexts.lock().unwrap().push((stage, context.clone()));

        let gate = self.gates.lock().unwrap().get(&stage).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let delay = self.delays.lock().unwrap().get(&stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let script = self.scripts.lock().unwrap().get(&stage).cloned();
        let outcome = match script {
            Some(Script::Ready(payload)) => Ok(payload),
            Some(Script::Fail(reason)) => Err(AdapterError::Failed(reason)),
            Some(Script::Hang) => std::future::pending().await,
            None => Err(AdapterError::InvalidResponse(format!("no script for {}", stage))),
        };

        self.log.lock().unwrap().push(CallEvent::Finished(stage));
        outcome
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::Unavailable("connection refused".to_string()))
        }
    }
}
