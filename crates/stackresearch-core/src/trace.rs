use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use graph_flow::Context;
use serde::{Deserialize, Serialize};

use crate::state::keys;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub task_id: String,
    pub message: String,
    pub timestamp_ms: u128,
}

impl TraceEvent {
    pub fn new(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            task_id: task_id.into(),
            message: message.into(),
            timestamp_ms,
        }
    }
}

/// Append a trace event to the session context.
pub(crate) async fn record(context: &Context, task_id: &str, message: impl Into<String>) {
    let mut events: Vec<TraceEvent> = context.get(keys::TRACE).await.unwrap_or_default();
    events.push(TraceEvent::new(task_id, message));
    context.set(keys::TRACE, &events).await;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn from_events(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }

    pub fn record(&mut self, task_id: impl Into<String>, message: impl Into<String>) {
        self.events.push(TraceEvent::new(task_id, message));
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    /// Number of times `task_id` ran.
    pub fn visits(&self, task_id: &str) -> usize {
        self.events
            .iter()
            .filter(|event| event.task_id == task_id)
            .count()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                task_id: event.task_id.clone(),
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }
        let mut output = String::from("### Research Trace\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. {} -> {}", step.index, step.task_id, step.message);
        }
        output
    }

    /// Flowchart of the executed path; repeated research rounds show up as repeated nodes.
    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no trace events captured\n".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for step in &self.steps {
            let label = sanitize_mermaid(&format!("{}: {}", step.task_id, step.message));
            let _ = writeln!(output, "  step{}[\"{label}\"]", step.index);
        }
        for pair in self.steps.windows(2) {
            let _ = writeln!(output, "  step{} --> step{}", pair[0].index, pair[1].index);
        }
        output
    }

    /// Left-to-right digraph of the executed path, one node per step.
    pub fn render_graphviz(&self) -> String {
        if self.steps.is_empty() {
            return "digraph Trace {\n  // no trace events captured\n}\n".to_string();
        }

        let mut output = String::from("digraph Trace {\n  rankdir=LR;\n  node [shape=box];\n");
        for step in &self.steps {
            let label = escape_graphviz(&format!("{}: {}", step.task_id, step.message));
            let _ = writeln!(output, "  step{} [label=\"{label}\"];", step.index);
        }
        for pair in self.steps.windows(2) {
            let _ = writeln!(output, "  step{} -> step{};", pair[0].index, pair[1].index);
        }
        output.push_str("}\n");
        output
    }
}

fn escape_graphviz(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', " ")
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    session_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{session_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}
