use crate::logging::{SessionLog, SessionLogInput};
use crate::services::ResearchServices;
use crate::state::{ResearchInput, keys, missing_required};
use crate::tasks::{ExtractTask, FinalizeTask, GenerateQueriesTask, ReflectionTask, ResearchTask};
use crate::trace::{TraceCollector, TraceEvent, TraceSummary, persist_trace};
use anyhow::{Result, anyhow};
use graph_flow::{
    ExecutionStatus, FlowRunner, GraphBuilder, InMemorySessionStorage, Session, SessionStorage,
    Task,
};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// The tasks wired into the research graph.
#[derive(Clone)]
pub struct ResearchGraphTasks {
    pub generate_queries: Arc<GenerateQueriesTask>,
    pub research: Arc<ResearchTask>,
    pub extract: Arc<ExtractTask>,
    pub reflection: Arc<ReflectionTask>,
    pub finalize: Arc<FinalizeTask>,
}

impl ResearchGraphTasks {
    fn new(services: Arc<ResearchServices>) -> Self {
        Self {
            generate_queries: Arc::new(GenerateQueriesTask::new(services.clone())),
            research: Arc::new(ResearchTask::new(services.clone())),
            extract: Arc::new(ExtractTask::new(services.clone())),
            reflection: Arc::new(ReflectionTask::new(services)),
            finalize: Arc::new(FinalizeTask),
        }
    }
}

/// generate_queries -> research -> extract -> reflection -> (research | finalize)
pub fn build_graph(services: Arc<ResearchServices>) -> (Arc<graph_flow::Graph>, ResearchGraphTasks) {
    let tasks = ResearchGraphTasks::new(services);

    let builder = GraphBuilder::new("stackresearch_workflow")
        .add_task(tasks.generate_queries.clone())
        .add_task(tasks.research.clone())
        .add_task(tasks.extract.clone())
        .add_task(tasks.reflection.clone())
        .add_task(tasks.finalize.clone())
        .add_edge(tasks.generate_queries.id(), tasks.research.id())
        .add_edge(tasks.research.id(), tasks.extract.id())
        .add_edge(tasks.extract.id(), tasks.reflection.id())
        .add_conditional_edge(
            tasks.reflection.id(),
            |ctx| ctx.get_sync::<bool>(keys::CONTINUE).unwrap_or(false),
            tasks.research.id(),
            tasks.finalize.id(),
        )
        .set_start_task(tasks.generate_queries.id());

    (Arc::new(builder.build()), tasks)
}

/// Options for running a research session.
pub struct SessionOptions {
    pub input: ResearchInput,
    pub session_id: Option<String>,
    pub trace_dir: Option<PathBuf>,
    pub session_log: Option<SessionLog>,
}

impl SessionOptions {
    pub fn new(input: ResearchInput) -> Self {
        Self {
            input,
            session_id: None,
            trace_dir: None,
            session_log: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    pub fn with_session_log(mut self, log: SessionLog) -> Self {
        self.session_log = Some(log);
        self
    }
}

/// Everything a finished session produced.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchOutcome {
    pub session_id: String,
    /// Schema-shaped recommendation; the primary output.
    pub info: Value,
    pub is_satisfactory: bool,
    pub reflection_steps_taken: u8,
    pub missing_components: Vec<String>,
    /// Required top-level schema keys absent from `info`.
    pub missing_required: Vec<String>,
    pub reasoning: String,
    pub search_queries: Vec<String>,
    pub sources: Vec<String>,
    pub notes_count: usize,
    pub search_failed: bool,
    pub trace_events: Vec<TraceEvent>,
    pub trace_summary: TraceSummary,
    pub trace_path: Option<PathBuf>,
}

impl ResearchOutcome {
    fn from_session(session_id: &str, session: &Session, schema: &Value) -> Self {
        let context = &session.context;
        let info: Value = context.get_sync(keys::INFO).unwrap_or(Value::Null);
        let trace_events: Vec<TraceEvent> = context.get_sync(keys::TRACE).unwrap_or_default();
        let notes: Vec<String> = context.get_sync(keys::NOTES).unwrap_or_default();

        Self {
            session_id: session_id.to_string(),
            missing_required: missing_required(schema, &info),
            info,
            is_satisfactory: context.get_sync(keys::SATISFACTORY).unwrap_or(false),
            reflection_steps_taken: context.get_sync(keys::STEPS_TAKEN).unwrap_or(0),
            missing_components: context.get_sync(keys::MISSING).unwrap_or_default(),
            reasoning: context.get_sync(keys::REASONING).unwrap_or_default(),
            search_queries: context.get_sync(keys::QUERIES).unwrap_or_default(),
            sources: context.get_sync(keys::SOURCES).unwrap_or_default(),
            notes_count: notes.len(),
            search_failed: context.get_sync(keys::SEARCH_FAILED).unwrap_or(false),
            trace_summary: TraceCollector::from_events(trace_events.clone()).summary(),
            trace_events,
            trace_path: None,
        }
    }

    pub fn explain_markdown(&self) -> String {
        self.trace_summary.render_markdown()
    }

    pub fn explain_mermaid(&self) -> String {
        self.trace_summary.render_mermaid()
    }

    pub fn explain_graphviz(&self) -> String {
        self.trace_summary.render_graphviz()
    }
}

/// Run the research graph end-to-end for `options.input`.
pub async fn run_research_session(
    services: Arc<ResearchServices>,
    options: SessionOptions,
) -> Result<ResearchOutcome> {
    options.input.validate()?;
    services.limits.validate()?;

    let (graph, tasks) = build_graph(services);
    let storage = Arc::new(InMemorySessionStorage::new());
    let runner = FlowRunner::new(graph, storage.clone());

    let session_id = options
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let session = Session::new_from_task(session_id.clone(), tasks.generate_queries.id());

    let input = &options.input;
    session
        .context
        .set(keys::PROJECT_DESCRIPTION, input.project_description.clone())
        .await;
    session
        .context
        .set(keys::EXTRACTION_SCHEMA, input.extraction_schema.clone())
        .await;
    session
        .context
        .set(
            keys::USER_REQUIREMENTS,
            input.user_requirements.clone().unwrap_or(Value::Null),
        )
        .await;
    session.context.set(keys::STEPS_TAKEN, 0u8).await;

    storage
        .save(session)
        .await
        .map_err(|err| anyhow!("failed to persist session: {err}"))?;

    info!(session_id = %session_id, "starting research session");

    loop {
        let result = runner
            .run(&session_id)
            .await
            .map_err(|err| anyhow!("graph execution failure: {err}"))?;

        match result.status {
            ExecutionStatus::Completed => break,
            ExecutionStatus::WaitingForInput => continue,
            ExecutionStatus::Error(message) => return Err(anyhow!(message)),
        }
    }

    let session = storage
        .get(&session_id)
        .await
        .map_err(|err| anyhow!("failed to reload session: {err}"))?
        .ok_or_else(|| anyhow!("session missing after execution"))?;

    let mut outcome = ResearchOutcome::from_session(&session_id, &session, &input.extraction_schema);

    if let Some(dir) = options.trace_dir.as_ref() {
        match persist_trace(dir, &session_id, &outcome.trace_events) {
            Ok(path) => outcome.trace_path = Some(path),
            Err(err) => warn!(error = %err, "failed to persist trace"),
        }
    }

    if let Some(log) = options.session_log.as_ref() {
        let entry = SessionLogInput {
            session_id: session_id.clone(),
            project_description: input.project_description.clone(),
            info: outcome.info.to_string(),
            satisfactory: outcome.is_satisfactory,
            reflection_steps: outcome.reflection_steps_taken,
            missing_components: outcome.missing_components.clone(),
            sources: outcome.sources.clone(),
            trace_path: outcome
                .trace_path
                .as_ref()
                .map(|path| path.display().to_string()),
        };
        if let Err(err) = log.log_completion(entry) {
            warn!(error = %err, "failed to append session log");
        }
    }

    info!(
        session_id = %session_id,
        satisfactory = outcome.is_satisfactory,
        reflection_steps = outcome.reflection_steps_taken,
        sources = outcome.sources.len(),
        "research session completed"
    );

    Ok(outcome)
}
