use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use stackresearch_core::{
    CompletionRequest, LanguageModel, OutputSchema, ResearchInput, ResearchLimits,
    ResearchServices, SearchProvider, SearchRequest, SearchResponse, SearchResult, SessionLog,
    SessionOptions, StackResearchError, TraceCollector, run_research_session,
};

/// Scripted model: answers by output schema name and records every prompt it sees.
#[derive(Default)]
struct ScriptedModel {
    queries: Vec<String>,
    verdicts: Mutex<VecDeque<Value>>,
    fail_queries: bool,
    notes_prompts: Mutex<Vec<String>>,
    extraction_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(queries: &[&str], verdicts: Vec<Value>) -> Self {
        Self {
            queries: queries.iter().map(|q| q.to_string()).collect(),
            verdicts: Mutex::new(verdicts.into()),
            ..Self::default()
        }
    }
}

fn satisfied() -> Value {
    json!({
        "is_satisfactory": true,
        "missing_components": [],
        "search_queries": [],
        "reasoning": "complete"
    })
}

fn gaps(queries: &[&str]) -> Value {
    json!({
        "is_satisfactory": false,
        "missing_components": ["deployment"],
        "search_queries": queries,
        "reasoning": "deployment is unclear"
    })
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String, StackResearchError> {
        let prompt = request.messages[0].content.clone();
        let mut prompts = self.notes_prompts.lock().unwrap();
        prompts.push(prompt);
        Ok(format!("note {}", prompts.len()))
    }

    async fn structured(
        &self,
        request: CompletionRequest,
        output: &OutputSchema,
    ) -> Result<Value, StackResearchError> {
        match output.name.as_str() {
            "Queries" if self.fail_queries => {
                Err(StackResearchError::Http("connection reset".into()))
            }
            "Queries" => Ok(json!({ "queries": self.queries })),
            "ReflectionOutput" => Ok(self
                .verdicts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(satisfied)),
            _ => {
                self.extraction_prompts
                    .lock()
                    .unwrap()
                    .push(request.system.unwrap_or_default());
                Ok(json!({
                    "frontend": {"framework": "SvelteKit"},
                    "backend": {"framework": "Axum", "database": "Postgres"}
                }))
            }
        }
    }
}

#[derive(Default)]
struct RecordingSearch {
    fail: bool,
    requests: Mutex<Vec<SearchRequest>>,
}

#[async_trait]
impl SearchProvider for RecordingSearch {
    async fn search(&self, request: SearchRequest) -> Result<SearchResponse, StackResearchError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(StackResearchError::Api {
                service: "tavily",
                status: 500,
                body: "upstream down".into(),
            });
        }
        Ok(SearchResponse {
            query: request.query.clone(),
            results: vec![
                SearchResult {
                    title: "Shared article".into(),
                    url: "https://example.dev/shared".into(),
                    content: "shared".into(),
                    raw_content: Some("full text".into()),
                    score: Some(0.7),
                },
                SearchResult {
                    title: format!("About {}", request.query),
                    url: format!("https://example.dev/{}", request.query.replace(' ', "-")),
                    content: "specific".into(),
                    raw_content: None,
                    score: Some(0.5),
                },
            ],
        })
    }
}

fn services(
    model: Arc<ScriptedModel>,
    search: Arc<RecordingSearch>,
    limits: ResearchLimits,
) -> Arc<ResearchServices> {
    Arc::new(ResearchServices::new(model, search, limits))
}

fn input() -> ResearchInput {
    ResearchInput::new("A collaborative whiteboard for remote teams")
        .with_requirements(json!({"team": "two backend engineers"}))
}

#[tokio::test]
async fn satisfactory_first_pass_runs_each_stage_once() {
    let model = Arc::new(ScriptedModel::new(
        &["whiteboard realtime sync", "crdt libraries"],
        vec![satisfied()],
    ));
    let search = Arc::new(RecordingSearch::default());

    let outcome = run_research_session(
        services(model.clone(), search.clone(), ResearchLimits::default()),
        SessionOptions::new(input()).with_session_id("session-pass"),
    )
    .await
    .expect("workflow should succeed");

    assert_eq!(outcome.session_id, "session-pass");
    assert!(outcome.is_satisfactory);
    assert_eq!(outcome.reflection_steps_taken, 0);
    assert_eq!(outcome.info["backend"]["framework"], "Axum");
    assert!(outcome.missing_required.is_empty());
    assert_eq!(outcome.notes_count, 1);
    assert_eq!(
        outcome.sources,
        vec![
            "https://example.dev/shared",
            "https://example.dev/whiteboard-realtime-sync",
            "https://example.dev/crdt-libraries",
        ]
    );

    let requests = search.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.max_results == 3 && r.include_raw_content));

    let trace = TraceCollector::from_events(outcome.trace_events.clone());
    assert_eq!(trace.visits("generate_queries"), 1);
    assert_eq!(trace.visits("research"), 1);
    assert_eq!(trace.visits("reflection"), 1);
    assert_eq!(trace.visits("finalize"), 1);

    assert!(outcome.explain_markdown().contains("1. generate_queries -> "));
    assert!(outcome.explain_mermaid().contains("step1 --> step2"));
    assert!(outcome.explain_graphviz().contains("step1 -> step2;"));

    let notes_prompt = &model.notes_prompts.lock().unwrap()[0];
    assert!(notes_prompt.contains("Source Shared article:"));
    assert!(notes_prompt.contains("two backend engineers"));
}

#[tokio::test]
async fn unsatisfactory_reflection_loops_until_budget_is_spent() {
    let model = Arc::new(ScriptedModel::new(
        &["initial query"],
        vec![gaps(&["ci cd for whiteboards"]), gaps(&["monitoring tools"])],
    ));
    let search = Arc::new(RecordingSearch::default());

    let outcome = run_research_session(
        services(model.clone(), search.clone(), ResearchLimits::default()),
        SessionOptions::new(input()),
    )
    .await
    .expect("workflow should succeed");

    assert!(!outcome.is_satisfactory);
    assert_eq!(outcome.reflection_steps_taken, 2);
    assert_eq!(outcome.missing_components, vec!["deployment"]);
    assert_eq!(outcome.notes_count, 2);
    assert_eq!(outcome.search_queries, vec!["monitoring tools"]);

    let queried: Vec<String> = search
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.query.clone())
        .collect();
    assert_eq!(queried, vec!["initial query", "ci cd for whiteboards"]);

    let trace = TraceCollector::from_events(outcome.trace_events);
    assert_eq!(trace.visits("research"), 2);
    assert_eq!(trace.visits("extract"), 2);
    assert_eq!(trace.visits("reflection"), 2);

    let extraction = model.extraction_prompts.lock().unwrap();
    assert!(extraction[1].contains("Note: 1:"));
    assert!(extraction[1].contains("Note: 2:"));
}

#[tokio::test]
async fn zero_reflection_budget_stops_after_first_reflection() {
    let model = Arc::new(ScriptedModel::new(&["q"], vec![gaps(&["more"])]));
    let search = Arc::new(RecordingSearch::default());
    let limits = ResearchLimits::default().with_overrides(None, None, Some(0));

    let outcome = run_research_session(
        services(model, search.clone(), limits),
        SessionOptions::new(input()),
    )
    .await
    .expect("workflow should succeed");

    assert!(!outcome.is_satisfactory);
    assert_eq!(outcome.reflection_steps_taken, 1);
    assert_eq!(search.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn generated_queries_are_capped_by_configuration() {
    let model = Arc::new(ScriptedModel::new(
        &["a", "b", "c", "d", "e"],
        vec![satisfied()],
    ));
    let search = Arc::new(RecordingSearch::default());
    let limits = ResearchLimits::default().with_overrides(Some(2), Some(5), None);

    run_research_session(
        services(model, search.clone(), limits),
        SessionOptions::new(input()),
    )
    .await
    .expect("workflow should succeed");

    let requests = search.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.max_results == 5));
}

#[tokio::test]
async fn search_failure_falls_back_to_general_knowledge() {
    let model = Arc::new(ScriptedModel::new(&["q1", "q2"], vec![satisfied()]));
    let search = Arc::new(RecordingSearch {
        fail: true,
        ..RecordingSearch::default()
    });

    let outcome = run_research_session(
        services(model.clone(), search, ResearchLimits::default()),
        SessionOptions::new(input()),
    )
    .await
    .expect("search failures are not fatal");

    assert!(outcome.search_failed);
    assert!(outcome.sources.is_empty());
    assert_eq!(outcome.notes_count, 1);
    let prompt = &model.notes_prompts.lock().unwrap()[0];
    assert!(prompt.contains("Unable to perform live research due to an error"));
    assert!(prompt.contains("500"));
}

#[tokio::test]
async fn model_failure_aborts_the_session() {
    let model = Arc::new(ScriptedModel {
        fail_queries: true,
        ..ScriptedModel::new(&[], vec![])
    });
    let search = Arc::new(RecordingSearch::default());

    let result = run_research_session(
        services(model, search.clone(), ResearchLimits::default()),
        SessionOptions::new(input()),
    )
    .await;

    assert!(result.is_err());
    assert!(search.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn blank_project_description_is_rejected_up_front() {
    let model = Arc::new(ScriptedModel::new(&["q"], vec![]));
    let search = Arc::new(RecordingSearch::default());

    let result = run_research_session(
        services(model, search, ResearchLimits::default()),
        SessionOptions::new(ResearchInput::new("   ")),
    )
    .await;

    let err = result.expect_err("blank input must fail");
    assert!(err.to_string().contains("project description"));
}

#[tokio::test]
async fn trace_and_session_log_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new(&["q"], vec![satisfied()]));
    let search = Arc::new(RecordingSearch::default());

    let outcome = run_research_session(
        services(model, search, ResearchLimits::default()),
        SessionOptions::new(input())
            .with_session_id("logged")
            .with_trace_dir(dir.path().join("traces"))
            .with_session_log(SessionLog::new(dir.path().join("logs"), 0)),
    )
    .await
    .expect("workflow should succeed");

    let trace_path = outcome.trace_path.expect("trace persisted");
    assert!(trace_path.ends_with("logged.json"));
    assert!(trace_path.exists());

    let removed = SessionLog::new(dir.path().join("logs"), 0)
        .remove_session("logged")
        .unwrap();
    assert_eq!(removed, 1);
}
