use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use graph_flow::{Context, NextAction, Task, TaskResult};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::TaskError;
use crate::llm::{CompletionRequest, OutputSchema, structured_as};
use crate::metrics::{record_reflection, record_search_round};
use crate::prompts;
use crate::search::{SearchRequest, SearchResponse, fallback_sources, format_sources, unique_results};
use crate::services::ResearchServices;
use crate::state::{Queries, ReflectionOutput, keys, normalize_queries};
use crate::trace;

/// Input values every task reads from the session context.
struct SessionInput {
    project_description: String,
    schema: Value,
    requirements: Option<Value>,
}

async fn session_input(context: &Context) -> SessionInput {
    SessionInput {
        project_description: context
            .get(keys::PROJECT_DESCRIPTION)
            .await
            .unwrap_or_default(),
        schema: context
            .get(keys::EXTRACTION_SCHEMA)
            .await
            .unwrap_or_else(crate::state::default_extraction_schema),
        requirements: context
            .get::<Value>(keys::USER_REQUIREMENTS)
            .await
            .filter(|value| !value.is_null()),
    }
}

pub struct GenerateQueriesTask {
    services: Arc<ResearchServices>,
}

impl GenerateQueriesTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for GenerateQueriesTask {
    fn id(&self) -> &str {
        "generate_queries"
    }

    #[instrument(name = "task.generate_queries", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let input = session_input(&context).await;
        let limit = self.services.limits.max_search_queries;

        let request = CompletionRequest::new(
            prompts::query_writer(
                &input.project_description,
                &input.schema,
                input.requirements.as_ref(),
                limit,
            ),
            prompts::QUERY_WRITER_USER,
        );
        let generated: Queries = structured_as(
            self.services.model.as_ref(),
            request,
            &Queries::output_schema(),
        )
        .await
        .map_err(|err| TaskError::new(self.id(), err))?;

        let queries = normalize_queries(generated.queries, limit as usize);
        if queries.is_empty() {
            return Err(TaskError::new(self.id(), "model produced no search queries").into());
        }

        info!(count = queries.len(), "search queries generated");
        debug!(queries = ?queries, "generated queries");

        context.set(keys::QUERIES, &queries).await;
        trace::record(&context, self.id(), format!("{} queries", queries.len())).await;

        Ok(TaskResult::new(
            Some(format!("Generated {} search queries", queries.len())),
            NextAction::ContinueAndExecute,
        ))
    }
}

pub struct ResearchTask {
    services: Arc<ResearchServices>,
}

impl ResearchTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }

    /// Search every query concurrently; any failure fails the whole round.
    async fn search_all(&self, queries: &[String]) -> Result<Vec<SearchResponse>, String> {
        let settings = &self.services.search_settings;
        let searches = queries.iter().map(|query| {
            self.services.search.search(SearchRequest {
                query: query.clone(),
                max_results: self.services.limits.max_search_results,
                include_raw_content: settings.include_raw_content,
                topic: settings.topic.clone(),
            })
        });

        join_all(searches)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| err.to_string())
    }
}

#[async_trait]
impl Task for ResearchTask {
    fn id(&self) -> &str {
        "research"
    }

    #[instrument(name = "task.research", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let input = session_input(&context).await;
        let queries: Vec<String> = context.get(keys::QUERIES).await.unwrap_or_default();
        let settings = &self.services.search_settings;

        let (content, new_sources, failed) = match self.search_all(&queries).await {
            Ok(responses) => {
                let urls: Vec<String> = unique_results(&responses)
                    .into_iter()
                    .map(|result| result.url.clone())
                    .collect();
                let content = format_sources(
                    &responses,
                    settings.max_tokens_per_source,
                    settings.include_raw_content,
                );
                (content, urls, false)
            }
            Err(error) => {
                warn!(%error, "search failed; taking notes from general knowledge");
                (fallback_sources(&error), Vec::new(), true)
            }
        };
        record_search_round(queries.len(), failed);
        context.set(keys::SEARCH_FAILED, failed).await;

        let request = CompletionRequest::prompt(prompts::info(
            &input.project_description,
            &input.schema,
            &content,
            input.requirements.as_ref(),
        ));
        let note = self
            .services
            .model
            .complete(request)
            .await
            .map_err(|err| TaskError::new(self.id(), err))?;

        let mut notes: Vec<String> = context.get(keys::NOTES).await.unwrap_or_default();
        notes.push(note);
        context.set(keys::NOTES, &notes).await;

        let mut sources: Vec<String> = context.get(keys::SOURCES).await.unwrap_or_default();
        let before = sources.len();
        for url in new_sources {
            if !sources.contains(&url) {
                sources.push(url);
            }
        }
        let added = sources.len() - before;
        context.set(keys::SOURCES, &sources).await;

        info!(
            queries = queries.len(),
            new_sources = added,
            notes = notes.len(),
            search_failed = failed,
            "research round completed"
        );
        let summary = if failed {
            format!("{} queries, search unavailable", queries.len())
        } else {
            format!("{} queries, {added} new sources", queries.len())
        };
        trace::record(&context, self.id(), summary.clone()).await;

        Ok(TaskResult::new(
            Some(summary),
            NextAction::ContinueAndExecute,
        ))
    }
}

pub struct ExtractTask {
    services: Arc<ResearchServices>,
}

impl ExtractTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for ExtractTask {
    fn id(&self) -> &str {
        "extract"
    }

    #[instrument(name = "task.extract", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let input = session_input(&context).await;
        let notes: Vec<String> = context.get(keys::NOTES).await.unwrap_or_default();

        let request = CompletionRequest::new(
            prompts::extraction(&input.schema, &prompts::format_notes(&notes)),
            prompts::EXTRACTION_USER,
        );
        let info = self
            .services
            .model
            .structured(request, &OutputSchema::from_json_schema(&input.schema))
            .await
            .map_err(|err| TaskError::new(self.id(), err))?;

        let fields = info.as_object().map(|map| map.len()).unwrap_or(0);
        info!(notes = notes.len(), fields, "extracted structured info");

        context.set(keys::INFO, &info).await;
        trace::record(&context, self.id(), format!("{fields} top-level fields")).await;

        Ok(TaskResult::new(
            Some("Extracted recommendations from notes".to_string()),
            NextAction::ContinueAndExecute,
        ))
    }
}

pub struct ReflectionTask {
    services: Arc<ResearchServices>,
}

impl ReflectionTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }
}

/// Whether another research round should follow an unsatisfactory reflection.
pub fn should_continue(satisfactory: bool, steps_taken: u8, max_reflection_steps: u8) -> bool {
    !satisfactory && steps_taken <= max_reflection_steps
}

#[async_trait]
impl Task for ReflectionTask {
    fn id(&self) -> &str {
        "reflection"
    }

    #[instrument(name = "task.reflection", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let input = session_input(&context).await;
        let info: Value = context.get(keys::INFO).await.unwrap_or(Value::Null);
        let mut steps_taken: u8 = context.get(keys::STEPS_TAKEN).await.unwrap_or(0);

        let request = CompletionRequest::new(
            prompts::reflection(&input.schema, &info),
            prompts::REFLECTION_USER,
        );
        let verdict: ReflectionOutput = structured_as(
            self.services.model.as_ref(),
            request,
            &ReflectionOutput::output_schema(),
        )
        .await
        .map_err(|err| TaskError::new(self.id(), err))?;

        record_reflection(verdict.is_satisfactory);
        context.set(keys::SATISFACTORY, verdict.is_satisfactory).await;
        context.set(keys::MISSING, &verdict.missing_components).await;
        context.set(keys::REASONING, &verdict.reasoning).await;

        if !verdict.is_satisfactory {
            steps_taken = steps_taken.saturating_add(1);
            let follow_up = normalize_queries(
                verdict.search_queries,
                self.services.limits.max_search_queries as usize,
            );
            if follow_up.is_empty() {
                warn!("reflection flagged gaps without follow-up queries; reusing previous queries");
            } else {
                context.set(keys::QUERIES, &follow_up).await;
            }
        }
        context.set(keys::STEPS_TAKEN, steps_taken).await;

        let again = should_continue(
            verdict.is_satisfactory,
            steps_taken,
            self.services.limits.max_reflection_steps,
        );
        context.set_sync(keys::CONTINUE, again);

        info!(
            satisfactory = verdict.is_satisfactory,
            steps_taken,
            missing = ?verdict.missing_components,
            continue_research = again,
            "reflection completed"
        );
        let message = if verdict.is_satisfactory {
            "satisfactory".to_string()
        } else {
            format!("gaps: {}", verdict.missing_components.join(", "))
        };
        trace::record(&context, self.id(), message).await;

        Ok(TaskResult::new(
            Some(verdict.reasoning),
            NextAction::ContinueAndExecute,
        ))
    }
}

#[derive(Default)]
pub struct FinalizeTask;

#[async_trait]
impl Task for FinalizeTask {
    fn id(&self) -> &str {
        "finalize"
    }

    #[instrument(name = "task.finalize", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let info: Value = context.get(keys::INFO).await.unwrap_or(Value::Null);
        let satisfactory: bool = context.get(keys::SATISFACTORY).await.unwrap_or(false);

        info!(satisfactory, "research finished");
        trace::record(
            &context,
            self.id(),
            if satisfactory {
                "complete"
            } else {
                "stopped with open gaps"
            },
        )
        .await;

        let rendered = serde_json::to_string_pretty(&info).unwrap_or_else(|_| info.to_string());
        Ok(TaskResult::new(Some(rendered), NextAction::End))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_follows_reflection_budget() {
        assert!(!should_continue(true, 0, 1));
        assert!(should_continue(false, 1, 1));
        assert!(!should_continue(false, 2, 1));
        assert!(!should_continue(false, 1, 0));
    }
}
