//! StackResearch core: a research agent built directly on top of `graph_flow`.
//!
//! The graph plans web-search queries, takes notes from Tavily results with an
//! Anthropic model, extracts a recommendation following a JSON schema, and
//! reflects on it, looping back to research while gaps remain and the
//! reflection budget allows.

mod config;
mod error;
mod llm;
mod logging;
mod metrics;
mod prompts;
mod rate_limit;
mod search;
mod security;
mod services;
mod state;
mod tasks;
mod telemetry;
mod trace;
mod workflow;

pub use config::{
    Config, ConfigLoader, LlmConfig, LoggingConfig, RateLimitConfig, ResearchLimits, SearchConfig,
};
pub use error::{StackResearchError, TaskError};
pub use llm::{
    AnthropicClient, ChatMessage, CompletionRequest, LanguageModel, OutputSchema, structured_as,
};
pub use logging::{SessionLog, SessionLogInput, remove_session_logs};
pub use metrics::init_metrics_from_env;
pub use prompts::format_notes;
pub use rate_limit::RateLimiter;
pub use search::{
    SearchProvider, SearchRequest, SearchResponse, SearchResult, TavilyClient, fallback_sources,
    format_sources,
};
pub use security::{SecretValue, env_present, require_env};
pub use services::ResearchServices;
pub use state::{
    Queries, ReflectionOutput, ResearchInput, default_extraction_schema, missing_required,
};
pub use tasks::{
    ExtractTask, FinalizeTask, GenerateQueriesTask, ReflectionTask, ResearchTask, should_continue,
};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{
    ResearchGraphTasks, ResearchOutcome, SessionOptions, build_graph, run_research_session,
};
