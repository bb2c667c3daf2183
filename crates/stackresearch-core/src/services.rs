use std::sync::Arc;

use tracing::info;

use crate::StackResearchError;
use crate::config::{Config, ResearchLimits, SearchConfig};
use crate::llm::{AnthropicClient, LanguageModel};
use crate::rate_limit::RateLimiter;
use crate::search::{SearchProvider, TavilyClient};

/// Everything the graph tasks need: the model, the search provider and the limits.
#[derive(Clone)]
pub struct ResearchServices {
    pub model: Arc<dyn LanguageModel>,
    pub search: Arc<dyn SearchProvider>,
    pub limits: ResearchLimits,
    pub search_settings: SearchConfig,
}

impl ResearchServices {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn SearchProvider>,
        limits: ResearchLimits,
    ) -> Self {
        Self {
            model,
            search,
            limits,
            search_settings: SearchConfig::default(),
        }
    }

    pub fn with_search_settings(mut self, settings: SearchConfig) -> Self {
        self.search_settings = settings;
        self
    }

    /// Build the Anthropic and Tavily clients from `config`.
    ///
    /// Both API keys are resolved up front so a missing secret fails before any graph work.
    pub fn from_config(config: &Config) -> Result<Self, StackResearchError> {
        config.validate()?;
        let llm_key = config.llm_api_key()?;
        let search_key = config.search_api_key()?;

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let model = AnthropicClient::new(config.llm.clone(), llm_key, limiter)?;
        let search = TavilyClient::new(&config.search, search_key)?;

        info!(
            model = %config.llm.model,
            max_search_queries = config.research.max_search_queries,
            max_search_results = config.research.max_search_results,
            max_reflection_steps = config.research.max_reflection_steps,
            "research services ready"
        );

        Ok(Self {
            model: Arc::new(model),
            search: Arc::new(search),
            limits: config.research,
            search_settings: config.search.clone(),
        })
    }
}
