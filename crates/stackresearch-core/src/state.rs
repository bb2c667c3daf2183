//! Inputs, structured model outputs and context keys of the research graph.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::StackResearchError;
use crate::llm::OutputSchema;

pub(crate) mod keys {
    pub const PROJECT_DESCRIPTION: &str = "input.project_description";
    pub const EXTRACTION_SCHEMA: &str = "input.extraction_schema";
    pub const USER_REQUIREMENTS: &str = "input.user_requirements";
    pub const QUERIES: &str = "research.queries";
    pub const NOTES: &str = "research.notes";
    pub const SOURCES: &str = "research.sources";
    pub const SEARCH_FAILED: &str = "research.search_failed";
    pub const INFO: &str = "extract.info";
    pub const SATISFACTORY: &str = "reflection.satisfactory";
    pub const STEPS_TAKEN: &str = "reflection.steps_taken";
    pub const MISSING: &str = "reflection.missing";
    pub const REASONING: &str = "reflection.reasoning";
    pub const CONTINUE: &str = "reflection.continue";
    pub const TRACE: &str = "trace.events";
}

static DEFAULT_EXTRACTION_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "title": "TechStackRecommendation",
        "description": "Recommended technology stack for a software application",
        "type": "object",
        "properties": {
            "frontend": {
                "type": "object",
                "properties": {
                    "framework": {
                        "type": "string",
                        "description": "Main frontend framework/library recommendation"
                    },
                    "ui_libraries": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Recommended UI component libraries and tools"
                    },
                    "justification": {
                        "type": "string",
                        "description": "Explanation for the frontend technology choices"
                    }
                },
                "required": ["framework"]
            },
            "backend": {
                "type": "object",
                "properties": {
                    "framework": {
                        "type": "string",
                        "description": "Main backend framework recommendation"
                    },
                    "database": {
                        "type": "string",
                        "description": "Recommended database solution"
                    },
                    "hosting": {
                        "type": "string",
                        "description": "Recommended hosting/cloud platform"
                    },
                    "justification": {
                        "type": "string",
                        "description": "Explanation for the backend technology choices"
                    }
                },
                "required": ["framework", "database"]
            },
            "additional_services": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "purpose": {"type": "string"},
                        "justification": {"type": "string"}
                    }
                },
                "description": "Additional services, APIs, or tools recommended"
            },
            "deployment": {
                "type": "object",
                "properties": {
                    "ci_cd": {
                        "type": "string",
                        "description": "Recommended CI/CD solution"
                    },
                    "monitoring": {
                        "type": "string",
                        "description": "Recommended monitoring and logging solutions"
                    }
                }
            },
            "estimated_complexity": {
                "type": "string",
                "enum": ["Low", "Medium", "High"],
                "description": "Estimated complexity of implementing this stack"
            }
        },
        "required": ["frontend", "backend"]
    })
});

/// The built-in `TechStackRecommendation` schema.
pub fn default_extraction_schema() -> Value {
    DEFAULT_EXTRACTION_SCHEMA.clone()
}

/// What the caller asks the agent to research.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchInput {
    pub project_description: String,
    #[serde(default = "default_extraction_schema")]
    pub extraction_schema: Value,
    #[serde(default)]
    pub user_requirements: Option<Value>,
}

impl ResearchInput {
    pub fn new(project_description: impl Into<String>) -> Self {
        Self {
            project_description: project_description.into(),
            extraction_schema: default_extraction_schema(),
            user_requirements: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.extraction_schema = schema;
        self
    }

    pub fn with_requirements(mut self, requirements: Value) -> Self {
        self.user_requirements = Some(requirements);
        self
    }

    pub fn validate(&self) -> Result<(), StackResearchError> {
        if self.project_description.trim().is_empty() {
            return Err(StackResearchError::InvalidConfiguration(
                "project description must not be empty".into(),
            ));
        }
        if !self.extraction_schema.is_object() {
            return Err(StackResearchError::InvalidConfiguration(
                "extraction schema must be a JSON object".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Queries {
    pub queries: Vec<String>,
}

impl Queries {
    pub fn output_schema() -> OutputSchema {
        OutputSchema::new(
            "Queries",
            "List of search queries.",
            json!({
                "type": "object",
                "properties": {
                    "queries": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "List of search queries."
                    }
                },
                "required": ["queries"]
            }),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectionOutput {
    pub is_satisfactory: bool,
    #[serde(default)]
    pub missing_components: Vec<String>,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl ReflectionOutput {
    pub fn output_schema() -> OutputSchema {
        OutputSchema::new(
            "ReflectionOutput",
            "Assessment of the recommended tech stack.",
            json!({
                "type": "object",
                "properties": {
                    "is_satisfactory": {
                        "type": "boolean",
                        "description": "True if all required technology choices are well specified and justified"
                    },
                    "missing_components": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "List of technology components that are missing or need better justification"
                    },
                    "search_queries": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "If is_satisfactory is False, provide 1-3 targeted search queries to find information about missing components"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Brief explanation of the assessment"
                    }
                },
                "required": ["is_satisfactory", "missing_components", "search_queries", "reasoning"]
            }),
        )
    }
}

/// Trim, drop blanks and duplicates, and keep at most `limit` queries.
pub fn normalize_queries(queries: Vec<String>, limit: usize) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(limit);
    for query in queries {
        let query = query.trim();
        if query.is_empty() || normalized.iter().any(|existing| existing == query) {
            continue;
        }
        if normalized.len() == limit {
            break;
        }
        normalized.push(query.to_string());
    }
    normalized
}

/// Top-level keys the schema marks `required` that `info` lacks or leaves null.
pub fn missing_required(schema: &Value, info: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|required| {
            required
                .iter()
                .filter_map(Value::as_str)
                .filter(|key| info.get(*key).is_none_or(Value::is_null))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
