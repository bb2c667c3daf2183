use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Core error type for StackResearch.
#[derive(Debug, Error)]
pub enum StackResearchError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("http transport error: {0}")]
    Http(String),
    #[error("{service} returned status {status}: {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to parse structured output: {0}")]
    Parse(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StackResearchError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

impl From<reqwest::Error> for StackResearchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Error representing a task failure within the orchestration graph.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub task: String,
    pub reason: String,
}

impl TaskError {
    pub fn new(task: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            task: task.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task `{}` failed: {}", self.task, self.reason)
    }
}

impl std::error::Error for TaskError {}

impl From<TaskError> for graph_flow::GraphError {
    fn from(err: TaskError) -> Self {
        graph_flow::GraphError::TaskExecutionFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_names_the_task() {
        let err = TaskError::new("reflection", "model unavailable");
        assert_eq!(err.to_string(), "task `reflection` failed: model unavailable");
    }

    #[test]
    fn api_error_mentions_service_and_status() {
        let err = StackResearchError::Api {
            service: "tavily",
            status: 429,
            body: "slow down".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("tavily"));
        assert!(rendered.contains("429"));
    }
}
