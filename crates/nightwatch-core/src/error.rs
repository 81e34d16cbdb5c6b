use thiserror::Error;

#[derive(Debug, Error)]
pub enum NightwatchError {
    #[error("not initialized: run 'nightwatch init'")]
    NotInitialized,

    #[error("backlog not found: {0}")]
    BacklogNotFound(String),

    #[error("story not found: {0}")]
    StoryNotFound(String),

    #[error("duplicate story id: {0}")]
    DuplicateStory(String),

    #[error("story '{story}' depends on unknown story '{dependency}'")]
    UnknownDependency { story: String, dependency: String },

    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("queue lock busy: {0}")]
    LockBusy(String),

    #[error("invalid command '{0}': missing story id")]
    InvalidCommand(String),

    #[error("executor '{executor}' failed: {message}")]
    Executor { executor: String, message: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NightwatchError>;
