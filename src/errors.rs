use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PermError {
    #[error("Group `{0}` does not exist")]
    #[diagnostic(
        code(paladin::not_found),
        help("List the known groups with: paladin group list")
    )]
    NotFound(String),

    #[error("Group `{0}` is protected and cannot be deleted")]
    #[diagnostic(code(paladin::protected))]
    Protected(String),

    #[error("Group `{0}` already exists")]
    #[diagnostic(code(paladin::already_exists))]
    AlreadyExists(String),

    #[error("Cyclic group inheritance: {0}")]
    #[diagnostic(
        code(paladin::cyclic_inheritance),
        help("A group may not inherit, directly or through its parents, from itself")
    )]
    CyclicInheritance(String),

    #[error("An external permissions authority is active; use its tooling to change permissions")]
    #[diagnostic(code(paladin::authority_active))]
    AuthorityActive,

    #[error("External authority error: {0}")]
    #[diagnostic(code(paladin::authority))]
    Authority(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(paladin::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Config error: {0}")]
    #[diagnostic(code(paladin::config))]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    #[diagnostic(code(paladin::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(paladin::serde))]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    #[diagnostic(code(paladin::other))]
    Other(String),
}

impl From<reqwest::Error> for PermError {
    fn from(value: reqwest::Error) -> Self {
        PermError::Authority(value.to_string())
    }
}
