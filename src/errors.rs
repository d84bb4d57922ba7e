//! Top-level error type unifying the per-concern errors.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::executor::ExecutionError;
use crate::jsonpath::JsonPathError;
use crate::llm::LlmError;
use crate::plan::PlanError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    JsonPath(#[from] JsonPathError),
}

pub type EngineResult<T> = Result<T, EngineError>;
