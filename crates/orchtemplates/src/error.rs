use orchcore::{ConfigurationError, FlowError, ValidationError};
use thiserror::Error;

/// Why a template could not produce a graph
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<TemplateError> for FlowError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::Configuration(e) => FlowError::Configuration(e),
            TemplateError::Validation(e) => FlowError::Validation(e),
        }
    }
}
