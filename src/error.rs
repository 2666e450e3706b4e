use thiserror::Error;

use crate::{config::LoadError, infra::error::InfraError, queue::RenderFailure};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Render(#[from] RenderFailure),
}
