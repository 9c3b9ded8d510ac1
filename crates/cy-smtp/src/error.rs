use crate::compose::ComposeError;
use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use thiserror::Error;

/// Any failure that ends a run
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
