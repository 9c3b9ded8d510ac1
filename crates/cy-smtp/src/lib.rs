pub mod compose;
pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(test)]
mod mock_server;
pub mod sasl;

pub use compose::{compose, compose_at, ComposeError, ComposedMessage};
pub use config::{resolve, ConfigError, Opt, RunConfiguration};
pub use dispatch::{dispatch, dispatch_with, Connector, DispatchError, TcpConnector};
pub use error::Error;

/// Resolve the configuration, compose the test message and deliver it.
/// Each stage runs only if the previous one succeeded, so nothing
/// touches the network until the configuration and both addresses
/// are known to be good.
pub async fn run(opt: &Opt) -> Result<(), Error> {
    run_with(&TcpConnector, opt).await
}

pub async fn run_with<C: Connector + ?Sized>(connector: &C, opt: &Opt) -> Result<(), Error> {
    let config = resolve(opt)?;
    let message = compose(&config.from_address, &config.to_address)?;
    dispatch_with(connector, &config, &message).await?;
    Ok(())
}
