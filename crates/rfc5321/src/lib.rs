pub mod client;
pub mod client_types;
pub mod command;
pub mod tls;
pub mod traits;

pub use client::*;
pub use client_types::*;
pub use command::*;
pub use tls::*;
pub use tokio_rustls;
pub use traits::*;
