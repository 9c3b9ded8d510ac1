use crate::compose::ComposedMessage;
use crate::config::RunConfiguration;
use crate::sasl::{select_mechanism, Credentials};
use async_trait::async_trait;
use rfc5321::{
    BoxedAsyncReadAndWrite, ClientError, SmtpClient, SmtpClientTimeouts, TlsOptions, TlsStatus,
};
use std::io::Write;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// The name we use to identify ourselves in EHLO and HELO
const EHLO_NAME: &str = "localhost";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("error connecting to server {address}")]
    ConnectFailed {
        address: String,
        #[source]
        source: ClientError,
    },
    #[error("error negotiating STARTTLS with {address}: {reason}")]
    TlsFailed { address: String, reason: String },
    #[error("error authenticating to server as {username:?} using {mechanism}")]
    AuthFailed {
        username: String,
        mechanism: &'static str,
        #[source]
        source: ClientError,
    },
    #[error(
        "error authenticating to server: none of the advertised mechanisms \
         {advertised:?} are supported (supported: PLAIN, LOGIN)"
    )]
    UnsupportedAuthMechanism { advertised: String },
    #[error("error sending email")]
    SendFailed(#[source] ClientError),
}

/// Establishes the transport for an SMTP session
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> std::io::Result<BoxedAsyncReadAndWrite>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> std::io::Result<BoxedAsyncReadAndWrite> {
        let stream = TcpStream::connect(address).await?;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

fn progress(label: &str) {
    print!("{label}... ");
    std::io::stdout().flush().ok();
}

fn done() {
    println!("done!");
}

pub async fn dispatch(
    config: &RunConfiguration,
    message: &ComposedMessage,
) -> Result<(), DispatchError> {
    dispatch_with(&TcpConnector, config, message).await
}

/// Deliver `message` to the configured server: connect, upgrade
/// to TLS when offered, authenticate when required, then send.
/// The session is abandoned at the first failure.
pub async fn dispatch_with<C: Connector + ?Sized>(
    connector: &C,
    config: &RunConfiguration,
    message: &ComposedMessage,
) -> Result<(), DispatchError> {
    let address = config.server_address.as_str();
    let timeouts = SmtpClientTimeouts::default();
    let connect_failed = |source: ClientError| DispatchError::ConnectFailed {
        address: address.to_string(),
        source,
    };

    tracing::debug!("connecting to {address}");
    let stream = match timeout(timeouts.connect_timeout, connector.connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(connect_failed(err.into())),
        Err(_) => {
            return Err(connect_failed(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", timeouts.connect_timeout),
            ))))
        }
    };

    let mut client = SmtpClient::with_stream(stream, address, timeouts);

    let banner = client
        .read_response(None, timeouts.banner_timeout)
        .await
        .map_err(connect_failed)?;
    if banner.code != 220 {
        return Err(connect_failed(ClientError::Rejected(banner)));
    }
    tracing::debug!("banner: {}", banner.to_single_line());

    match client.ehlo(EHLO_NAME).await.map(|_| ()) {
        Ok(()) => {}
        // RFC 5321 4.1.4: a server that does not support EHLO
        // answers 500 or 502, and the client may fall back to HELO
        Err(ClientError::Rejected(response)) if matches!(response.code, 500 | 502) => {
            tracing::warn!(
                "{address} rejected EHLO ({}); retrying with HELO",
                response.to_single_line()
            );
            client.helo(EHLO_NAME).await.map_err(connect_failed)?;
        }
        Err(err) => return Err(connect_failed(err)),
    }

    if client.capabilities().contains_key("STARTTLS") {
        let tls_failed = |reason: String| DispatchError::TlsFailed {
            address: address.to_string(),
            reason,
        };

        progress("STARTTLS");
        let options = TlsOptions {
            insecure: config.skip_tls_verify,
            alt_name: None,
        };
        match client.starttls(options).await {
            Ok(TlsStatus::Info(info)) => {
                tracing::debug!(
                    "TLS negotiated {} {}",
                    info.protocol_version,
                    info.cipher
                );
            }
            Ok(TlsStatus::FailedHandshake(reason)) => return Err(tls_failed(reason)),
            Err(err) => return Err(tls_failed(format!("{err:#}"))),
        }
        client
            .ehlo(EHLO_NAME)
            .await
            .map_err(|err| tls_failed(format!("{err:#}")))?;
        done();
    } else {
        tracing::warn!("{address} does not offer STARTTLS; continuing without encryption");
    }

    let advertised_auth = client
        .capabilities()
        .get("AUTH")
        .map(|cap| cap.param.clone().unwrap_or_default());

    match advertised_auth {
        Some(advertised) => {
            let credentials = Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
            };
            let mechanism = select_mechanism(&advertised, &credentials)
                .ok_or_else(|| DispatchError::UnsupportedAuthMechanism { advertised })?;

            progress(&format!("AUTH: {}", mechanism.name()));
            mechanism
                .authenticate(&mut client)
                .await
                .map_err(|source| DispatchError::AuthFailed {
                    username: config.username.clone(),
                    mechanism: mechanism.name(),
                    source,
                })?;
            done();
        }
        None => {
            tracing::info!("{address} does not offer AUTH; sending without authenticating");
        }
    }

    progress("Sending test email");
    let response = client
        .send_mail(
            message.sender.clone(),
            message.recipient.clone(),
            &message.data,
        )
        .await
        .map_err(DispatchError::SendFailed)?;
    done();
    tracing::info!("message accepted: {}", response.to_single_line());

    if let Err(err) = client.quit().await {
        tracing::debug!("error during QUIT: {err:#}");
    }

    Ok(())
}
