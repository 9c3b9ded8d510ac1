use crate::client_types::*;
use crate::{AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, Domain, ForwardPath, ReversePath};
use crate::tls::TlsOptions;
use data_encoding::BASE64;
use memchr::memmem::Finder;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;
/// Presented in place of a peer name that cannot be expressed
/// as a rustls `ServerName` when the certificate is not verified
const UNVERIFIED_SERVER_NAME: &str = "localhost";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected: {}", .0.to_single_line())]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
    #[error("TLS Error: {0}")]
    Tls(#[from] rustls::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    }
}

impl SmtpClient {
    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The capabilities from the most recent EHLO, keyed by the
    /// upper-cased extension name
    pub fn capabilities(&self) -> &HashMap<String, EsmtpCapability> {
        &self.capabilities
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        })
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            sock.flush().await?;
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line)?;
        let mut response_builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line)?;
            response_builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = response_builder.build(command.map(|cmd| cmd.redacted()));

        tracing::trace!(
            "{}: {:?} response: {}",
            self.hostname,
            response.command,
            response.to_single_line()
        );

        Ok(response)
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!(
            "send->{}: {}",
            self.hostname,
            command.redacted().escape_debug()
        );
        match self.socket.as_mut() {
            Some(socket) => {
                match timeout(
                    command.client_timeout_request(&self.timeouts),
                    socket.write_all(line.as_bytes()),
                )
                .await
                {
                    Ok(result) => result.map_err(|_| ClientError::NotConnected),
                    Err(_) => Err(ClientError::TimeOutRequest {
                        command: command.clone(),
                        duration: command.client_timeout_request(&self.timeouts),
                    }),
                }
            }
            None => Err(ClientError::NotConnected),
        }
    }

    /// Issue a series of commands, and return the responses to
    /// those commands.
    ///
    /// If the server advertised the RFC 2920 PIPELINING extension,
    /// the commands are written one after the other before waiting
    /// to read any data, resulting in lower overall latency due
    /// to round-trip-times.
    ///
    /// If PIPELINING is not available, each command is written
    /// and the response read before attempting to write the next
    /// command.
    ///
    /// The number of returned responses may be smaller than the
    /// number of requested commands if there is an issue with
    /// the network connection, or if a command was refused
    /// without PIPELINING.
    async fn pipeline_commands(
        &mut self,
        commands: Vec<Command>,
    ) -> Vec<Result<Response, ClientError>> {
        let pipeline = self.capabilities.contains_key("PIPELINING");
        let mut results: Vec<Result<Response, ClientError>> = vec![];

        for cmd in &commands {
            if let Err(err) = self.write_command(cmd).await {
                results.push(Err(err));
                return results;
            }
            if !pipeline {
                // Immediately request the response if the server
                // doesn't support pipelining
                let response = self
                    .read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                    .await;
                let failed = !matches!(&response, Ok(r) if r.code < 400);
                results.push(response);
                if failed {
                    // Don't keep issuing commands into a transaction
                    // that the server has already refused
                    return results;
                }
            }
        }

        if pipeline {
            // Now read the responses effectively in a batch
            for cmd in &commands {
                results.push(
                    self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                        .await,
                );
            }
        }

        results
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self
            .send_command(&Command::Ehlo(Domain::Name(ehlo_name.to_string())))
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    /// Greet a server that does not understand EHLO.
    /// No extensions are available for the rest of the session.
    pub async fn helo(&mut self, helo_name: &str) -> Result<Response, ClientError> {
        let response = self
            .send_command(&Command::Helo(Domain::Name(helo_name.to_string())))
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        self.capabilities.clear();
        Ok(response)
    }

    pub async fn auth_plain(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> Result<(), ClientError> {
        // RFC 4616 says that the format is:
        // [authzid] NUL authcid NUL passwd
        let password = password.unwrap_or("");
        let payload = format!("\x00{username}\x00{password}");
        let payload = BASE64.encode(payload.as_bytes());

        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "PLAIN".to_string(),
                initial_response: Some(payload),
            })
            .await?;

        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }

        Ok(())
    }

    /// The non-standard but widely deployed LOGIN mechanism.
    /// The server prompts for the username and then the password,
    /// each as a 334 challenge, and the client answers each with
    /// a base64 encoded line.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<(), ClientError> {
        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "LOGIN".to_string(),
                initial_response: None,
            })
            .await?;
        if response.code != 334 {
            return Err(ClientError::Rejected(response));
        }

        let response = self
            .send_command(&Command::AuthResponse(BASE64.encode(username.as_bytes())))
            .await?;
        if response.code != 334 {
            return Err(ClientError::Rejected(response));
        }

        let response = self
            .send_command(&Command::AuthResponse(BASE64.encode(password.as_bytes())))
            .await?;
        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }

        Ok(())
    }

    /// Attempt TLS handshake.
    /// Returns Err for IO errors.
    /// On completion, return a status that will be:
    /// * FailedHandshake(handshake_error) - if the handshake failed
    /// * Info(tls_information) - if the handshake succeeded
    ///
    /// The EHLO capabilities are discarded, as RFC 3207 requires
    /// that the client issue EHLO again after a successful handshake.
    pub async fn starttls(&mut self, options: TlsOptions) -> Result<TlsStatus, ClientError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Err(ClientError::Rejected(resp));
        }

        let connector = options.build_tls_connector()?;
        let server_name = self.tls_server_name(&options)?;

        let socket = match self.socket.take() {
            Some(s) => s,
            None => return Err(ClientError::NotConnected),
        };
        self.capabilities.clear();

        match connector
            .connect(server_name, socket)
            .into_fallible()
            .await
        {
            Ok(stream) => {
                let mut tls_info = TlsInformation::default();
                let (_, conn) = stream.get_ref();
                tls_info.cipher = match conn.negotiated_cipher_suite() {
                    Some(suite) => suite.suite().as_str().unwrap_or("UNKNOWN").to_string(),
                    None => String::new(),
                };
                tls_info.protocol_version = match conn.protocol_version() {
                    Some(version) => version.as_str().unwrap_or("UNKNOWN").to_string(),
                    None => String::new(),
                };
                tracing::debug!("{}: TLS established {tls_info:?}", self.hostname);

                self.socket.replace(Box::new(stream));
                Ok(TlsStatus::Info(tls_info))
            }
            Err((err, stream)) => {
                self.socket.replace(stream);
                Ok(TlsStatus::FailedHandshake(format!("{err:#}")))
            }
        }
    }

    /// The name sent in SNI and, when verifying, matched against
    /// the certificate
    fn tls_server_name(&self, options: &TlsOptions) -> Result<ServerName<'static>, ClientError> {
        let name = options.alt_name.as_deref().unwrap_or(self.hostname.as_str());
        let invalid = || ClientError::InvalidDnsName(name.to_string());
        match ServerName::try_from(name) {
            Ok(server_name) => Ok(server_name.to_owned()),
            Err(_) if options.insecure => {
                tracing::debug!(
                    "{name} is not a valid TLS server name, presenting {UNVERIFIED_SERVER_NAME}"
                );
                ServerName::try_from(UNVERIFIED_SERVER_NAME).map_err(|_| invalid())
            }
            Err(_) => Err(invalid()),
        }
    }

    pub async fn send_mail<B: AsRef<[u8]>, SENDER: Into<ReversePath>, RECIP: Into<ForwardPath>>(
        &mut self,
        sender: SENDER,
        recipient: RECIP,
        data: B,
    ) -> Result<Response, ClientError> {
        let mut responses = self
            .pipeline_commands(vec![
                Command::MailFrom(sender.into()),
                Command::RcptTo(recipient.into()),
                Command::Data,
            ])
            .await
            .into_iter();

        for expected in [250, 250, 354] {
            // A short result means the connection failed, or an earlier
            // command was rejected and reported below
            let resp = responses.next().ok_or(ClientError::NotConnected)??;
            if resp.code != expected {
                return Err(ClientError::Rejected(resp));
            }
        }

        let data: &[u8] = data.as_ref();
        let stuffed;

        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);

        tracing::trace!("message data is {} bytes", data.len());

        match self.socket.as_mut() {
            Some(sock) => match timeout(
                Command::Data.client_timeout_request(&self.timeouts),
                sock.write_all(data),
            )
            .await
            {
                Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
                Err(_) => return Err(ClientError::TimeOutData),
            },
            None => return Err(ClientError::NotConnected),
        }

        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };

        tracing::trace!("send->{}: {}", self.hostname, marker.escape_debug());

        match self.socket.as_mut() {
            Some(sock) => match timeout(
                Command::Data.client_timeout_request(&self.timeouts),
                sock.write_all(marker.as_bytes()),
            )
            .await
            {
                Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
                Err(_) => {
                    return Err(ClientError::TimeOutRequest {
                        command: Command::Data,
                        duration: Command::Data.client_timeout_request(&self.timeouts),
                    })
                }
            },
            None => return Err(ClientError::NotConnected),
        }

        let data_dot = Command::DataDot;
        let resp = self
            .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await?;
        if resp.code != 250 {
            return Err(ClientError::Rejected(resp));
        }

        Ok(resp)
    }

    /// Politely end the session and close the connection
    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        let result = self.send_command(&Command::Quit).await;
        self.socket.take();
        result
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TlsStatus {
    FailedHandshake(String),
    Info(TlsInformation),
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TlsInformation {
    pub cipher: String,
    pub protocol_version: String,
}

fn parse_response_line(line: &str) -> Result<ResponseLine<'_>, ClientError> {
    if line.len() < 4 {
        return Err(ClientError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ClientError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(ClientError::MalformedResponseLine(line.to_string())),
    }
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    static LFDOT: Lazy<Finder> = Lazy::new(|| memchr::memmem::Finder::new("\n."));

    if !data.starts_with(b".") && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = vec![];
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}
