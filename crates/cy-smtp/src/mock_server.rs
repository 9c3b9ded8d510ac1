//! A single-session SMTP server for exercising the dispatcher
use crate::dispatch::{Connector, TcpConnector};
use async_trait::async_trait;
use data_encoding::BASE64;
use rfc5321::tokio_rustls::rustls::crypto::aws_lc_rs;
use rfc5321::tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer,
};
use rfc5321::tokio_rustls::rustls::ServerConfig;
use rfc5321::tokio_rustls::TlsAcceptor;
use rfc5321::BoxedAsyncReadAndWrite;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Counts connection attempts before delegating to TCP
#[derive(Default)]
pub struct CountingConnector {
    attempts: AtomicUsize,
}

impl CountingConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, address: &str) -> std::io::Result<BoxedAsyncReadAndWrite> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        TcpConnector.connect(address).await
    }
}

#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// The parameter of the advertised AUTH capability;
    /// None to not advertise AUTH
    pub auth: Option<&'static str>,
    pub starttls: bool,
    pub pipelining: bool,
    /// Answer EHLO with 502, as a HELO-only server does
    pub reject_ehlo: bool,
    /// Refuse every recipient
    pub reject_rcpt: bool,
    pub username: &'static str,
    pub password: &'static str,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            auth: None,
            starttls: false,
            pipelining: false,
            reject_ehlo: false,
            reject_rcpt: false,
            username: "u",
            password: "p",
        }
    }
}

/// What the server observed during the session
#[derive(Debug, Default)]
pub struct SessionRecord {
    /// Command lines, excluding message content and SASL responses
    pub commands: Vec<String>,
    /// Accepted message content, still dot-stuffed
    pub messages: Vec<String>,
    pub tls_established: bool,
}

pub struct MockServer {
    pub address: String,
    handle: JoinHandle<SessionRecord>,
}

impl MockServer {
    /// Listen on an ephemeral loopback port and serve exactly
    /// one connection
    pub async fn spawn(config: MockServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut session = Session {
                config,
                record: SessionRecord::default(),
                tls_active: false,
                rcpt_accepted: false,
            };
            session.run(stream).await;
            session.record
        });

        Self { address, handle }
    }

    /// Wait for the client to go away, and return what happened
    pub async fn finish(self) -> SessionRecord {
        self.handle.await.unwrap()
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = CertificateDer::from_slice(key.cert.der()).into_owned();
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], private_key)
        .unwrap();

    TlsAcceptor::from(Arc::new(config))
}

enum Outcome {
    Closed,
    StartTls,
}

struct Session {
    config: MockServerConfig,
    record: SessionRecord,
    tls_active: bool,
    rcpt_accepted: bool,
}

impl Session {
    async fn run(&mut self, stream: TcpStream) {
        let mut plain = BufReader::new(stream);
        if !send(&mut plain, "220 mock.example.com ESMTP ready\r\n").await {
            return;
        }

        match self.converse(&mut plain).await {
            Outcome::Closed => {}
            Outcome::StartTls => {
                let tls = match tls_acceptor().accept(plain.into_inner()).await {
                    Ok(tls) => tls,
                    Err(_) => return,
                };
                self.tls_active = true;
                self.record.tls_established = true;
                self.rcpt_accepted = false;
                let mut tls = BufReader::new(tls);
                self.converse(&mut tls).await;
            }
        }
    }

    fn ehlo_reply(&self) -> String {
        let mut lines = vec!["mock.example.com".to_string()];
        if self.config.starttls && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        if let Some(auth) = self.config.auth {
            lines.push(format!("AUTH {auth}"));
        }
        if self.config.pipelining {
            lines.push("PIPELINING".to_string());
        }
        lines.push("8BITMIME".to_string());

        let mut reply = String::new();
        let last = lines.len() - 1;
        for (idx, line) in lines.iter().enumerate() {
            let sep = if idx == last { ' ' } else { '-' };
            reply.push_str(&format!("250{sep}{line}\r\n"));
        }
        reply
    }

    async fn converse<S: AsyncBufRead + AsyncWrite + Unpin>(&mut self, io: &mut S) -> Outcome {
        while let Some(command) = read_line(io).await {
            self.record.commands.push(command.clone());
            let verb = command
                .split(' ')
                .next()
                .unwrap_or("")
                .to_ascii_uppercase();

            let reply = match verb.as_str() {
                "EHLO" if self.config.reject_ehlo => {
                    "502 5.5.2 command not recognized\r\n".to_string()
                }
                "EHLO" => self.ehlo_reply(),
                "HELO" => "250 mock.example.com\r\n".to_string(),
                "STARTTLS" if self.config.starttls && !self.tls_active => {
                    if !send(io, "220 2.0.0 ready to start TLS\r\n").await {
                        return Outcome::Closed;
                    }
                    return Outcome::StartTls;
                }
                "AUTH" => match self.authenticate(io, &command).await {
                    Some(true) => "235 2.7.0 authentication successful\r\n".to_string(),
                    Some(false) => "535 5.7.8 authentication credentials invalid\r\n".to_string(),
                    None => return Outcome::Closed,
                },
                "MAIL" => "250 2.1.0 sender ok\r\n".to_string(),
                "RCPT" if self.config.reject_rcpt => "550 5.1.1 no such user\r\n".to_string(),
                "RCPT" => {
                    self.rcpt_accepted = true;
                    "250 2.1.5 recipient ok\r\n".to_string()
                }
                "DATA" if !self.rcpt_accepted => "554 5.5.1 no valid recipients\r\n".to_string(),
                "DATA" => {
                    if !send(io, "354 end data with <CR><LF>.<CR><LF>\r\n").await {
                        return Outcome::Closed;
                    }
                    let mut message = String::new();
                    loop {
                        match read_line(io).await {
                            Some(line) if line == "." => break,
                            Some(line) => {
                                message.push_str(&line);
                                message.push_str("\r\n");
                            }
                            None => return Outcome::Closed,
                        }
                    }
                    self.record.messages.push(message);
                    "250 2.0.0 queued\r\n".to_string()
                }
                "QUIT" => {
                    send(io, "221 2.0.0 bye\r\n").await;
                    return Outcome::Closed;
                }
                _ => "502 5.5.2 command not recognized\r\n".to_string(),
            };

            if !send(io, &reply).await {
                return Outcome::Closed;
            }
        }
        Outcome::Closed
    }

    /// Returns None if the connection went away mid-exchange
    async fn authenticate<S: AsyncBufRead + AsyncWrite + Unpin>(
        &mut self,
        io: &mut S,
        command: &str,
    ) -> Option<bool> {
        let mut fields = command.split(' ').skip(1);
        let mech = fields.next().unwrap_or("").to_ascii_uppercase();
        let advertised = self
            .config
            .auth
            .map(|auth| {
                auth.split_ascii_whitespace()
                    .any(|m| m.eq_ignore_ascii_case(&mech))
            })
            .unwrap_or(false);
        if !advertised {
            return Some(false);
        }

        let (username, password) = match mech.as_str() {
            "PLAIN" => {
                let response = match fields.next() {
                    Some(initial) => initial.to_string(),
                    None => {
                        send(io, "334 \r\n").await.then_some(())?;
                        read_line(io).await?
                    }
                };
                let decoded = BASE64.decode(response.as_bytes()).unwrap_or_default();
                let decoded = String::from_utf8_lossy(&decoded).to_string();
                let mut parts = decoded.split('\0').skip(1);
                (
                    parts.next().unwrap_or("").to_string(),
                    parts.next().unwrap_or("").to_string(),
                )
            }
            "LOGIN" => {
                send(io, "334 VXNlcm5hbWU6\r\n").await.then_some(())?;
                let username = decode_line(&read_line(io).await?);
                send(io, "334 UGFzc3dvcmQ6\r\n").await.then_some(())?;
                let password = decode_line(&read_line(io).await?);
                (username, password)
            }
            _ => return Some(false),
        };

        Some(username == self.config.username && password == self.config.password)
    }
}

/// Write and flush a reply; false if the client went away
async fn send<S: AsyncWrite + Unpin>(io: &mut S, reply: &str) -> bool {
    io.write_all(reply.as_bytes()).await.is_ok() && io.flush().await.is_ok()
}

fn decode_line(line: &str) -> String {
    let decoded = BASE64.decode(line.as_bytes()).unwrap_or_default();
    String::from_utf8_lossy(&decoded).to_string()
}

/// Read a CRLF terminated line, without the line ending.
/// Returns None at EOF or on error.
async fn read_line<S: AsyncBufRead + Unpin>(io: &mut S) -> Option<String> {
    let mut line = String::new();
    match io.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
    }
}
