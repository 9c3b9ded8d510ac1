use crate::client_types::SmtpClientTimeouts;
use std::fmt;
use std::time::Duration;

/// The originator in `MAIL FROM`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversePath(pub MailPath);

impl TryFrom<&str> for ReversePath {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        MailPath::try_from(s).map(Self)
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The recipient in `RCPT TO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPath(pub MailPath);

impl TryFrom<&str> for ForwardPath {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        MailPath::try_from(s).map(Self)
    }
}

impl fmt::Display for ForwardPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPath {
    pub at_domain_list: Vec<String>,
    pub mailbox: Mailbox,
}

impl TryFrom<&str> for MailPath {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let (local_part, domain) = match s.rsplit_once('@') {
            Some(pair) => pair,
            None => return Err("missing @ sign"),
        };
        if local_part.contains('@') && !local_part.starts_with('"') {
            return Err("wrong number of @ signs");
        }
        if local_part.is_empty() {
            return Err("empty local part");
        }
        if domain.is_empty() {
            return Err("empty domain");
        }
        let quoted = local_part.starts_with('"');
        if !quoted && s.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
            return Err("whitespace or control characters in address");
        }
        Ok(Self {
            at_domain_list: vec![],
            mailbox: Mailbox {
                local_part: local_part.to_string(),
                domain: Domain::parse(domain),
            },
        })
    }
}

impl fmt::Display for MailPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Note: RFC5321 says about at_domain_list:
        // Note that this form, the so-called "source
        // route", MUST BE accepted, SHOULD NOT be
        // generated, and SHOULD be ignored.
        // So we don't include it in the stringified
        // version of MailPath
        self.mailbox.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: Domain,
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(String),
    V6(String),
    Tagged { tag: String, literal: String },
}

impl Domain {
    /// Classify the domain portion of an address, recognizing
    /// the bracketed address literal forms from RFC 5321 4.1.3
    pub fn parse(domain: &str) -> Self {
        match domain
            .strip_prefix('[')
            .and_then(|d| d.strip_suffix(']'))
        {
            Some(literal) => {
                if let Some(v6) = literal.strip_prefix("IPv6:") {
                    Self::V6(v6.to_string())
                } else if literal.parse::<std::net::Ipv4Addr>().is_ok() {
                    Self::V4(literal.to_string())
                } else {
                    match literal.split_once(':') {
                        Some((tag, literal)) => Self::Tagged {
                            tag: tag.to_string(),
                            literal: literal.to_string(),
                        },
                        None => Self::Name(domain.to_string()),
                    }
                }
            }
            None => Self::Name(domain.to_string()),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::V4(addr) => write!(f, "[{addr}]"),
            Self::V6(addr) => write!(f, "[IPv6:{addr}]"),
            Self::Tagged { tag, literal } => write!(f, "[{tag}:{literal}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(Domain),
    Helo(Domain),
    MailFrom(ReversePath),
    RcptTo(ForwardPath),
    Data,
    DataDot,
    Quit,
    StartTls,
    Auth {
        sasl_mech: String,
        initial_response: Option<String>,
    },
    /// A client response line sent in reply to a 334 challenge
    /// during a SASL exchange
    AuthResponse(String),
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom(address) => format!("MAIL FROM:<{address}>\r\n"),
            Self::RcptTo(address) => format!("RCPT TO:<{address}>\r\n"),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Auth {
                sasl_mech,
                initial_response: None,
            } => format!("AUTH {sasl_mech}\r\n"),
            Self::Auth {
                sasl_mech,
                initial_response: Some(resp),
            } => format!("AUTH {sasl_mech} {resp}\r\n"),
            Self::AuthResponse(resp) => format!("{resp}\r\n"),
        }
    }

    /// Like `encode`, but with any credential material masked,
    /// for use in diagnostic logging
    pub fn redacted(&self) -> String {
        match self {
            Self::Auth {
                sasl_mech,
                initial_response: Some(_),
            } => format!("AUTH {sasl_mech} <redacted>\r\n"),
            Self::AuthResponse(_) => "<redacted>\r\n".to_string(),
            _ => self.encode(),
        }
    }

    /// Timeouts for reading the response
    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom(_) => timeouts.mail_from_timeout,
            Self::RcptTo(_) => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::Quit => timeouts.idle_timeout,
            Self::Auth { .. } | Self::AuthResponse(_) => timeouts.auth_timeout,
        }
    }

    /// Timeouts for writing the request
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}
