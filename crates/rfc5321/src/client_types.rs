use std::fmt;
use std::time::Duration;

/// How long to wait on each step of a session
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SmtpClientTimeouts {
    pub connect_timeout: Duration,
    pub banner_timeout: Duration,
    pub ehlo_timeout: Duration,
    pub mail_from_timeout: Duration,
    pub rcpt_to_timeout: Duration,
    pub data_timeout: Duration,
    pub data_dot_timeout: Duration,
    /// Applies to QUIT
    pub idle_timeout: Duration,
    pub starttls_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        let handshake = Duration::from_secs(60);
        let transaction = Duration::from_secs(300);
        let short = Duration::from_secs(5);
        Self {
            connect_timeout: handshake,
            banner_timeout: handshake,
            auth_timeout: handshake,
            ehlo_timeout: transaction,
            mail_from_timeout: transaction,
            rcpt_to_timeout: transaction,
            data_timeout: transaction,
            data_dot_timeout: transaction,
            idle_timeout: short,
            starttls_timeout: short,
        }
    }
}

/// A complete, possibly multi-line, server reply
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text with the enhanced code stripped from each line,
    /// lines joined by `\n`
    pub content: String,
    /// The redacted command that elicited this reply
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let text = remove_line_break(&self.content);
        match &self.enhanced_code {
            Some(enh) => format!("{} {enh} {text}", self.code),
            None => format!("{} {text}", self.code),
        }
    }
}

/// RFC 3463 `class.subject.detail`
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Split a leading enhanced status code from the text of a reply line
fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let (code, text) = line.split_once(' ')?;
    let mut parts = code.split('.');
    let class = parts.next()?.parse::<u8>().ok()?;
    let subject = parts.next()?.parse::<u16>().ok()?;
    let detail = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
        return None;
    }

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        text,
    ))
}

/// Each CRLF, bare CR or bare LF becomes a single space
fn remove_line_break(data: &str) -> String {
    data.replace("\r\n", " ").replace(&['\r', '\n'][..], " ")
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl fmt::Display for ResponseLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sep = if self.is_final { ' ' } else { '-' };
        write!(f, "{}{sep}{}", self.code, self.content)
    }
}

/// Accumulates the lines of a multi-line reply
pub(crate) struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    lines: Vec<String>,
}

impl ResponseBuilder {
    pub fn new(first: &ResponseLine) -> Self {
        let (enhanced_code, text) = match parse_enhanced_status_code(first.content) {
            Some((enh, text)) => (Some(enh), text),
            None => (None, first.content),
        };

        Self {
            code: first.code,
            enhanced_code,
            lines: vec![text.to_string()],
        }
    }

    /// Append a continuation line. A line whose code differs from
    /// the first is returned verbatim as the error.
    pub fn add_line(&mut self, line: &ResponseLine) -> Result<(), String> {
        if line.code != self.code {
            return Err(line.to_string());
        }

        let text = self
            .enhanced_code
            .and_then(|enh| {
                line.content
                    .strip_prefix(enh.to_string().as_str())
                    .and_then(|rest| rest.strip_prefix(' '))
            })
            .unwrap_or(line.content);
        self.lines.push(text.to_string());
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.lines.join("\n"),
            command,
        }
    }
}
