use chrono::{DateTime, Utc};
use mail_builder::headers::address::Address;
use mail_builder::headers::text::Text;
use mail_builder::headers::HeaderType;
use mail_builder::mime::MimePart;
use mail_builder::MessageBuilder;
use mailparse::{MailAddr, SingleInfo};
use rfc5321::{ForwardPath, MailPath, ReversePath};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const SUBJECT: &str = "cy-smtp test message";
pub const BODY_TEXT: &str = "Hello from cy-smtp!\nThis is a test message.";

/// RFC 5321 4.5.3.1.3 limits a path to 256 octets including
/// the angle brackets
const MAX_ADDRESS_LEN: usize = 254;
/// Keeps an encoded From or To header well inside the
/// 998 octet line limit
const MAX_DISPLAY_NAME_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    From,
    To,
}

impl fmt::Display for AddressField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::From => write!(f, "from"),
            Self::To => write!(f, "to"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("error parsing {field} address {address:?}: {reason}")]
    InvalidAddress {
        field: AddressField,
        address: String,
        reason: String,
    },
    #[error("error building message: {0}")]
    Build(#[from] std::io::Error),
}

/// A serialized test message together with its SMTP envelope
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    pub sender: ReversePath,
    pub recipient: ForwardPath,
    pub data: Vec<u8>,
}

struct ParsedAddress {
    info: SingleInfo,
    path: MailPath,
}

impl ParsedAddress {
    /// The mailbox as it appears in the From or To header
    fn header_address(&self) -> Address<'_> {
        let addr = self.info.addr.as_str();
        match self.info.display_name.as_deref().filter(|name| !name.is_empty()) {
            Some(name) => Address::from((name, addr)),
            None => Address::from(addr),
        }
    }
}

fn parse_address(field: AddressField, address: &str) -> Result<ParsedAddress, ComposeError> {
    let invalid = |reason: String| ComposeError::InvalidAddress {
        field,
        address: address.to_string(),
        reason,
    };

    let list = mailparse::addrparse(address).map_err(|err| invalid(err.to_string()))?;
    let info = match list.as_slice() {
        [MailAddr::Single(info)] => info.clone(),
        [MailAddr::Group(_)] => return Err(invalid("groups are not supported".to_string())),
        [] => return Err(invalid("no address given".to_string())),
        _ => return Err(invalid("expected exactly one address".to_string())),
    };

    if info.addr.len() > MAX_ADDRESS_LEN {
        return Err(invalid(format!(
            "address is longer than {MAX_ADDRESS_LEN} octets"
        )));
    }
    if let Some(name) = &info.display_name {
        if name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(invalid(format!(
                "display name is longer than {MAX_DISPLAY_NAME_LEN} octets"
            )));
        }
    }

    let path = MailPath::try_from(info.addr.as_str()).map_err(|err| invalid(err.to_string()))?;

    Ok(ParsedAddress { info, path })
}

/// Build the test message addressed from/to the given addresses,
/// dated now
pub fn compose(from: &str, to: &str) -> Result<ComposedMessage, ComposeError> {
    compose_at(from, to, Utc::now())
}

pub fn compose_at(
    from: &str,
    to: &str,
    date: DateTime<Utc>,
) -> Result<ComposedMessage, ComposeError> {
    let from = parse_address(AddressField::From, from)?;
    let to = parse_address(AddressField::To, to)?;

    let message_id = format!("{}@{}", Uuid::new_v4().simple(), from.path.mailbox.domain);
    let body = BODY_TEXT.replace("\r\n", "\n").replace('\n', "\r\n");

    let text = MimePart::new_text(Cow::Owned(body)).header(
        "Content-Disposition",
        HeaderType::Text(Text::new("inline")),
    );

    let data = MessageBuilder::new()
        .from(from.header_address())
        .to(to.header_address())
        .subject(SUBJECT)
        .date(date.timestamp())
        .message_id(message_id.as_str())
        .body(MimePart::new_multipart("multipart/mixed", vec![text]))
        .write_to_vec()?;

    tracing::debug!("composed message {message_id}, {} bytes", data.len());

    Ok(ComposedMessage {
        sender: ReversePath(from.path),
        recipient: ForwardPath(to.path),
        data,
    })
}
