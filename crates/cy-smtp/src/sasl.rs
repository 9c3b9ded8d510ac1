use async_trait::async_trait;
use rfc5321::{ClientError, SmtpClient};
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A client side SASL exchange run over an established SMTP session
#[async_trait]
pub trait SaslMechanism: Send + Sync {
    fn name(&self) -> &'static str;
    async fn authenticate(&self, client: &mut SmtpClient) -> Result<(), ClientError>;
}

struct Plain(Credentials);

#[async_trait]
impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    async fn authenticate(&self, client: &mut SmtpClient) -> Result<(), ClientError> {
        client
            .auth_plain(&self.0.username, Some(&self.0.password))
            .await
    }
}

struct Login(Credentials);

#[async_trait]
impl SaslMechanism for Login {
    fn name(&self) -> &'static str {
        "LOGIN"
    }

    async fn authenticate(&self, client: &mut SmtpClient) -> Result<(), ClientError> {
        client.auth_login(&self.0.username, &self.0.password).await
    }
}

fn plain(credentials: &Credentials) -> Box<dyn SaslMechanism> {
    Box::new(Plain(credentials.clone()))
}

fn login(credentials: &Credentials) -> Box<dyn SaslMechanism> {
    Box::new(Login(credentials.clone()))
}

type Constructor = fn(&Credentials) -> Box<dyn SaslMechanism>;

/// Mechanisms in order of preference
pub const SUPPORTED_MECHANISMS: &[(&str, Constructor)] = &[("PLAIN", plain), ("LOGIN", login)];

/// Pick the most preferred supported mechanism from the parameter
/// of an AUTH capability, eg: `LOGIN PLAIN XOAUTH2`
pub fn select_mechanism(
    advertised: &str,
    credentials: &Credentials,
) -> Option<Box<dyn SaslMechanism>> {
    SUPPORTED_MECHANISMS
        .iter()
        .find(|(name, _)| {
            advertised
                .split_ascii_whitespace()
                .any(|mech| mech.eq_ignore_ascii_case(name))
        })
        .map(|(_, construct)| construct(credentials))
}
