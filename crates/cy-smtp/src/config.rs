use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_SKIP_TLS_VERIFY: bool = true;

/// Validate an SMTP server by sending it a single test email.
///
/// Every option may also be given in the config file under its long
/// name, or through its environment variable. An option given on the
/// command line (or environment) takes precedence over the config file.
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "cy-smtp", version, about = "SMTP server configuration tester")]
pub struct Opt {
    /// Path to the YAML, TOML or JSON config file
    /// [default: config.yaml]
    #[arg(short = 'c', long, env = "CY_SMTP_CONFIG_FILE")]
    pub config_file: Option<String>,

    /// Skip verification of the server TLS certificate.
    /// This is enabled unless explicitly set to false, so that any
    /// certificate the server presents is trusted by default.
    /// Use --email-tls-skip-verify=false to verify the certificate.
    #[arg(
        long,
        env = "CY_SMTP_EMAIL_TLS_SKIP_VERIFY",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub email_tls_skip_verify: Option<bool>,

    /// The host:port of the SMTP server
    #[arg(short = 's', long, env = "CY_SMTP_EMAIL_SMTP_SVR_ADDR")]
    pub email_smtp_svr_addr: Option<String>,

    /// Username for SMTP authentication
    #[arg(short = 'u', long, env = "CY_SMTP_EMAIL_SMTP_USERNAME")]
    pub email_smtp_username: Option<String>,

    /// Password for SMTP authentication
    #[arg(
        short = 'p',
        long,
        env = "CY_SMTP_EMAIL_SMTP_PASSWORD",
        hide_env_values = true
    )]
    pub email_smtp_password: Option<String>,

    /// Sender address of the test email
    #[arg(short = 'f', long, env = "CY_SMTP_EMAIL_ADDR_FROM")]
    pub email_addr_from: Option<String>,

    /// Recipient address of the test email
    #[arg(short = 't', long, env = "CY_SMTP_EMAIL_ADDR_TO")]
    pub email_addr_to: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config file {}", .path.display())]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "error reading config file {}: unsupported format {extension:?}, \
         expected yaml, yml, toml or json",
        .path.display()
    )]
    UnsupportedFormat { path: PathBuf, extension: String },
    #[error("error reading config file {}: {reason}", .path.display())]
    ParseFailed { path: PathBuf, reason: String },
}

/// The values that may be set in the config file.
/// Keys that are not listed here are ignored.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    pub config_file: Option<String>,
    pub email_tls_skip_verify: Option<bool>,
    pub email_smtp_svr_addr: Option<String>,
    pub email_smtp_username: Option<String>,
    pub email_smtp_password: Option<String>,
    pub email_addr_from: Option<String>,
    pub email_addr_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Toml,
    Json,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            None => Format::Yaml,
            Some(ext) => match ext.to_ascii_lowercase().as_str() {
                "yaml" | "yml" => Format::Yaml,
                "toml" => Format::Toml,
                "json" => Format::Json,
                _ => {
                    return Err(ConfigError::UnsupportedFormat {
                        path: path.to_path_buf(),
                        extension: ext.to_string(),
                    })
                }
            },
        };

        let data =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileUnreadable {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::debug!("loading {format:?} config from {}", path.display());
        Self::parse(&data, format).map_err(|reason| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(data: &str, format: Format) -> Result<Self, String> {
        match format {
            Format::Yaml => {
                if data.trim().is_empty() {
                    return Ok(Self::default());
                }
                // A document holding only comments is null
                serde_yaml::from_str::<Option<Self>>(data)
                    .map(Option::unwrap_or_default)
                    .map_err(|err| format!("{err:#}"))
            }
            Format::Toml => toml::from_str(data).map_err(|err| format!("{err:#}")),
            Format::Json => serde_json::from_str(data).map_err(|err| format!("{err:#}")),
        }
    }
}

/// The effective settings for one invocation
#[derive(Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub config_file: String,
    pub skip_tls_verify: bool,
    pub server_address: String,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub to_address: String,
}

impl fmt::Debug for RunConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RunConfiguration")
            .field("config_file", &self.config_file)
            .field("skip_tls_verify", &self.skip_tls_verify)
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .field(
                "password",
                &if self.password.is_empty() {
                    ""
                } else {
                    "<redacted>"
                },
            )
            .field("from_address", &self.from_address)
            .field("to_address", &self.to_address)
            .finish()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn pick(flag: &Option<String>, file: &Option<String>, default: &str) -> String {
    non_empty(flag.as_deref())
        .or_else(|| non_empty(file.as_deref()))
        .unwrap_or(default)
        .to_string()
}

/// Combine the command line with the config file contents.
/// Each field is considered independently: a non-empty option
/// wins over the config file, which wins over the default.
///
/// `config_file` follows the same precedence, so a `config-file`
/// key inside the file is reported in the result when no flag names
/// a file. The key is never followed to load a second file.
pub fn merge(opt: &Opt, file: &ConfigFile) -> RunConfiguration {
    RunConfiguration {
        config_file: pick(&opt.config_file, &file.config_file, DEFAULT_CONFIG_FILE),
        skip_tls_verify: opt
            .email_tls_skip_verify
            .or(file.email_tls_skip_verify)
            .unwrap_or(DEFAULT_SKIP_TLS_VERIFY),
        server_address: pick(&opt.email_smtp_svr_addr, &file.email_smtp_svr_addr, ""),
        username: pick(&opt.email_smtp_username, &file.email_smtp_username, ""),
        password: pick(&opt.email_smtp_password, &file.email_smtp_password, ""),
        from_address: pick(&opt.email_addr_from, &file.email_addr_from, ""),
        to_address: pick(&opt.email_addr_to, &file.email_addr_to, ""),
    }
}

/// Load the config file named by the options and produce the
/// effective configuration
pub fn resolve(opt: &Opt) -> Result<RunConfiguration, ConfigError> {
    let path = non_empty(opt.config_file.as_deref()).unwrap_or(DEFAULT_CONFIG_FILE);
    let file = ConfigFile::load(Path::new(path))?;
    let config = merge(opt, &file);

    tracing::debug!("{config:?}");
    if config.skip_tls_verify {
        tracing::warn!(
            "TLS certificate verification is disabled; \
             any certificate presented by the server will be trusted. \
             Set email-tls-skip-verify to false to verify it"
        );
    }

    Ok(config)
}
