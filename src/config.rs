//! Table configuration.
//!
//! Everything here is set before the receive thread starts; the engine
//! treats the configuration as a read-only snapshot afterwards. Besides the
//! typed [`TableConfig`], the table exposes the name/value parameter surface
//! scanners drive from their command line.

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::cookie::Entropy;
use crate::endpoint::Endpoint;
use crate::protocols::tls::TlsVariant;
use crate::protocols::RawStream;
use crate::table::ConnectionTable;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
}

/// The source addresses the scanner may rotate through when it opens
/// additional connections to the same target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub first: IpAddr,
    pub last: IpAddr,
}

impl AddrRange {
    pub fn single(address: IpAddr) -> Self {
        Self {
            first: address,
            last: address,
        }
    }

    /// The address after `current`, wrapping back to the start of the range.
    pub fn next_address(&self, current: IpAddr) -> IpAddr {
        match (current, self.first, self.last) {
            (IpAddr::V4(current), IpAddr::V4(first), IpAddr::V4(last)) => {
                let next = u32::from(current).wrapping_add(1);
                if next > u32::from(last) || next < u32::from(first) {
                    IpAddr::V4(first)
                } else {
                    IpAddr::V4(next.into())
                }
            }
            (IpAddr::V6(current), IpAddr::V6(first), IpAddr::V6(last)) => {
                let next = u128::from(current).wrapping_add(1);
                if next > u128::from(last) || next < u128::from(first) {
                    IpAddr::V6(first)
                } else {
                    IpAddr::V6(next.into())
                }
            }
            _ => self.first,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Requested bucket count; rounded to a power of two and clamped
    pub capacity: usize,
    /// How long a connection may exist before it is reset and dropped
    pub connection_timeout: Duration,
    /// Silence on a fresh connection before we volunteer our hello
    pub hello_timeout: Duration,
    /// Keys the SYN cookies and the bucket hash
    pub entropy: Entropy,
    /// Source ports available for connection rotation
    pub source_ports: RangeInclusive<u16>,
    /// Source addresses for rotation; `None` pins the original address
    pub source_addrs: Option<AddrRange>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 16,
            connection_timeout: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(2),
            entropy: Entropy::random(),
            source_ports: 40000..=60000,
            source_addrs: None,
        }
    }
}

impl TableConfig {
    /// The local endpoint a follow-up connection to the same target should
    /// use: the next source port, rolling the source address over when the
    /// port range wraps.
    pub(crate) fn next_source(&self, current: Endpoint) -> Endpoint {
        let first = *self.source_ports.start();
        let last = *self.source_ports.end();
        let next = current.port.wrapping_add(1);
        if current.port >= last || next < first {
            let address = match &self.source_addrs {
                Some(range) => range.next_address(current.address),
                None => current.address,
            };
            Endpoint::new(address, first)
        } else {
            Endpoint::new(current.address, next)
        }
    }
}

fn parse_seconds(name: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| ConfigError::InvalidValue {
            name: name.into(),
            value: value.into(),
        })
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "" | "1" | "true" | "yes" | "on")
}

impl ConnectionTable {
    /// Adds or replaces a header on the HTTP hello.
    pub fn set_http_header(&mut self, name: &str, value: &str) {
        self.registry()
            .http()
            .configure(|template| template.set_header(name, value));
    }

    /// The name/value configuration surface. Recognized names mirror the
    /// scanner's command-line options.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        if let Some(port) = name
            .strip_prefix("hello-string[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let port: u16 = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: name.into(),
                value: value.into(),
            })?;
            let hello = BASE64
                .decode(value)
                .map_err(|_| ConfigError::InvalidValue {
                    name: name.into(),
                    value: value.into(),
                })?;
            self.registry()
                .set_override(port, Arc::new(RawStream::new(hello)));
            return Ok(());
        }

        match name {
            "http-payload" => {
                let payload = value.as_bytes().to_vec();
                self.registry()
                    .http()
                    .configure(|template| template.payload = payload);
            }
            "http-user-agent" => {
                let agent = value.to_string();
                self.registry()
                    .http()
                    .configure(|template| template.user_agent = agent);
            }
            "http-host" => {
                let host = value.to_string();
                self.registry()
                    .http()
                    .configure(|template| template.host = host);
            }
            "http-method" => {
                let method = value.to_string();
                self.registry()
                    .http()
                    .configure(|template| template.method = method);
            }
            "http-url" => {
                let url = value.to_string();
                self.registry()
                    .http()
                    .configure(|template| template.url = url);
            }
            "http-version" => {
                let version = value.to_string();
                self.registry()
                    .http()
                    .configure(|template| template.version = version);
            }
            "timeout" | "connection-timeout" => {
                self.config_mut().connection_timeout = parse_seconds(name, value)?;
            }
            "hello-timeout" => {
                self.config_mut().hello_timeout = parse_seconds(name, value)?;
            }
            "hello" => match value {
                "http" => {
                    let stream = self.registry().http_stream();
                    self.registry().force(stream);
                }
                "ssl" => {
                    let stream = self.registry().tls_stream();
                    self.registry().force(stream);
                }
                "smbv1" => {
                    let stream = self.registry().smb_stream();
                    self.registry().force(stream);
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: name.into(),
                        value: value.into(),
                    })
                }
            },
            "heartbleed" => {
                if parse_bool(value) {
                    self.registry()
                        .tls()
                        .configure(|config| config.heartbleed = true);
                    let stream = self.registry().tls_stream();
                    self.registry().force(stream);
                }
            }
            "ticketbleed" => {
                if parse_bool(value) {
                    self.registry()
                        .tls()
                        .configure(|config| config.ticketbleed = true);
                    let stream = self.registry().tls_stream();
                    self.registry().force(stream);
                }
            }
            "poodle" | "sslv3" => {
                if parse_bool(value) {
                    self.registry()
                        .tls()
                        .configure(|config| config.variant = TlsVariant::Sslv3);
                    let stream = self.registry().tls_stream();
                    self.registry().force(stream);
                }
            }
            _ => return Err(ConfigError::UnknownParameter(name.into())),
        }
        Ok(())
    }
}
