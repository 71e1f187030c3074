//! MQTT connection plumbing for the inspection bridge.
//!
//! Inspection stations publish one message per camera per cycle to a broker.
//! This module resolves the broker endpoint, loads optional TLS material and
//! opens a `rumqttc` v5 client:
//! - CA verification: custom CA path or the default webpki roots
//! - Client certificates: mutual TLS when both cert and key are given
//! - Insecure mode: not offered

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{Client, Connection, MqttOptions};
use rumqttc::Transport;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

const KEEP_ALIVE_SECS: u64 = 60;
const REQUEST_CAPACITY: usize = 64;

/// PEM material for MQTT TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA certificate. `None` uses the default roots.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key, always provided together.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => Some((
                read_pem(cert, "client certificate")?,
                read_pem(key, "client key")?,
            )),
            (None, None) => None,
            (cert, _) => {
                let given = if cert.is_some() { "certificate" } else { "key" };
                return Err(anyhow!(
                    "MQTT TLS client auth needs both a certificate and a key, only the {} was given",
                    given
                ));
            }
        };
        let ca = ca_path.map(|path| read_pem(path, "CA")).transpose()?;
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// Builds the transport for `endpoint`.
    ///
    /// Errors when TLS material is given for a plain-TCP endpoint, or when client
    /// certificates are given without a CA.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled.\n\
                     Use --mqtt-use-tls or the mqtts:// scheme to enable TLS."
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!(
                "MQTT TLS CA certificate is required when providing client certificates.\n\
                 Specify --mqtt-tls-ca-path or remove the client cert configuration."
            )
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Accepts `host:port`, `[ipv6]:port`, or either behind an `mqtt://`, `tcp://`,
    /// `mqtts://` or `ssl://` scheme. TLS is on for the secure schemes or when
    /// `force_tls` is set.
    pub fn parse(addr: &str, force_tls: bool) -> Result<Self> {
        let addr = addr.trim();
        let (scheme_tls, authority) = match addr.split_once("://") {
            None => (false, addr),
            Some(("mqtt" | "tcp", rest)) => (false, rest),
            Some(("mqtts" | "ssl", rest)) => (true, rest),
            Some((scheme, _)) => return Err(anyhow!("unsupported MQTT scheme: {}", scheme)),
        };

        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| anyhow!("unterminated IPv6 host in MQTT address {}", addr))?;
                (host, tail.strip_prefix(':'))
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };
        let port: u16 = port
            .ok_or_else(|| anyhow!("MQTT address {} has no port", addr))?
            .parse()
            .with_context(|| format!("MQTT address {} has an invalid port", addr))?;
        if host.is_empty() {
            return Err(anyhow!("MQTT address {} has no host", addr));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            use_tls: force_tls || scheme_tls,
        })
    }

    pub fn is_loopback(&self) -> bool {
        self.host.eq_ignore_ascii_case("localhost")
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }

    /// Errors for a remote broker; the bridge only skips this when remote access
    /// was requested explicitly.
    pub fn require_loopback(&self) -> Result<()> {
        if self.is_loopback() {
            return Ok(());
        }
        Err(anyhow!(
            "MQTT broker {}:{} is not on loopback (pass --allow-remote-mqtt to connect anyway)",
            self.host,
            self.port
        ))
    }
}

/// Connection parameters for one subscriber session.
#[derive(Clone, Debug)]
pub struct MqttSession {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSession {
    pub fn connect(&self) -> Result<(Client, Connection)> {
        let mut options = MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        options.set_clean_start(true);
        if let Some(user) = self.username.as_deref() {
            options.set_credentials(user, self.password.as_deref().unwrap_or_default());
        }
        options.set_transport(self.tls.build_transport(&self.endpoint)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        log::info!(
            "connecting to MQTT broker {}:{} (TLS: {}, auth: {})",
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.use_tls,
            self.username.is_some()
        );
        Ok((client, connection))
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS {} '{}'", what, path.display()))
}
