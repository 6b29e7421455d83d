//! Endpoint parsing and network defaults.

use crate::connector::ConnectorError;

/// Default port for TLS schemes (`wss`, `https`).
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Default port for plaintext schemes (`ws`, `http`).
pub const DEFAULT_PLAIN_PORT: u16 = 80;

/// A parsed endpoint: host, port, and whether the scheme implies TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Whether the scheme is TLS-carrying
    pub tls: bool,
}

/// Parse a `wss://`, `ws://`, `https://`, or `http://` URL into host, port,
/// and TLS flag. Used by the identity probe, which needs a raw TLS
/// connection to the same endpoint the transports will use.
pub fn parse_endpoint(url: &str) -> Result<Endpoint, ConnectorError> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return Err(ConnectorError::InvalidEndpoint(format!(
            "unsupported scheme in {url:?}"
        )));
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() {
        return Err(ConnectorError::InvalidEndpoint(format!(
            "missing host in {url:?}"
        )));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ConnectorError::InvalidEndpoint(format!("bad port in {url:?}"))
            })?;
            (host, port)
        }
        None => (
            authority,
            if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT },
        ),
    };
    if host.is_empty() {
        return Err(ConnectorError::InvalidEndpoint(format!(
            "missing host in {url:?}"
        )));
    }

    Ok(Endpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wss_with_explicit_port() {
        let endpoint = parse_endpoint("wss://node-1.swarm.local:8443/channel").unwrap();
        assert_eq!(
            endpoint,
            Endpoint {
                host: "node-1.swarm.local".to_string(),
                port: 8443,
                tls: true,
            }
        );
    }

    #[test]
    fn defaults_port_by_scheme() {
        assert_eq!(parse_endpoint("wss://node/ws").unwrap().port, 443);
        assert_eq!(parse_endpoint("https://node/push").unwrap().port, 443);
        assert_eq!(parse_endpoint("ws://node/ws").unwrap().port, 80);
    }

    #[test]
    fn rejects_unknown_scheme_and_empty_host() {
        assert!(parse_endpoint("ftp://node").is_err());
        assert!(parse_endpoint("wss://").is_err());
        assert!(parse_endpoint("wss://:8443").is_err());
        assert!(parse_endpoint("wss://node:notaport/").is_err());
    }
}
