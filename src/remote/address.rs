/// Backend address grammar
///
/// ```text
/// "stdout"                 -> stdout sink (stream)
/// "tcp://" host ":" port   -> TCP (stream)
/// "udp://" host ":" port   -> UDP (packet)
/// "socket://" path         -> unix domain socket (stream)
/// "file://" path           -> append-mode file sink (stream)
/// ```
use crate::error::RelayError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Send mechanism of an endpoint or listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Byte stream; can be piped to other streams
    Stream,
    /// Datagram oriented; every send is explicit
    Packet,
}

impl Kind {
    pub fn is_stream(&self) -> bool {
        matches!(self, Kind::Stream)
    }
}

/// Parsed backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddress {
    Stdout,
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Socket(PathBuf),
    File(PathBuf),
}

impl BackendAddress {
    pub fn kind(&self) -> Kind {
        match self {
            BackendAddress::Udp { .. } => Kind::Packet,
            _ => Kind::Stream,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            BackendAddress::Stdout => "stdout",
            BackendAddress::Tcp { .. } => "tcp",
            BackendAddress::Udp { .. } => "udp",
            BackendAddress::Socket(_) => "socket",
            BackendAddress::File(_) => "file",
        }
    }
}

fn host_and_port(raw: &str, conn: &str) -> Result<(String, u16), RelayError> {
    let (host, port) = conn
        .split_once(':')
        .ok_or_else(|| RelayError::address(raw, "expected host:port"))?;

    if host.is_empty() {
        return Err(RelayError::address(raw, "missing host"));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| RelayError::address(raw, format!("invalid port '{}'", port)))?;

    Ok((host.to_lowercase(), port))
}

impl FromStr for BackendAddress {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.eq_ignore_ascii_case("stdout") {
            return Ok(BackendAddress::Stdout);
        }

        let parsed = raw.split_once("://").filter(|(scheme, conn)| {
            !scheme.is_empty()
                && !conn.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

        let (scheme, conn) = match parsed {
            Some(parts) => parts,
            None => return Err(RelayError::address(raw, "Can not parse connection string")),
        };

        match scheme.to_lowercase().as_str() {
            "tcp" => {
                let (host, port) = host_and_port(raw, conn)?;
                Ok(BackendAddress::Tcp { host, port })
            }
            "udp" => {
                let (host, port) = host_and_port(raw, conn)?;
                Ok(BackendAddress::Udp { host, port })
            }
            "socket" => Ok(BackendAddress::Socket(PathBuf::from(conn))),
            "file" => Ok(BackendAddress::File(PathBuf::from(conn))),
            other => Err(RelayError::address(
                raw,
                format!("Unknown server type '{}'", other),
            )),
        }
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddress::Stdout => write!(f, "stdout"),
            BackendAddress::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            BackendAddress::Udp { host, port } => write!(f, "udp://{}:{}", host, port),
            BackendAddress::Socket(path) => write!(f, "socket://{}", path.display()),
            BackendAddress::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grammar() {
        assert_eq!("stdout".parse::<BackendAddress>().unwrap(), BackendAddress::Stdout);
        assert_eq!("STDOUT".parse::<BackendAddress>().unwrap(), BackendAddress::Stdout);
        assert_eq!(
            "tcp://LocalHost:10001".parse::<BackendAddress>().unwrap(),
            BackendAddress::Tcp {
                host: "localhost".to_string(),
                port: 10001
            }
        );
        assert_eq!(
            "UDP://127.0.0.1:8125".parse::<BackendAddress>().unwrap(),
            BackendAddress::Udp {
                host: "127.0.0.1".to_string(),
                port: 8125
            }
        );
        assert_eq!(
            "socket:///tmp/echo.socket".parse::<BackendAddress>().unwrap(),
            BackendAddress::Socket(PathBuf::from("/tmp/echo.socket"))
        );
        assert_eq!(
            "file:///tmp/out.log".parse::<BackendAddress>().unwrap(),
            BackendAddress::File(PathBuf::from("/tmp/out.log"))
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!("udp://h:1".parse::<BackendAddress>().unwrap().kind(), Kind::Packet);
        for raw in ["tcp://h:1", "socket:///s", "file:///f", "stdout"] {
            assert_eq!(raw.parse::<BackendAddress>().unwrap().kind(), Kind::Stream);
        }
    }

    #[test]
    fn test_unknown_scheme() {
        let err = "http://h:80".parse::<BackendAddress>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid backend address 'http://h:80': Unknown server type 'http'"
        );
    }

    #[test]
    fn test_unparseable() {
        let invalid = [
            "",
            "localhost:80",
            "tcp://",
            "://x",
            "tcp://host",
            "tcp://:80",
            "udp://h:notaport",
        ];
        for raw in invalid {
            assert!(raw.parse::<BackendAddress>().is_err(), "{} should not parse", raw);
        }
    }

    #[test]
    fn test_display_roundtrip() {
        let addr: BackendAddress = "tcp://h:1".parse().unwrap();
        assert_eq!(addr.to_string(), "tcp://h:1");
        assert_eq!(addr.scheme(), "tcp");
    }
}
