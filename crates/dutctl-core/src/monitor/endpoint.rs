//! Where the DUT's serial console comes from.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_BAUD: u32 = 115_200;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Any duplex byte stream the monitor can own.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

pub type BoxedSerial = Box<dyn SerialIo>;

/// A serial console descriptor: `tcp://host:port` or `DEVICE[:BAUD]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEndpoint {
    Device { path: String, baud: u32 },
    Tcp { host: String, port: u16 },
}

impl fmt::Display for SerialEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialEndpoint::Device { path, baud } => write!(f, "{path}:{baud}"),
            SerialEndpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for SerialEndpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .with_context(|| format!("serial endpoint {s:?} needs a port"))?;
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in serial endpoint {s:?}"))?;
            anyhow::ensure!(!host.is_empty() && port != 0, "invalid serial endpoint {s:?}");
            return Ok(SerialEndpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }

        anyhow::ensure!(!s.is_empty(), "empty serial endpoint");
        match s.rsplit_once(':') {
            Some((path, baud)) if !baud.is_empty() && baud.bytes().all(|b| b.is_ascii_digit()) => {
                let baud: u32 = baud
                    .parse()
                    .with_context(|| format!("invalid baud rate in {s:?}"))?;
                anyhow::ensure!(baud > 0, "baud rate must be positive in {s:?}");
                Ok(SerialEndpoint::Device {
                    path: path.to_string(),
                    baud,
                })
            }
            _ => Ok(SerialEndpoint::Device {
                path: s.to_string(),
                baud: DEFAULT_BAUD,
            }),
        }
    }
}

impl SerialEndpoint {
    /// Open the endpoint as a byte stream.
    pub async fn open(&self) -> Result<BoxedSerial> {
        match self {
            SerialEndpoint::Tcp { host, port } => {
                let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .with_context(|| format!("timed out connecting to serial bridge {self}"))?
                    .with_context(|| format!("failed to connect to serial bridge {self}"))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            SerialEndpoint::Device { path, baud } => open_device(path, *baud),
        }
    }
}

#[cfg(feature = "serial")]
fn open_device(path: &str, baud: u32) -> Result<BoxedSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(path, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .with_context(|| format!("failed to open serial port {path}"))?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
fn open_device(path: &str, _baud: u32) -> Result<BoxedSerial> {
    anyhow::bail!(
        "serial device {path} needs the `serial` feature; use a tcp:// bridge or rebuild with --features serial"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_bridges() {
        assert_eq!(
            "tcp://lab-pi:4001".parse::<SerialEndpoint>().unwrap(),
            SerialEndpoint::Tcp {
                host: "lab-pi".into(),
                port: 4001
            }
        );
        assert!("tcp://lab-pi".parse::<SerialEndpoint>().is_err());
        assert!("tcp://:4001".parse::<SerialEndpoint>().is_err());
    }

    #[test]
    fn parses_devices_with_optional_baud() {
        assert_eq!(
            "/dev/ttyUSB1".parse::<SerialEndpoint>().unwrap(),
            SerialEndpoint::Device {
                path: "/dev/ttyUSB1".into(),
                baud: DEFAULT_BAUD
            }
        );
        assert_eq!(
            "/dev/ttyUSB1:9600".parse::<SerialEndpoint>().unwrap(),
            SerialEndpoint::Device {
                path: "/dev/ttyUSB1".into(),
                baud: 9600
            }
        );
        assert!("/dev/ttyUSB1:0".parse::<SerialEndpoint>().is_err());
        assert!("".parse::<SerialEndpoint>().is_err());
    }

    #[tokio::test]
    async fn opens_tcp_bridge() {
        use tokio::io::AsyncReadExt;
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi\n").await.unwrap();
        });

        let endpoint = SerialEndpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let mut io = endpoint.open().await.unwrap();
        let mut buf = [0u8; 3];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi\n");
        server.await.unwrap();
    }
}
