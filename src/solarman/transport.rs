use crate::config;
use crate::error::TransportError;

use {
    async_trait::async_trait,
    log::{info, warn},
    net2::TcpStreamExt,
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncWrite},
    tokio::net::TcpStream,
};

/// Opens the byte stream a session talks V5 over.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<Self::Stream, TransportError>;

    /// Human readable peer, for logs.
    fn peer(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(inverter: &config::Inverter) -> Self {
        Self {
            host: inverter.host().to_string(),
            port: inverter.port(),
            connect_timeout: inverter.connect_timeout(),
            nodelay: inverter.use_tcp_nodelay(),
            keepalive: inverter.tcp_keepalive(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let addr = self.peer();
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => return Err(TransportError::Timeout("connect", self.connect_timeout)),
        };

        // keepalive is only reachable through the std socket
        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(self.keepalive) {
            warn!("{}: failed to set TCP keepalive: {}", addr, e);
        }
        let stream = TcpStream::from_std(std_stream)?;

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{}: failed to set TCP_NODELAY: {}", addr, e);
            }
        }

        info!("{}: TCP connection established", addr);
        Ok(stream)
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
