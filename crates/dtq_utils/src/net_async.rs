//! Tokio-async TCP connections between dtq processes.
//! Must be created in a Tokio runtime.
//!
//! A server accepts [UnverifiedServerStream]s and must complete a [handshake][ServerHandshakeCtx]
//! before reading any message from them. The handshake is performed by the task serving the
//! connection rather than the accept loop, so a slow client cannot stall the acceptance of others.

use std::{io, net::SocketAddr, time::Duration};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::auth::{ClientAuthStrategy, ServerAuthStrategy};

/// How long a server waits for a new connection to present its auth header.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type ServerStream = TcpStream;
pub type ClientStream = TcpStream;

/// A freshly accepted connection whose auth header has not been checked.
#[derive(Debug)]
pub struct UnverifiedServerStream(TcpStream);

impl UnverifiedServerStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }
}

pub struct ServerListener {
    listener: TcpListener,
    auth_strategy: ServerAuthStrategy,
}

impl ServerListener {
    pub async fn bind(
        auth_strategy: ServerAuthStrategy,
        addr: impl ToSocketAddrs,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            auth_strategy,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(UnverifiedServerStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((UnverifiedServerStream(stream), addr))
    }

    pub fn handshake_ctx(&self) -> ServerHandshakeCtx {
        ServerHandshakeCtx {
            auth_strategy: self.auth_strategy,
        }
    }
}

/// Verifies accepted connections. Cheap to clone and share between connection tasks.
#[derive(Clone, Copy, Debug)]
pub struct ServerHandshakeCtx {
    auth_strategy: ServerAuthStrategy,
}

impl ServerHandshakeCtx {
    pub async fn handshake(&self, stream: UnverifiedServerStream) -> io::Result<ServerStream> {
        let UnverifiedServerStream(mut stream) = stream;

        let verified = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.auth_strategy.async_verify_header(&mut stream),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                "connection did not present its auth header in time",
            )
        })?;
        verified?;

        Ok(stream)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConfiguredClient {
    auth_strategy: ClientAuthStrategy,
}

impl ConfiguredClient {
    pub fn new(auth_strategy: ClientAuthStrategy) -> Self {
        Self { auth_strategy }
    }

    pub async fn connect(&self, addr: SocketAddr) -> io::Result<ClientStream> {
        let mut stream = TcpStream::connect(addr).await?;

        // Make our auth header, if any, known to the server.
        self.auth_strategy.async_send(&mut stream).await?;

        Ok(stream)
    }
}
