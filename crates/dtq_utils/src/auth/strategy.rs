use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::token::{Signature, SIGNATURE_LEN};

/// Builds the matching server and client strategies for one shared signature.
pub fn build_strategies(signature: Signature) -> (ServerAuthStrategy, ClientAuthStrategy) {
    (
        ServerAuthStrategy::with_signature(signature),
        ClientAuthStrategy::with_signature(signature),
    )
}

#[derive(Clone, Copy, Debug)]
enum ClientAuthStrategyInner {
    /// The client sends no auth, and expects the server not to check for any.
    NoAuth,
    /// The client sends a constant [Signature] header to the server.
    Signature(Signature),
}

/// Strategy for a request-sending client.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct ClientAuthStrategy(ClientAuthStrategyInner);

impl ClientAuthStrategy {
    pub fn no_auth() -> Self {
        Self(ClientAuthStrategyInner::NoAuth)
    }

    pub fn with_signature(signature: Signature) -> Self {
        Self(ClientAuthStrategyInner::Signature(signature))
    }

    /// Attaches auth as a constant header to a writable stream, intended to be a connection to a
    /// server.
    /// This must be the first write done in a connection to a server.
    pub async fn async_send<W>(&self, stream: &mut W) -> io::Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        match self.0 {
            ClientAuthStrategyInner::NoAuth => {}
            ClientAuthStrategyInner::Signature(signature) => {
                // Unlike the message protocol, signatures are written as a fixed-size header.
                stream.write_all(&signature.0).await?;
            }
        }
        Ok(())
    }
}

impl From<Option<Signature>> for ClientAuthStrategy {
    fn from(signature: Option<Signature>) -> Self {
        match signature {
            Some(signature) => Self::with_signature(signature),
            None => Self::no_auth(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ServerAuthStrategyInner {
    /// Expects no authentication headers.
    NoAuth,
    /// Expects every connection to open with the given signature.
    Signature(Signature),
}

#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct ServerAuthStrategy(ServerAuthStrategyInner);

impl ServerAuthStrategy {
    pub fn no_auth() -> Self {
        Self(ServerAuthStrategyInner::NoAuth)
    }

    pub fn with_signature(signature: Signature) -> Self {
        Self(ServerAuthStrategyInner::Signature(signature))
    }

    /// Verifies that a readable stream, intended to be a connection from a client, has
    /// written the expected signature as its header.
    ///
    /// This must be the first read done when accepting a client connection.
    pub async fn async_verify_header<R>(&self, stream: &mut R) -> io::Result<()>
    where
        R: AsyncReadExt + Unpin,
    {
        match &self.0 {
            ServerAuthStrategyInner::NoAuth => Ok(()),
            ServerAuthStrategyInner::Signature(expected) => {
                let mut header = [0; SIGNATURE_LEN];
                stream.read_exact(&mut header).await?;

                if expected.matches(&header) {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "connection presented an invalid signature",
                    ))
                }
            }
        }
    }
}

impl From<Option<Signature>> for ServerAuthStrategy {
    fn from(signature: Option<Signature>) -> Self {
        match signature {
            Some(signature) => Self::with_signature(signature),
            None => Self::no_auth(),
        }
    }
}
