use std::io;

use crate::{
    auth::{ClientAuthStrategy, ServerAuthStrategy},
    net_async,
};

#[derive(Clone, Copy, Debug)]
pub struct ServerOptions {
    auth_strategy: ServerAuthStrategy,
}

impl ServerOptions {
    pub fn new(auth_strategy: ServerAuthStrategy) -> Self {
        Self { auth_strategy }
    }

    /// Builds a new [ServerListener][net_async::ServerListener], ready to accept new connections.
    pub async fn bind_async(
        self,
        addr: impl tokio::net::ToSocketAddrs,
    ) -> io::Result<net_async::ServerListener> {
        net_async::ServerListener::bind(self.auth_strategy, addr).await
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ClientOptions {
    auth_strategy: ClientAuthStrategy,
}

impl ClientOptions {
    pub fn new(auth_strategy: ClientAuthStrategy) -> Self {
        Self { auth_strategy }
    }

    pub fn build_async(self) -> net_async::ConfiguredClient {
        net_async::ConfiguredClient::new(self.auth_strategy)
    }
}
