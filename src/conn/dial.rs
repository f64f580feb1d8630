//! Client-side dialing
//!
//! Opens a TCP stream to a server, runs the client half of the upgrade
//! handshake and hands back a client-role connection.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{BoxedReader, Connection};
use crate::config::ClientConfig;
use crate::protocol::{request_upgrade, HandshakeError, HandshakeResult, Role, UpgradeRequest};

/// Dial `addr` with the default client settings
pub async fn dial(addr: &str) -> HandshakeResult<Arc<Connection>> {
    dial_with_config(addr, ClientConfig::default()).await
}

/// Dial `addr`, requesting subprotocol `protocol`
pub async fn dial_protocol(addr: &str, protocol: &str) -> HandshakeResult<Arc<Connection>> {
    dial_with_config(addr, ClientConfig::default().with_protocol(protocol)).await
}

/// Dial `addr` with explicit client settings.
///
/// Connect and handshake together must finish within
/// `config.handshake_timeout`.
pub async fn dial_with_config(addr: &str, config: ClientConfig) -> HandshakeResult<Arc<Connection>> {
    let connect = async {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        debug!("Connected to {}, sending upgrade request", addr);

        let (read_half, mut write_half) = stream.into_split();
        let reader: BoxedReader = Box::new(read_half);
        let mut reader = BufReader::new(reader);

        let request = UpgradeRequest::new(addr, config.path.as_str(), config.protocol.as_deref());
        let response =
            request_upgrade(&mut reader, &mut write_half, &request, config.verify_accept).await?;

        Ok::<_, HandshakeError>((reader, write_half, peer_addr, local_addr, response.protocol))
    };

    let (reader, writer, peer_addr, local_addr, protocol) =
        tokio::time::timeout(config.handshake_timeout, connect)
            .await
            .map_err(|_| HandshakeError::Timeout)??;

    let conn = Connection::new(reader, Box::new(writer), Role::Client, config.connection)
        .with_peer_addr(peer_addr)
        .with_local_addr(local_addr)
        .with_protocol(protocol);
    info!("Connection {} established to {}", conn.id(), addr);

    Ok(Arc::new(conn))
}
