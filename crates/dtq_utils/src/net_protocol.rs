//! Read/write protocol for dtq messages across networks.
//! The first 4 bytes of any message is the size of the message (in big-endian order).
//! The rest of the message are the contents, which are serde-serialized json.

use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub mod health;
pub mod queue;
pub mod workers;

/// Largest message a peer may announce. Guards against allocating for a corrupt size prefix.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Reads a message from a stream communicating with a dtq peer.
pub async fn async_read<R, T>(reader: &mut R) -> Result<T, io::Error>
where
    R: AsyncReadExt + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut msg_size_buf = [0; 4];
    reader.read_exact(&mut msg_size_buf).await?;
    let msg_size = u32::from_be_bytes(msg_size_buf);

    if msg_size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {msg_size} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}"),
        ));
    }

    let mut msg_buf = vec![0; msg_size as usize];
    reader.read_exact(&mut msg_buf).await?;

    let msg = serde_json::from_slice(&msg_buf)?;
    Ok(msg)
}

/// Writes a message to a stream communicating with a dtq peer.
pub async fn async_write<W, T>(writer: &mut W, msg: &T) -> Result<(), io::Error>
where
    W: AsyncWriteExt + Unpin,
    T: serde::Serialize,
{
    let msg_json = serde_json::to_vec(msg)?;

    let msg_size: u32 = msg_json.len().try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "message too large to frame")
    })?;

    let mut msg_buf = Vec::with_capacity(4 + msg_json.len());
    msg_buf.extend_from_slice(&msg_size.to_be_bytes());
    msg_buf.extend_from_slice(&msg_json);
    writer.write_all(&msg_buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Replaces the IP of a bound address with the IP the server should be reached at.
pub fn publicize_addr(bound: SocketAddr, public_ip: IpAddr) -> SocketAddr {
    SocketAddr::new(public_ip, bound.port())
}
