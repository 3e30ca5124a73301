use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// A unit of traffic on a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Frame {
    /// Subject-tagged application payload.
    Data {
        subject: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Liveness signal, sent when beaconing is enabled.
    Beacon,
    /// Clean shutdown announced by the sender.
    Close,
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Write a length-prefixed frame to a byte stream.
pub(crate) async fn write_framed<W>(send: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = (data.len() as u32).to_be_bytes();
    send.write_all(&len).await?;
    send.write_all(data).await?;
    send.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame from a byte stream.
pub(crate) async fn read_framed<R>(recv: &mut R, max_size: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;

    Ok(buf)
}
