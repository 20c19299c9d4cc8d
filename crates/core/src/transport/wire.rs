//! Length prefixed frames for the connection oriented transports.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

pub(crate) const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(options().serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(options().deserialize(bytes)?)
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(value)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::MessageTooBig {
            size: bytes.len(),
            max_size: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly
/// before starting a new frame.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::MessageTooBig {
            size: len,
            max_size: MAX_FRAME_SIZE,
        });
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    decode(&buf).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{test_support::request, RpcFrame};

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = request(1, 2, b"ping");
        write_frame(&mut client, &sent).await.unwrap();
        write_frame(&mut client, &RpcFrame::Reply { accepted: true })
            .await
            .unwrap();
        drop(client);

        let received: crate::message::Request = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, sent);
        let reply: RpcFrame = read_frame(&mut server).await.unwrap().unwrap();
        assert!(matches!(reply, RpcFrame::Reply { accepted: true }));
        let eof: Option<RpcFrame> = read_frame(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(u32::MAX).await.unwrap();
        let res: Result<Option<RpcFrame>, _> = read_frame(&mut server).await;
        assert!(matches!(res, Err(TransportError::MessageTooBig { .. })));
    }
}
