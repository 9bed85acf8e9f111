use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame. A 10k-digit partial sum is ~13 KiB encoded;
/// anything near this limit is a broken or hostile peer.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

/// Transport and codec failures on the framed stream.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying stream failure (includes clean EOF mid-frame).
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer announced a frame larger than [`MAX_FRAME`].
    #[error("frame of {0} bytes exceeds limit")]
    Oversize(usize),

    /// The payload did not decode as the expected message type.
    #[error("malformed frame: {0}")]
    Decode(#[source] bincode::Error),

    /// The message failed to serialize (should not happen for these types).
    #[error("encode failure: {0}")]
    Encode(#[source] bincode::Error),
}

/// Read one length-prefixed message from the stream.
pub async fn read_message<S, M>(stream: &mut S) -> Result<M, WireError>
where
    S: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_raw = [0u8; 4];
    stream.read_exact(&mut len_raw).await?;
    let len = u32::from_le_bytes(len_raw) as usize;
    if len > MAX_FRAME {
        return Err(WireError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(WireError::Decode)
}

/// Write one length-prefixed message to the stream and flush it.
pub async fn write_message<S, M>(stream: &mut S, message: &M) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = bincode::serialize(message).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME {
        return Err(WireError::Oversize(payload.len()));
    }

    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobAssignment, Reply, Request};

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let sent = Request::Give {
            job_id: 7,
            result: vec![1, 2, 3, 4, 5],
            precision: 50_000,
        };
        write_message(&mut a, &sent).await.unwrap();
        let got: Request = read_message(&mut b).await.unwrap();
        assert_eq!(got, sent);

        let reply = Reply::Ask(JobAssignment {
            job_id: 7,
            first_term: 70,
            num_terms: 10,
        });
        write_message(&mut b, &reply).await.unwrap();
        let got: Reply = read_message(&mut a).await.unwrap();
        assert_eq!(got, reply);
    }

    #[tokio::test]
    async fn oversize_header_is_rejected_before_allocation() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let len = (MAX_FRAME as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();

        match read_message::<_, Request>(&mut b).await {
            Err(WireError::Oversize(n)) => assert_eq!(n, MAX_FRAME + 1),
            other => panic!("expected oversize error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_payload_is_a_decode_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut a, &4u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0xde, 0xad, 0xbe, 0xef])
            .await
            .unwrap();

        assert!(matches!(
            read_message::<_, Request>(&mut b).await,
            Err(WireError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut a, &100u32.to_le_bytes())
            .await
            .unwrap();
        drop(a);

        assert!(matches!(
            read_message::<_, Request>(&mut b).await,
            Err(WireError::Io(_))
        ));
    }
}
