//! Length-delimited MessagePack framing for every distdev connection.
//!
//! Each frame carries one message encoded with `rmp-serde` using named
//! fields, so `serde_json::Value` payloads survive unchanged.

use bytes::{Bytes, BytesMut};
use distdev_core::{ClusterError, ClusterResult};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Largest frame accepted on any connection
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Read half of a framed connection
pub type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

/// Write half of a framed connection
pub type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Split a connected stream into framed halves
///
/// # Errors
///
/// Returns error if socket options cannot be set
pub fn split(stream: TcpStream) -> ClusterResult<(FrameReader, FrameWriter)> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok((
        FramedRead::new(read, codec()),
        FramedWrite::new(write, codec()),
    ))
}

/// Encode one message
///
/// # Errors
///
/// Returns [`ClusterError::Transport`] if the message cannot be serialized
pub fn encode<T: Serialize>(message: &T) -> ClusterResult<Bytes> {
    rmp_serde::to_vec_named(message)
        .map(Bytes::from)
        .map_err(|e| ClusterError::Transport(format!("encode failed: {}", e)))
}

/// Decode one message
///
/// # Errors
///
/// Returns [`ClusterError::Transport`] if the frame is not a valid message
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> ClusterResult<T> {
    rmp_serde::from_slice(frame)
        .map_err(|e| ClusterError::Transport(format!("decode failed: {}", e)))
}

/// Encode and write one message
///
/// # Errors
///
/// Returns error if encoding or the write fails
pub async fn send<S, T>(sink: &mut S, message: &T) -> ClusterResult<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    sink.send(frame).await?;
    Ok(())
}

/// Read the next undecoded frame; `None` once the peer has closed
///
/// # Errors
///
/// Returns error if the read fails
pub async fn recv_frame<S>(stream: &mut S) -> ClusterResult<Option<BytesMut>>
where
    S: Stream<Item = Result<BytesMut, std::io::Error>> + Unpin,
{
    match stream.next().await {
        Some(Ok(frame)) => Ok(Some(frame)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Read and decode the next message; `None` once the peer has closed
///
/// # Errors
///
/// Returns error if the read fails or the frame does not decode
pub async fn recv<S, T>(stream: &mut S) -> ClusterResult<Option<T>>
where
    S: Stream<Item = Result<BytesMut, std::io::Error>> + Unpin,
    T: DeserializeOwned,
{
    match recv_frame(stream).await? {
        Some(frame) => decode(&frame).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Sample {
        Text(String),
        Payload { id: u64, value: serde_json::Value },
    }

    #[test]
    fn test_json_values_survive_encoding() {
        let message = Sample::Payload {
            id: 7,
            value: json!({"nested": [1, 2.5, null, "x"], "flag": true}),
        };
        let frame = encode(&message).unwrap();
        assert_eq!(decode::<Sample>(&frame).unwrap(), message);
    }

    #[test]
    fn test_garbage_is_transport_error() {
        assert!(matches!(
            decode::<Sample>(&[0xc1, 0x00]),
            Err(ClusterError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_frames_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = split(stream).unwrap();
            while let Some(msg) = recv::<_, Sample>(&mut reader).await.unwrap() {
                send(&mut writer, &msg).await.unwrap();
            }
        });

        let (mut reader, mut writer) = split(TcpStream::connect(addr).await.unwrap()).unwrap();
        for i in 0..3 {
            send(&mut writer, &Sample::Text(format!("m{}", i))).await.unwrap();
        }
        for i in 0..3 {
            let echoed: Sample = recv(&mut reader).await.unwrap().unwrap();
            assert_eq!(echoed, Sample::Text(format!("m{}", i)));
        }

        drop(writer);
        assert!(recv::<_, Sample>(&mut reader).await.unwrap().is_none());
        server.await.unwrap();
    }
}
