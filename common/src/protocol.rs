//! Wire protocol between `rkm` and `rkm-helper`.
//!
//! Each message travels as one length-delimited frame whose body is the
//! bincode encoding of a [`HelperRequest`] or a [`HelperResponse`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{ActionRequest, ActionResult};

/// Upper bound of a single frame.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Operations the privileged helper exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperRequest {
    RemountReadWrite(ActionRequest),
    GetVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperResponse {
    Remount(ActionResult),
    Version(String),
    /// The helper could not understand or serve the request.
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

/// A stream carrying helper frames.
pub type HelperStream<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S>(stream: S) -> HelperStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}

impl HelperRequest {
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl HelperResponse {
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        HelperResponse::Error(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = framed(client);
        let mut server = framed(server);

        let request = HelperRequest::RemountReadWrite(ActionRequest::new("/dev/sdb1", "Backup"));
        client.send(request.to_bytes().unwrap()).await.unwrap();

        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(HelperRequest::from_bytes(&frame).unwrap(), request);

        let response = HelperResponse::Remount(ActionResult::failed("Failed to unmount /dev/sdb1"));
        server.send(response.to_bytes().unwrap()).await.unwrap();
        let frame = client.next().await.unwrap().unwrap();
        assert_eq!(HelperResponse::from_bytes(&frame).unwrap(), response);
    }

    #[test]
    fn test_reject_garbage() {
        assert!(matches!(
            HelperRequest::from_bytes(b"not a request"),
            Err(ProtocolError::Decode(_))
        ));
    }
}
