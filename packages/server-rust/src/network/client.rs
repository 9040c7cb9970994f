//! Binary RPC client for calling another server of this framework.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rpcserve_core::{serial, CodecError, ReplyEnvelope, RequestEnvelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::method::context::SessionConfig;

/// Largest reply the client accepts.
const MAX_REPLY_SIZE: usize = 100_000_000;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The remote method reported an error.
    #[error("remote error: {0}")]
    Remote(String),
    #[error("connection closed before a reply arrived")]
    Closed,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// A keep-alive connection speaking the length-prefixed binary protocol.
pub struct RpcClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    user_agent: String,
}

impl RpcClient {
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the connection cannot be opened.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(MAX_REPLY_SIZE)
            .new_codec();
        Ok(Self {
            framed: Framed::new(stream, codec),
            user_agent: SessionConfig::default().internal_user_agent,
        })
    }

    /// Overrides the `User-Agent` sent with calls that do not set one.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sends one request and waits for its reply.
    ///
    /// # Errors
    ///
    /// Fails on transport and envelope decoding errors. A failed reply is
    /// returned as-is.
    pub async fn call_envelope(&mut self, mut request: RequestEnvelope) -> Result<ReplyEnvelope, ClientError> {
        request
            .http_header
            .insert_if_absent("user-agent", self.user_agent.clone());
        let body = serial::to_binary(&request)?;
        self.framed.send(Bytes::from(body)).await?;

        let frame = self.framed.next().await.ok_or(ClientError::Closed)??;
        Ok(serial::from_binary(&frame)?)
    }

    /// Calls `opname` with a typed input and decodes the typed output.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Remote` with the server's message when the
    /// call fails remotely.
    pub async fn call<I, O>(&mut self, opname: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let request = RequestEnvelope::with_input(opname, input)?;
        let reply = self.call_envelope(request).await?;
        if !reply.success {
            return Err(ClientError::Remote(reply.error_message()));
        }
        Ok(reply.output()?)
    }

    /// [`RpcClient::call`] bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Timeout` when no reply arrives in time.
    pub async fn call_with_timeout<I, O>(
        &mut self,
        opname: &str,
        input: &I,
        timeout: Duration,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        tokio::time::timeout(timeout, self.call(opname, input))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use rpcserve_core::ErrorMessage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Answers one framed request with `reply`, returning what it read.
    async fn one_shot_server(reply: ReplyEnvelope) -> (SocketAddr, tokio::task::JoinHandle<RequestEnvelope>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut body).await.unwrap();
            stream.write_all(&reply.to_frame().unwrap()).await.unwrap();
            serial::from_binary(&body).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn typed_call_round_trip() {
        let (addr, server) = one_shot_server(ReplyEnvelope::ok(serial::to_binary(&11i64).unwrap())).await;
        let mut client = RpcClient::connect(addr).await.unwrap();
        let sum: i64 = client.call("ADD", &(1, 10)).await.unwrap();
        assert_eq!(sum, 11);

        let seen = server.await.unwrap();
        assert_eq!(seen.opname, "ADD");
        assert_eq!(seen.http_header.get("User-Agent"), Some("rpcserve-client"));
    }

    #[tokio::test]
    async fn remote_failure_carries_message() {
        let payload = serial::to_binary(&ErrorMessage::new("nope")).unwrap();
        let (addr, _server) = one_shot_server(ReplyEnvelope::failed(payload)).await;
        let mut client = RpcClient::connect(addr).await.unwrap();
        let err = client.call::<_, i64>("ADD", &1).await.unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref msg) if msg == "nope"));
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let mut client = RpcClient::connect(addr).await.unwrap();
        let err = client.call::<_, i64>("ADD", &1).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed | ClientError::Io(_)));
    }
}
