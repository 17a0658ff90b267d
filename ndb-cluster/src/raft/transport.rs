// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::raft::message::{Request, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame codec error: {0}")]
    Codec(String),
    #[error("Peer closed the connection")]
    Closed,
    #[error("RPC timed out")]
    Timeout,
}

pub struct IncomingRpc {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Bytes, TransportError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|err| TransportError::Codec(err.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, TransportError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|err| TransportError::Codec(err.to_string()))
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// Accept loop: each connection carries a sequence of request/response
/// frames, dispatched to the raft core through `rpc_tx`.
pub fn spawn_server(
    listener: TcpListener,
    rpc_tx: mpsc::Sender<IncomingRpc>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let rpc_tx = rpc_tx.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(err) = serve_connection(stream, rpc_tx, shutdown).await {
                                    debug!(%peer_addr, "Raft connection ended: {err}");
                                }
                            });
                        }
                        Err(err) => {
                            debug!("Raft accept failed: {err}");
                        }
                    }
                }
            }
        }
    })
}

async fn serve_connection(
    stream: TcpStream,
    rpc_tx: mpsc::Sender<IncomingRpc>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let mut framed = Framed::new(stream, codec());

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else { break };
        let request: Request = decode(&frame?)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if rpc_tx
            .send(IncomingRpc {
                request,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            break;
        }
        let response = reply_rx
            .await
            .unwrap_or_else(|_| Response::Error("raft node is shutting down".to_string()));
        framed.send(encode(&response)?).await?;
    }
    Ok(())
}

/// One-shot RPC: connect, send, await the single response frame.
pub async fn call(addr: &str, request: &Request, timeout: Duration) -> Result<Response, TransportError> {
    let exchange = async {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, codec());
        framed.send(encode(request)?).await?;
        match framed.next().await {
            Some(Ok(frame)) => decode(&frame),
            Some(Err(err)) => Err(err.into()),
            None => Err(TransportError::Closed),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Timeout)?
}
