//! # Transport
//!
//! Connected bidirectional frame pipes between two peers. Two schemes are
//! supported:
//!
//! - `tcp://host:port` for cross-process sessions, with nodelay and buffer
//!   sizing applied through `socket2`
//! - `inproc://name` for same-process peers, built on in-memory duplex pipes
//!   registered on a process-global board
//!
//! The transport guarantees message boundaries and in-order delivery within
//! a session, and surfaces peer disconnect as an error on the next read or
//! write. It never reconnects: a broken session is terminal for the client
//! that owned it.

use crate::wire::{read_frame, write_frame, Frame};
use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Parsed peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    /// `host:port` endpoint
    Tcp(String),
    /// Name on the in-process board
    Inproc(String),
}

impl Addr {
    /// Parse a peer URL of scheme `tcp` or `inproc`.
    pub fn parse(raw: &str) -> Result<Addr> {
        let url = Url::parse(raw).with_context(|| format!("invalid address {raw:?}"))?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| anyhow!("tcp address {raw:?} has no host"))?;
                let port = url
                    .port()
                    .ok_or_else(|| anyhow!("tcp address {raw:?} has no port"))?;
                Ok(Addr::Tcp(format!("{host}:{port}")))
            }
            "inproc" => {
                let name = url
                    .host_str()
                    .ok_or_else(|| anyhow!("inproc address {raw:?} has no name"))?;
                Ok(Addr::Inproc(name.to_string()))
            }
            other => Err(anyhow!("unsupported address scheme {other:?}")),
        }
    }

    /// Canonical URL form of this address.
    pub fn to_url(&self) -> String {
        match self {
            Addr::Tcp(hostport) => format!("tcp://{hostport}"),
            Addr::Inproc(name) => format!("inproc://{name}"),
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Reading half of a frame pipe.
pub struct FrameReader {
    stream: BoxedRead,
}

impl FrameReader {
    /// Receive the next frame; errors are terminal for the session.
    pub async fn recv(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream).await
    }
}

/// Writing half of a frame pipe.
pub struct FrameWriter {
    stream: BoxedWrite,
}

impl FrameWriter {
    /// Send one frame; errors are terminal for the session.
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.stream, frame).await
    }
}

fn split_stream<S>(stream: S) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (
        FrameReader {
            stream: Box::new(read),
        },
        FrameWriter {
            stream: Box::new(write),
        },
    )
}

/// Apply low-latency socket options in both directions.
fn tune_tcp(stream: TcpStream, buffer_size: usize) -> Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(TcpStream::from_std(socket.into())?)
}

// Board of live inproc listeners. Connecting pushes the server end of a
// fresh duplex pipe into the listener's queue.
lazy_static! {
    static ref INPROC_BOARD: Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>> =
        Mutex::new(HashMap::new());
}

const INPROC_PIPE_CAPACITY: usize = 256 * 1024;

/// Connect to a listening peer and return the two halves of the session.
pub async fn connect(addr: &Addr, buffer_size: usize) -> Result<(FrameReader, FrameWriter)> {
    match addr {
        Addr::Tcp(hostport) => {
            debug!("connecting to tcp://{hostport}");
            let stream = TcpStream::connect(hostport.as_str()).await?;
            let stream = tune_tcp(stream, buffer_size)?;
            Ok(split_stream(stream))
        }
        Addr::Inproc(name) => {
            let (local, remote) = tokio::io::duplex(INPROC_PIPE_CAPACITY);
            let sender = INPROC_BOARD
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("no inproc listener named {name:?}"))?;
            sender
                .send(remote)
                .map_err(|_| anyhow!("inproc listener {name:?} is gone"))?;
            debug!("connected to inproc://{name}");
            Ok(split_stream(local))
        }
    }
}

/// Listening endpoint accepting frame pipe sessions.
pub enum FrameListener {
    Tcp {
        listener: TcpListener,
        buffer_size: usize,
    },
    Inproc {
        name: String,
        incoming: mpsc::UnboundedReceiver<DuplexStream>,
    },
}

impl FrameListener {
    /// Bind a listener and report its canonical address.
    ///
    /// TCP port 0 binds an ephemeral port; the returned address carries the
    /// real one so peers and descriptors always name a reachable endpoint.
    pub async fn bind(addr: &Addr, buffer_size: usize) -> Result<(FrameListener, Addr)> {
        match addr {
            Addr::Tcp(hostport) => {
                let listener = TcpListener::bind(hostport.as_str())
                    .await
                    .with_context(|| format!("binding tcp://{hostport}"))?;
                let local = listener.local_addr()?;
                debug!("listening on tcp://{local}");
                Ok((
                    FrameListener::Tcp {
                        listener,
                        buffer_size,
                    },
                    Addr::Tcp(local.to_string()),
                ))
            }
            Addr::Inproc(name) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut board = INPROC_BOARD.lock();
                if board.contains_key(name) {
                    return Err(anyhow!("inproc name {name:?} is already bound"));
                }
                board.insert(name.clone(), tx);
                debug!("listening on inproc://{name}");
                Ok((
                    FrameListener::Inproc {
                        name: name.clone(),
                        incoming: rx,
                    },
                    Addr::Inproc(name.clone()),
                ))
            }
        }
    }

    /// Accept the next inbound session.
    pub async fn accept(&mut self) -> Result<(FrameReader, FrameWriter)> {
        match self {
            FrameListener::Tcp {
                listener,
                buffer_size,
            } => {
                let (stream, peer) = listener.accept().await?;
                debug!("accepted tcp session from {peer}");
                let stream = tune_tcp(stream, *buffer_size)?;
                Ok(split_stream(stream))
            }
            FrameListener::Inproc { name, incoming } => {
                let stream = incoming
                    .recv()
                    .await
                    .ok_or_else(|| anyhow!("inproc listener {name:?} closed"))?;
                debug!("accepted inproc session on {name}");
                Ok(split_stream(stream))
            }
        }
    }
}

impl Drop for FrameListener {
    fn drop(&mut self) {
        if let FrameListener::Inproc { name, .. } = self {
            INPROC_BOARD.lock().remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Notice;

    #[test]
    fn address_parsing() {
        assert_eq!(
            Addr::parse("tcp://127.0.0.1:4000").unwrap(),
            Addr::Tcp("127.0.0.1:4000".to_string())
        );
        assert_eq!(
            Addr::parse("inproc://loop").unwrap(),
            Addr::Inproc("loop".to_string())
        );
        assert!(Addr::parse("udp://nope:1").is_err());
        assert!(Addr::parse("tcp://missing-port").is_err());

        let addr = Addr::parse("tcp://[::1]:9001").unwrap();
        assert_eq!(addr.to_url(), "tcp://[::1]:9001");
    }

    #[tokio::test]
    async fn tcp_session_round_trip() {
        let bind = Addr::parse("tcp://127.0.0.1:0").unwrap();
        let (mut listener, bound) = FrameListener::bind(&bind, 8192).await.unwrap();

        let client = tokio::spawn(async move {
            let (mut reader, mut writer) = connect(&bound, 8192).await.unwrap();
            writer
                .send(&Frame::Notice(Notice::Hello {
                    peer: "client-test".to_string(),
                }))
                .await
                .unwrap();
            match reader.recv().await.unwrap() {
                Frame::Notice(Notice::ServerClosed) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        });

        let (mut reader, mut writer) = listener.accept().await.unwrap();
        match reader.recv().await.unwrap() {
            Frame::Notice(Notice::Hello { peer }) => assert_eq!(peer, "client-test"),
            other => panic!("unexpected frame: {other:?}"),
        }
        writer
            .send(&Frame::Notice(Notice::ServerClosed))
            .await
            .unwrap();

        client.await.unwrap();
    }

    #[tokio::test]
    async fn inproc_session_round_trip() {
        let bind = Addr::parse("inproc://transport-test").unwrap();
        let (mut listener, bound) = FrameListener::bind(&bind, 8192).await.unwrap();

        // Duplicate binds of the same name are refused.
        assert!(FrameListener::bind(&bind, 8192).await.is_err());

        let (_reader, mut writer) = connect(&bound, 8192).await.unwrap();
        writer
            .send(&Frame::Notice(Notice::Hello {
                peer: "inproc-peer".to_string(),
            }))
            .await
            .unwrap();

        let (mut server_reader, _server_writer) = listener.accept().await.unwrap();
        match server_reader.recv().await.unwrap() {
            Frame::Notice(Notice::Hello { peer }) => assert_eq!(peer, "inproc-peer"),
            other => panic!("unexpected frame: {other:?}"),
        }

        // Dropping the listener frees the name for rebinding.
        drop(listener);
        assert!(FrameListener::bind(&bind, 8192).await.is_ok());
    }

    #[tokio::test]
    async fn connect_to_missing_inproc_name_fails() {
        let addr = Addr::parse("inproc://nobody-home").unwrap();
        assert!(connect(&addr, 8192).await.is_err());
    }
}
