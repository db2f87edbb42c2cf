//! Frame loop serving a [`Dispatcher`] over one or more links.
//!
//! Handlers may block for the length of an EXEC, so each frame is handed to
//! the blocking pool. Frames on a link are answered strictly in order.

use crate::device::dispatcher::Dispatcher;
use crate::network::codec::FrameCodec;
use crate::network::link::{Link, TcpLink};
use crate::{error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub struct DeviceServer {
    dispatcher: Arc<Mutex<Dispatcher>>,
    codec: FrameCodec,
}

impl DeviceServer {
    pub fn new(dispatcher: Dispatcher, codec: FrameCodec) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            codec,
        })
    }

    /// Runs `f` with exclusive access to the dispatcher.
    pub fn with_dispatcher<R>(&self, f: impl FnOnce(&mut Dispatcher) -> R) -> R {
        let mut guard = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Answers frames on `link` until the peer hangs up.
    ///
    /// Noise the codec gives up on is logged and the session carries on.
    pub async fn serve<L: Link>(self: Arc<Self>, mut link: L) -> io::Result<()> {
        loop {
            let frame = match self.codec.read_frame(&mut link).await {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("discarding line noise: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let dispatcher = self.dispatcher.clone();
            let (header, payload) = tokio::task::spawn_blocking(move || {
                let mut guard = dispatcher.lock().unwrap_or_else(|e| e.into_inner());
                guard.handle_frame(&frame.header, &frame.payload, frame.trailing_crc_ok)
            })
            .await
            .map_err(|e| io::Error::other(format!("handler task failed: {e}")))?;

            self.codec.write_frame(&mut link, &header, &payload).await?;
        }
    }

    /// Accepts TCP connections on `addr` and serves each one.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let link = match TcpLink::from_stream(stream) {
                Ok(link) => link,
                Err(e) => {
                    warn!("dropping {}: {}", peer, e);
                    continue;
                }
            };

            info!("host connected from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                match server.serve(link).await {
                    Ok(()) => info!("host {} disconnected", peer),
                    Err(e) => error!("link to {} failed: {}", peer, e),
                }
            });
        }
    }
}
