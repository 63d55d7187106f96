//! Websocket transport.
//!
//! Runs as a service loop on the scheduler runtime. The outbound receiver is
//! owned by the loop itself, so producers keep a valid queue across
//! reconnects; messages enqueued while disconnected are delivered after the
//! next successful connect.

use async_tungstenite::tungstenite::{Error as WsError, Message};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConnectionState, Link, Outbound, Subscribers};
use crate::scheduler::Spawner;

/// Handle to a running websocket connection loop.
pub struct WsTransport {
    link: Link,
    subscribers: Subscribers,
    join: Option<JoinHandle<()>>,
}

/// Why a connected session ended.
enum SessionEnd {
    /// Peer closed or the socket failed; reconnect.
    Lost,
    /// Every producer is gone; stop for good.
    OutboundClosed,
}

impl WsTransport {
    /// Start connecting to `url` on the scheduler runtime.
    pub fn spawn(
        spawner: &Spawner,
        url: String,
        reconnect_interval: Duration,
        outbound_capacity: usize,
        subscribers: Subscribers,
    ) -> Self {
        let (outbound, outgoing) = Outbound::channel(outbound_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let join = spawner.spawn_service(connection_loop(
            url,
            reconnect_interval,
            outgoing,
            subscribers.clone(),
            state_tx,
        ));
        Self {
            link: Link {
                outbound,
                connection: state_rx,
            },
            subscribers,
            join: Some(join),
        }
    }

    pub fn link(&self) -> Link {
        self.link.clone()
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    pub fn stop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
            debug!("websocket transport stopped");
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn connection_loop(
    url: String,
    reconnect_interval: Duration,
    mut outgoing: mpsc::Receiver<String>,
    subscribers: Subscribers,
    state: watch::Sender<ConnectionState>,
) {
    loop {
        state.send_replace(ConnectionState::Connecting);
        match async_tungstenite::tokio::connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                info!(%url, "connected to controller");
                state.send_replace(ConnectionState::Connected);
                let end = session(socket, &mut outgoing, &subscribers).await;
                state.send_replace(ConnectionState::Disconnected);
                if let SessionEnd::OutboundClosed = end {
                    info!("outbound queue closed, transport exiting");
                    return;
                }
                warn!(%url, "connection lost, reconnecting in {:?}", reconnect_interval);
            }
            Err(error) => {
                state.send_replace(ConnectionState::Disconnected);
                warn!(%url, %error, "connect failed, retrying in {:?}", reconnect_interval);
            }
        }
        tokio::time::sleep(reconnect_interval).await;
    }
}

async fn session<S>(
    socket: S,
    outgoing: &mut mpsc::Receiver<String>,
    subscribers: &Subscribers,
) -> SessionEnd
where
    S: futures::Stream<Item = Result<Message, WsError>> + futures::Sink<Message, Error = WsError> + Unpin,
{
    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => subscribers.dispatch(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "controller closed the connection");
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%error, "websocket read failed");
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            },
            payload = outgoing.recv() => match payload {
                Some(payload) => {
                    if let Err(error) = sink.send(Message::text(payload)).await {
                        warn!(%error, "websocket write failed");
                        return SessionEnd::Lost;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return SessionEnd::OutboundClosed;
                }
            },
        }
    }
}
