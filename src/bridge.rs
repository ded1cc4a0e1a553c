//! The duplex pump between one TCP stream and one WebSocket connection.
//!
//! A bridge goes through four states:
//!
//! ```text
//! CONNECTING --dial ok--> OPEN --eof / filter failure / i/o error--> CLOSING --> CLOSED
//!      \------------------------- dial failed ------------------------------->/
//! ```
//!
//! The side that triggered the bridge (an accepted TCP connection on the
//! client endpoint, an accepted WebSocket on the server endpoint) is already
//! established when the bridge is created. Whatever ends the bridge, both
//! sides are closed before it reports CLOSED.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as TungsteniteError, Message, Utf8Bytes,
        error::ProtocolError,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, trace, warn};

use crate::error::{FailureKind, TunnelError};
use crate::filter::{FilterError, FilterSnapshot};

/// Size of the TCP read buffer, and so the largest WebSocket message a
/// bridge sends.
pub const BUFFER_SIZE: usize = 8192;

/// Close code sent when a filter aborts the bridge.
pub const FILTER_FAILURE_CODE: u16 = 4000;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Which endpoint a bridge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeRole {
    /// Accepted a local TCP connection, dials a WebSocket URL.
    Client,
    /// Accepted a WebSocket, dials a TCP service.
    Server,
}

impl fmt::Display for BridgeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl BridgeState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open | Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Outcome of a bridge, produced once it is CLOSED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub id: u64,
    pub role: BridgeRole,
    pub state: BridgeState,
    /// WebSocket close code describing why the bridge ended.
    pub close_code: u16,
    pub close_reason: String,
    /// Set when the bridge ended because of a failure rather than a peer closing.
    pub failure: Option<FailureKind>,
    /// Bytes sent over the WebSocket after filtering.
    pub bytes_outbound: u64,
    /// Bytes written to the TCP side after filtering.
    pub bytes_inbound: u64,
}

/// Lifecycle notifications emitted by bridges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Opened { id: u64, role: BridgeRole },
    Closed(BridgeReport),
}

/// Optional destination for [`BridgeEvent`]s, handed to registries and bridges.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<BridgeEvent>>);

impl EventSink {
    /// A sink that drops every event.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// Creates a sink and the receiver its events arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn emit(&self, event: BridgeEvent) {
        if let Some(tx) = &self.0 {
            // receiver gone: nobody is listening anymore
            let _ = tx.send(event);
        }
    }
}

impl From<mpsc::UnboundedSender<BridgeEvent>> for EventSink {
    fn from(tx: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self(Some(tx))
    }
}

/// Why the OPEN state ended.
#[derive(Debug)]
enum CloseCause {
    LocalClosed,
    RemoteClosed(Option<CloseFrame>),
    Filter(FilterError),
    LocalIo(std::io::Error),
    RemoteIo(TungsteniteError),
}

impl CloseCause {
    fn from_ws_error(err: TungsteniteError) -> Self {
        match err {
            TungsteniteError::ConnectionClosed
            | TungsteniteError::AlreadyClosed
            | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::RemoteClosed(None)
            }
            err => Self::RemoteIo(err),
        }
    }

    fn close_frame(&self) -> CloseFrame {
        match self {
            Self::LocalClosed => CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("peer closed the connection"),
            },
            Self::RemoteClosed(Some(frame)) => frame.clone(),
            Self::RemoteClosed(None) => CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("websocket closed"),
            },
            Self::Filter(err) => CloseFrame {
                code: CloseCode::from(FILTER_FAILURE_CODE),
                reason: format!("filter {} failed", err.filter).into(),
            },
            Self::LocalIo(_) | Self::RemoteIo(_) => CloseFrame {
                code: CloseCode::Error,
                reason: Utf8Bytes::from_static("i/o failure"),
            },
        }
    }

    fn failure(&self) -> Option<FailureKind> {
        match self {
            Self::LocalClosed | Self::RemoteClosed(_) => None,
            Self::Filter(_) => Some(FailureKind::Filter),
            Self::LocalIo(_) | Self::RemoteIo(_) => Some(FailureKind::Io),
        }
    }
}

/// State shared by the client and server flavours of a bridge.
pub(crate) struct Bridge {
    id: u64,
    role: BridgeRole,
    state: BridgeState,
    filters: FilterSnapshot,
    events: EventSink,
}

impl Bridge {
    pub(crate) fn new(role: BridgeRole, filters: FilterSnapshot, events: EventSink) -> Self {
        Self {
            id: NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed),
            role,
            state: BridgeState::Connecting,
            filters,
            events,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> BridgeState {
        self.state
    }

    fn transition(&mut self, next: BridgeState) {
        if self.state.can_transition_to(next) {
            trace!(bridge = self.id, from = ?self.state, to = ?next, "Bridge state change");
            self.state = next;
        } else {
            warn!(bridge = self.id, from = ?self.state, to = ?next, "Ignoring invalid bridge transition");
        }
    }

    /// The counterpart could not be dialed: CONNECTING goes straight to CLOSED.
    pub(crate) fn dial_failed(&mut self, err: &TunnelError, close_code: u16) -> BridgeReport {
        self.transition(BridgeState::Closed);
        let report = BridgeReport {
            id: self.id,
            role: self.role,
            state: self.state,
            close_code,
            close_reason: err.to_string(),
            failure: Some(err.kind()),
            bytes_outbound: 0,
            bytes_inbound: 0,
        };
        self.events.emit(BridgeEvent::Closed(report.clone()));
        report
    }

    /// Runs both pumps until one side ends, then closes both sides.
    pub(crate) async fn pump<T, S>(&mut self, tcp: T, websocket: WebSocketStream<S>) -> BridgeReport
    where
        T: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(BridgeState::Open);
        self.events.emit(BridgeEvent::Opened {
            id: self.id,
            role: self.role,
        });

        let filters = self.filters.clone();
        let (mut tcp_reader, mut tcp_writer) = tokio::io::split(tcp);
        let (mut ws_sender, mut ws_receiver) = websocket.split();
        let mut bytes_outbound = 0u64;
        let mut bytes_inbound = 0u64;

        let tcp_to_ws = async {
            let mut buffer = [0u8; BUFFER_SIZE];

            loop {
                let n = match tcp_reader.read(&mut buffer).await {
                    Ok(0) => {
                        debug!("TCP connection closed");
                        return CloseCause::LocalClosed;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Failed to read from TCP");
                        return CloseCause::LocalIo(e);
                    }
                };

                let data = match filters.apply_outbound(buffer[..n].to_vec()) {
                    Ok(data) if data.is_empty() => {
                        trace!(bytes = n, "Outbound chunk suppressed by filters");
                        continue;
                    }
                    Ok(data) => data,
                    Err(e) => return CloseCause::Filter(e),
                };

                let len = data.len();
                trace!(bytes = len, "Forwarding data from TCP to WebSocket");
                if let Err(e) = ws_sender.send(Message::Binary(data.into())).await {
                    debug!(error = %e, bytes = len, "Failed to send WebSocket message");
                    return CloseCause::from_ws_error(e);
                }
                bytes_outbound += len as u64;
            }
        };

        let ws_to_tcp = async {
            while let Some(msg) = ws_receiver.next().await {
                let payload = match msg {
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "WebSocket connection closed");
                        return CloseCause::RemoteClosed(frame);
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "WebSocket read ended");
                        return CloseCause::from_ws_error(e);
                    }
                };

                let data = match filters.apply_inbound(payload) {
                    Ok(data) if data.is_empty() => {
                        trace!("Inbound message suppressed by filters");
                        continue;
                    }
                    Ok(data) => data,
                    Err(e) => return CloseCause::Filter(e),
                };

                trace!(bytes = data.len(), "Forwarding data from WebSocket to TCP");
                if let Err(e) = tcp_writer.write_all(&data).await {
                    debug!(error = %e, bytes = data.len(), "Failed to write to TCP");
                    return CloseCause::LocalIo(e);
                }
                bytes_inbound += data.len() as u64;
            }
            CloseCause::RemoteClosed(None)
        };

        let cause = tokio::select! {
            cause = tcp_to_ws => cause,
            cause = ws_to_tcp => cause,
        };

        self.transition(BridgeState::Closing);
        let frame = cause.close_frame();
        match &cause {
            CloseCause::Filter(e) => {
                warn!(bridge = self.id, filter = %e.filter, error = %e, "Filter aborted bridge");
            }
            CloseCause::LocalIo(e) => {
                warn!(bridge = self.id, error = %e, "TCP side failed");
            }
            CloseCause::RemoteIo(e) => {
                warn!(bridge = self.id, error = %e, "WebSocket side failed");
            }
            CloseCause::LocalClosed | CloseCause::RemoteClosed(_) => {}
        }

        // The peer already started the closing handshake; tungstenite answers it.
        if !matches!(cause, CloseCause::RemoteClosed(_)) {
            if let Err(e) = ws_sender.send(Message::Close(Some(frame.clone()))).await {
                debug!(error = %e, "Could not send close frame");
            }
        }
        if let Err(e) = ws_sender.close().await {
            debug!(error = %e, "Could not close WebSocket");
        }
        if let Err(e) = tcp_writer.shutdown().await {
            debug!(error = %e, "Could not shut down TCP stream");
        }
        drop((tcp_reader, tcp_writer, ws_sender, ws_receiver));

        self.transition(BridgeState::Closed);
        let report = BridgeReport {
            id: self.id,
            role: self.role,
            state: self.state,
            close_code: frame.code.into(),
            close_reason: frame.reason.as_str().to_string(),
            failure: cause.failure(),
            bytes_outbound,
            bytes_inbound,
        };
        info!(
            bridge = report.id,
            role = %report.role,
            close_code = report.close_code,
            bytes_outbound = report.bytes_outbound,
            bytes_inbound = report.bytes_inbound,
            "Bridge closed"
        );
        self.events.emit(BridgeEvent::Closed(report.clone()));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{
        Filter,
        tests::{DropFilter, RaiseFromWsFilter, RaiseToWsFilter, TagFilter},
    };
    use std::{sync::Arc, time::Duration};
    use tokio::{
        io::{DuplexStream, duplex},
        task::JoinHandle,
        time::timeout,
    };
    use tokio_tungstenite::tungstenite::protocol::Role;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    struct Harness {
        /// The TCP peer: what a local client or mapped service would see.
        tcp_peer: DuplexStream,
        /// The WebSocket peer: the other tunnel endpoint.
        ws_peer: WebSocketStream<DuplexStream>,
        bridge: JoinHandle<BridgeReport>,
        events: mpsc::UnboundedReceiver<BridgeEvent>,
    }

    async fn spawn_bridge(filters: Vec<Arc<dyn Filter>>) -> Harness {
        let (tcp_side, tcp_peer) = duplex(64 * 1024);
        let (ws_side, ws_peer_io) = duplex(64 * 1024);
        let ws_side = WebSocketStream::from_raw_socket(ws_side, Role::Server, None).await;
        let ws_peer = WebSocketStream::from_raw_socket(ws_peer_io, Role::Client, None).await;
        let (sink, events) = EventSink::channel();

        let mut bridge = Bridge::new(BridgeRole::Server, filters.into(), sink);
        let handle = tokio::spawn(async move { bridge.pump(tcp_side, ws_side).await });

        Harness {
            tcp_peer,
            ws_peer,
            bridge: handle,
            events,
        }
    }

    async fn next_ws_message(ws: &mut WebSocketStream<DuplexStream>) -> Message {
        timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for websocket message")
            .expect("websocket stream ended")
            .expect("websocket error")
    }

    async fn read_tcp(tcp: &mut DuplexStream) -> Vec<u8> {
        let mut buffer = vec![0u8; 1024];
        let n = timeout(TEST_TIMEOUT, tcp.read(&mut buffer))
            .await
            .expect("timed out waiting for tcp data")
            .unwrap();
        buffer.truncate(n);
        buffer
    }

    #[test]
    fn state_machine_allows_only_forward_moves() {
        use BridgeState::{Closed, Closing, Connecting, Open};
        assert!(Connecting.can_transition_to(Open));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Open));
    }

    #[test]
    fn dial_failure_goes_straight_to_closed() {
        let (sink, mut events) = EventSink::channel();
        let mut bridge = Bridge::new(BridgeRole::Client, FilterSnapshot::default(), sink);
        let err = TunnelError::EndpointNotAvailable {
            url: "ws://127.0.0.1:1/".into(),
            source: Box::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
        };

        let report = bridge.dial_failed(&err, 1011);
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(report.failure, Some(FailureKind::EndpointNotAvailable));
        assert_eq!(report.bytes_outbound + report.bytes_inbound, 0);
        assert_eq!(events.try_recv().unwrap(), BridgeEvent::Closed(report));
    }

    #[tokio::test]
    async fn each_tcp_read_becomes_one_binary_message() {
        let mut h = spawn_bridge(Vec::new()).await;

        h.tcp_peer.write_all(b"Hello World!").await.unwrap();
        let msg = next_ws_message(&mut h.ws_peer).await;
        assert_eq!(msg, Message::Binary(b"Hello World!".to_vec().into()));

        h.ws_peer
            .send(Message::Binary(b"\xff\xfd\x18".to_vec().into()))
            .await
            .unwrap();
        assert_eq!(read_tcp(&mut h.tcp_peer).await, b"\xff\xfd\x18");
    }

    #[tokio::test]
    async fn text_messages_are_forwarded_as_bytes() {
        let mut h = spawn_bridge(Vec::new()).await;

        h.ws_peer.send(Message::Text("plain text".to_string().into())).await.unwrap();
        assert_eq!(read_tcp(&mut h.tcp_peer).await, b"plain text");
    }

    #[tokio::test]
    async fn filters_run_in_order_on_both_directions() {
        let mut h = spawn_bridge(vec![Arc::new(TagFilter("1")), Arc::new(TagFilter("2"))]).await;

        h.tcp_peer.write_all(b"out").await.unwrap();
        assert_eq!(
            next_ws_message(&mut h.ws_peer).await,
            Message::Binary(b"out12".to_vec().into())
        );

        h.ws_peer.send(Message::Binary(b"in".to_vec().into())).await.unwrap();
        assert_eq!(read_tcp(&mut h.tcp_peer).await, b"in12");
    }

    #[tokio::test]
    async fn suppressed_chunks_keep_the_bridge_open() {
        let mut h = spawn_bridge(vec![Arc::new(DropFilter(b"drop"))]).await;

        h.tcp_peer.write_all(b"drop me").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.tcp_peer.write_all(b"keep me").await.unwrap();

        assert_eq!(
            next_ws_message(&mut h.ws_peer).await,
            Message::Binary(b"keep me".to_vec().into())
        );
        assert!(!h.bridge.is_finished());
    }

    #[tokio::test]
    async fn tcp_eof_closes_the_websocket() {
        let mut h = spawn_bridge(Vec::new()).await;
        drop(h.tcp_peer);

        match next_ws_message(&mut h.ws_peer).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }

        let report = timeout(TEST_TIMEOUT, h.bridge).await.unwrap().unwrap();
        assert_eq!(report.state, BridgeState::Closed);
        assert_eq!(report.failure, None);
    }

    #[tokio::test]
    async fn websocket_close_shuts_down_tcp() {
        let mut h = spawn_bridge(Vec::new()).await;
        h.ws_peer.close(None).await.unwrap();

        assert!(read_tcp(&mut h.tcp_peer).await.is_empty(), "expected EOF");
        let report = timeout(TEST_TIMEOUT, h.bridge).await.unwrap().unwrap();
        assert_eq!(report.state, BridgeState::Closed);
    }

    #[tokio::test]
    async fn inbound_filter_failure_closes_both_sides() {
        let mut h = spawn_bridge(vec![Arc::new(RaiseFromWsFilter)]).await;

        h.ws_peer.send(Message::Binary(b"boom".to_vec().into())).await.unwrap();

        match next_ws_message(&mut h.ws_peer).await {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), FILTER_FAILURE_CODE);
                assert!(frame.reason.as_str().contains("raise-from-ws"));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(read_tcp(&mut h.tcp_peer).await.is_empty(), "no data may reach TCP");

        let report = timeout(TEST_TIMEOUT, h.bridge).await.unwrap().unwrap();
        assert_eq!(report.failure, Some(FailureKind::Filter));
        assert_eq!(report.bytes_inbound, 0);
    }

    #[tokio::test]
    async fn outbound_filter_failure_closes_both_sides() {
        let mut h = spawn_bridge(vec![Arc::new(RaiseToWsFilter)]).await;

        h.tcp_peer.write_all(b"boom").await.unwrap();

        match next_ws_message(&mut h.ws_peer).await {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), FILTER_FAILURE_CODE),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(read_tcp(&mut h.tcp_peer).await.is_empty());

        let report = timeout(TEST_TIMEOUT, h.bridge).await.unwrap().unwrap();
        assert_eq!(report.close_code, FILTER_FAILURE_CODE);
    }

    #[tokio::test]
    async fn events_report_open_then_close() {
        let mut h = spawn_bridge(Vec::new()).await;

        h.tcp_peer.write_all(b"12345").await.unwrap();
        next_ws_message(&mut h.ws_peer).await;
        drop(h.tcp_peer);
        let report = timeout(TEST_TIMEOUT, h.bridge).await.unwrap().unwrap();

        let opened = h.events.recv().await.unwrap();
        assert_eq!(
            opened,
            BridgeEvent::Opened {
                id: report.id,
                role: BridgeRole::Server
            }
        );
        match h.events.recv().await.unwrap() {
            BridgeEvent::Closed(closed) => {
                assert_eq!(closed, report);
                assert_eq!(closed.bytes_outbound, 5);
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }
}
