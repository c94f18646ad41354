// src/venues/kestrel/ws.rs
//
// WebSocket session for the kestrel feed: connect + authenticate via URL
// query parameters, JSON subscription control, binary market data into the
// decode queue, and reconnect with capped exponential backoff. Subscriptions
// are tracked so a reconnect can replay them grouped by streaming mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::frame::coding::CloseCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::runtime::ShutdownFlag;
use crate::spsc::Producer;
use crate::venues::kestrel::wire::{self, KestrelTick};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_millis(500);
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamingMode {
    Ltp,
    Quote,
    Full,
}

impl StreamingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamingMode::Ltp => "ltp",
            StreamingMode::Quote => "quote",
            StreamingMode::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Subscription bookkeeping: which tokens are live and in which mode, so a
/// reconnect can replay them grouped by mode.
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    modes: HashMap<i32, StreamingMode>,
}

impl SubscriptionBook {
    pub fn subscribe(&mut self, tokens: &[i32], mode: StreamingMode) {
        for &token in tokens {
            self.modes.insert(token, mode);
        }
    }

    pub fn unsubscribe(&mut self, tokens: &[i32]) {
        for token in tokens {
            self.modes.remove(token);
        }
    }

    pub fn contains(&self, token: i32) -> bool {
        self.modes.contains_key(&token)
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Tokens grouped by mode, each group sorted for a deterministic replay
    /// order.
    pub fn grouped_by_mode(&self) -> Vec<(StreamingMode, Vec<i32>)> {
        let mut grouped: BTreeMap<StreamingMode, Vec<i32>> = BTreeMap::new();
        for (&token, &mode) in &self.modes {
            grouped.entry(mode).or_default().push(token);
        }
        grouped
            .into_iter()
            .map(|(mode, mut tokens)| {
                tokens.sort_unstable();
                (mode, tokens)
            })
            .collect()
    }
}

/// Control messages on the text channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    OrderPostback(serde_json::Value),
    VenueError(String),
    Notice(String),
}

/// Parse a text frame: `{"type":"order|error|message","data":…}`.
pub fn parse_control(text: &str) -> Option<ControlEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    match kind {
        "order" => Some(ControlEvent::OrderPostback(
            value.get("data").cloned().unwrap_or(serde_json::Value::Null),
        )),
        "error" => Some(ControlEvent::VenueError(data_string(&value))),
        "message" => Some(ControlEvent::Notice(data_string(&value))),
        _ => None,
    }
}

fn data_string(value: &serde_json::Value) -> String {
    match value.get("data") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

pub fn subscribe_message(tokens: &[i32]) -> String {
    json!({"a": "subscribe", "v": tokens}).to_string()
}

pub fn unsubscribe_message(tokens: &[i32]) -> String {
    json!({"a": "unsubscribe", "v": tokens}).to_string()
}

pub fn mode_message(mode: StreamingMode, tokens: &[i32]) -> String {
    json!({"a": "mode", "v": [mode.as_str(), tokens]}).to_string()
}

/// Guard ensuring at most one reconnect attempt is in flight.
#[derive(Debug, Default)]
pub struct ReconnectGuard(AtomicBool);

impl ReconnectGuard {
    /// Claim the reconnect slot; false when another attempt holds it.
    pub fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct KestrelWsConfig {
    pub host: String,
    pub api_key: String,
    pub access_token: String,
}

impl KestrelWsConfig {
    pub fn url(&self) -> String {
        format!(
            "wss://{}/?api_key={}&access_token={}",
            self.host, self.api_key, self.access_token
        )
    }
}

#[derive(Debug)]
enum WsCommand {
    Subscribe { tokens: Vec<i32>, mode: StreamingMode },
    Unsubscribe { tokens: Vec<i32> },
    SetMode { tokens: Vec<i32>, mode: StreamingMode },
}

/// Cloneable handle used by the adapter to manage subscriptions.
#[derive(Clone)]
pub struct KestrelWsHandle {
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subs: Arc<Mutex<SubscriptionBook>>,
    state: Arc<Mutex<SessionState>>,
}

impl KestrelWsHandle {
    /// Record the subscription and, when the session is open, send the
    /// control frames. Returns false when the session task is gone.
    pub fn subscribe(&self, tokens: Vec<i32>, mode: StreamingMode) -> bool {
        self.subs.lock().unwrap().subscribe(&tokens, mode);
        self.cmd_tx.send(WsCommand::Subscribe { tokens, mode }).is_ok()
    }

    pub fn unsubscribe(&self, tokens: Vec<i32>) -> bool {
        self.subs.lock().unwrap().unsubscribe(&tokens);
        self.cmd_tx.send(WsCommand::Unsubscribe { tokens }).is_ok()
    }

    pub fn set_mode(&self, tokens: Vec<i32>, mode: StreamingMode) -> bool {
        self.subs.lock().unwrap().subscribe(&tokens, mode);
        self.cmd_tx.send(WsCommand::SetMode { tokens, mode }).is_ok()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Open
    }
}

/// Owns the socket for the lifetime of the session task.
pub struct KestrelWsClient {
    cfg: KestrelWsConfig,
    shutdown: ShutdownFlag,
    subs: Arc<Mutex<SubscriptionBook>>,
    state: Arc<Mutex<SessionState>>,
    cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    tick_tx: Producer<KestrelTick>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    /// Signals the adapter that a (re)connect completed; payload is the
    /// attempt counter.
    connected_tx: mpsc::UnboundedSender<u64>,
    is_index: Arc<dyn Fn(i32) -> bool + Send + Sync>,
    reconnect_guard: Arc<ReconnectGuard>,
    dropped_ticks: u64,
}

pub struct KestrelWsParts {
    pub client: KestrelWsClient,
    pub handle: KestrelWsHandle,
    pub control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    pub connected_rx: mpsc::UnboundedReceiver<u64>,
}

impl KestrelWsClient {
    pub fn new(
        cfg: KestrelWsConfig,
        shutdown: ShutdownFlag,
        tick_tx: Producer<KestrelTick>,
        is_index: Arc<dyn Fn(i32) -> bool + Send + Sync>,
    ) -> KestrelWsParts {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let subs = Arc::new(Mutex::new(SubscriptionBook::default()));
        let state = Arc::new(Mutex::new(SessionState::Disconnected));
        let handle = KestrelWsHandle {
            cmd_tx,
            subs: Arc::clone(&subs),
            state: Arc::clone(&state),
        };
        let client = KestrelWsClient {
            cfg,
            shutdown,
            subs,
            state,
            cmd_rx,
            tick_tx,
            control_tx,
            connected_tx,
            is_index,
            reconnect_guard: Arc::new(ReconnectGuard::default()),
            dropped_ticks: 0,
        };
        KestrelWsParts {
            client,
            handle,
            control_rx,
            connected_rx,
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Session task: connect, pump, reconnect with backoff until shutdown.
    pub async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt: u64 = 0;

        while !self.shutdown.is_requested() {
            if !self.reconnect_guard.try_begin() {
                // Another attempt in flight; never expected with a single
                // session task, but the invariant is cheap to hold.
                tokio::time::sleep(INITIAL_BACKOFF).await;
                continue;
            }
            attempt += 1;
            self.set_state(SessionState::Connecting);
            let connect_result = connect_async(self.cfg.url()).await;
            self.reconnect_guard.end();

            let mut ws = match connect_result {
                Ok((ws, _resp)) => ws,
                Err(err) => {
                    self.set_state(SessionState::Disconnected);
                    warn!(host = %self.cfg.host, attempt, error = %err, "connect failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            info!(host = %self.cfg.host, attempt, "websocket open");
            self.set_state(SessionState::Open);
            backoff = INITIAL_BACKOFF;

            // Replay subscriptions grouped by mode before anything else.
            let replay = self.subs.lock().unwrap().grouped_by_mode();
            let mut replay_failed = false;
            for (mode, tokens) in replay {
                if !self.send_text(&mut ws, subscribe_message(&tokens)).await
                    || !self.send_text(&mut ws, mode_message(mode, &tokens)).await
                {
                    replay_failed = true;
                    break;
                }
            }
            if replay_failed {
                self.set_state(SessionState::Disconnected);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            let _ = self.connected_tx.send(attempt);

            if self.session_loop(&mut ws).await == SessionEnd::Shutdown {
                self.close(&mut ws, CloseCode::Normal).await;
                break;
            }
            self.set_state(SessionState::Disconnected);
            info!(host = %self.cfg.host, "websocket disconnected, scheduling reconnect");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        self.set_state(SessionState::Disconnected);
    }

    async fn session_loop<S>(&mut self, ws: &mut S) -> SessionEnd
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let mut shutdown_tick = tokio::time::interval(SHUTDOWN_POLL);
        shutdown_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_tick.tick() => {
                    if self.shutdown.is_requested() {
                        return SessionEnd::Shutdown;
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return SessionEnd::Shutdown;
                    };
                    self.handle_command(ws, cmd).await;
                }
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Binary(bytes))) => self.on_binary(&bytes),
                        Some(Ok(Message::Text(text))) => self.on_text(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(err) = ws.send(Message::Pong(payload)).await {
                                warn!(error = %err, "pong failed");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "close frame received");
                            return SessionEnd::Disconnected;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "read error");
                            return SessionEnd::Disconnected;
                        }
                        None => return SessionEnd::Disconnected,
                    }
                }
            }
        }
    }

    async fn handle_command<S>(&mut self, ws: &mut S, cmd: WsCommand)
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        match cmd {
            WsCommand::Subscribe { tokens, mode } => {
                self.send_text(ws, subscribe_message(&tokens)).await;
                self.send_text(ws, mode_message(mode, &tokens)).await;
            }
            WsCommand::Unsubscribe { tokens } => {
                self.send_text(ws, unsubscribe_message(&tokens)).await;
            }
            WsCommand::SetMode { tokens, mode } => {
                self.send_text(ws, mode_message(mode, &tokens)).await;
            }
        }
    }

    /// A single failed write is logged and surfaced as false; it does not
    /// tear down the session.
    async fn send_text<S>(&mut self, ws: &mut S, text: String) -> bool
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        debug!(msg = %text, "control send");
        match ws.send(Message::Text(text)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "control send failed");
                false
            }
        }
    }

    fn on_binary(&mut self, bytes: &[u8]) {
        let recv_ns = now_ns();
        let is_index = Arc::clone(&self.is_index);
        let tick_tx = &mut self.tick_tx;
        let dropped = &mut self.dropped_ticks;
        wire::parse_frame(bytes, |t| (is_index)(t), recv_ns, |tick| {
            if tick_tx.push(tick).is_err() {
                // Queue full: drop and let book resync machinery recover.
                *dropped += 1;
                warn!(token = tick.token, total_dropped = *dropped, "decode queue full, dropping tick");
            }
        });
    }

    fn on_text(&mut self, text: &str) {
        match parse_control(text) {
            Some(event) => {
                if let ControlEvent::VenueError(ref message) = event {
                    warn!(%message, "venue error");
                }
                let _ = self.control_tx.send(event);
            }
            None => debug!(msg = %text, "unhandled text frame"),
        }
    }

    async fn close<S>(&mut self, ws: &mut S, code: CloseCode)
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        self.set_state(SessionState::Closing);
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        if let Err(err) = ws.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "close send failed");
            return;
        }
        // Bounded grace period for the peer's close reply.
        let deadline = Instant::now() + CLOSE_GRACE;
        while Instant::now() < deadline {
            match tokio::time::timeout(CLOSE_GRACE, ws.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => break,
                Ok(Some(Err(_))) => break,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    Shutdown,
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_auth_query() {
        let cfg = KestrelWsConfig {
            host: "feed.kestrel.trade".to_string(),
            api_key: "key123".to_string(),
            access_token: "tok456".to_string(),
        };
        assert_eq!(
            cfg.url(),
            "wss://feed.kestrel.trade/?api_key=key123&access_token=tok456"
        );
    }

    #[test]
    fn control_messages_match_wire_shape() {
        assert_eq!(
            subscribe_message(&[408065, 738561]),
            r#"{"a":"subscribe","v":[408065,738561]}"#
        );
        assert_eq!(
            unsubscribe_message(&[408065]),
            r#"{"a":"unsubscribe","v":[408065]}"#
        );
        assert_eq!(
            mode_message(StreamingMode::Full, &[408065, 738561]),
            r#"{"a":"mode","v":["full",[408065,738561]]}"#
        );
    }

    #[test]
    fn subscription_book_groups_by_mode_for_replay() {
        let mut book = SubscriptionBook::default();
        book.subscribe(&[2, 1], StreamingMode::Full);
        book.subscribe(&[5], StreamingMode::Ltp);
        book.subscribe(&[3], StreamingMode::Full);
        let grouped = book.grouped_by_mode();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0], (StreamingMode::Ltp, vec![5]));
        assert_eq!(grouped[1], (StreamingMode::Full, vec![1, 2, 3]));

        book.unsubscribe(&[1, 5]);
        let grouped = book.grouped_by_mode();
        assert_eq!(grouped, vec![(StreamingMode::Full, vec![2, 3])]);
    }

    #[test]
    fn resubscribe_moves_token_between_modes() {
        let mut book = SubscriptionBook::default();
        book.subscribe(&[7], StreamingMode::Quote);
        book.subscribe(&[7], StreamingMode::Full);
        assert_eq!(
            book.grouped_by_mode(),
            vec![(StreamingMode::Full, vec![7])]
        );
    }

    #[test]
    fn control_frames_parse_by_type() {
        assert_eq!(
            parse_control(r#"{"type":"error","data":"TokenException: invalid"}"#),
            Some(ControlEvent::VenueError("TokenException: invalid".to_string()))
        );
        assert_eq!(
            parse_control(r#"{"type":"message","data":"market closed"}"#),
            Some(ControlEvent::Notice("market closed".to_string()))
        );
        match parse_control(r#"{"type":"order","data":{"order_id":"1"}}"#) {
            Some(ControlEvent::OrderPostback(v)) => {
                assert_eq!(v.get("order_id").unwrap().as_str(), Some("1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(parse_control("not json"), None);
        assert_eq!(parse_control(r#"{"type":"weird"}"#), None);
    }

    #[test]
    fn reconnect_guard_admits_one_attempt() {
        let guard = ReconnectGuard::default();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        guard.end();
        assert!(guard.try_begin());
    }
}
