//! Single shared push-channel connection with debounced connect, linear
//! reconnect backoff and fan-out to subscribers.

use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    codec::{decode_push_bytes, decode_push_frame},
    error::SyncError,
    retry::RetryPolicy,
    types::{PushEvent, SyncConfig},
};

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// One frame read from a push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: u16 },
}

/// Errors raised by push transports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("push channel connect failed: {0}")]
    Connect(String),
    #[error("push channel transport error: {0}")]
    Transport(String),
}

impl From<ChannelError> for SyncError {
    fn from(err: ChannelError) -> Self {
        match &err {
            ChannelError::Connect(_) => SyncError::channel("channel_connect_failed", err.to_string()),
            ChannelError::Transport(_) => SyncError::channel("channel_closed", err.to_string()),
        }
    }
}

/// Live push connection.
#[async_trait]
pub trait PushConnection: Send {
    /// Next frame; `None` means the stream ended without a close frame.
    async fn next_frame(&mut self) -> Option<Result<ChannelFrame, ChannelError>>;

    /// Close the connection with `code`.
    async fn close(&mut self, code: u16) -> Result<(), ChannelError>;
}

/// Opens push connections.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PushConnection>, ChannelError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    GaveUp,
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelStatus {
    pub phase: ChannelPhase,
    /// Reconnect attempts since the last successful open.
    pub attempt: u32,
    /// Delay before the next reconnect attempt.
    pub retry_in_ms: Option<u64>,
}

impl ChannelStatus {
    fn new(phase: ChannelPhase, attempt: u32) -> Self {
        Self {
            phase,
            attempt,
            retry_in_ms: None,
        }
    }
}

type Handler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

struct Shared {
    registry: Mutex<Registry>,
    status_tx: watch::Sender<ChannelStatus>,
}

impl Shared {
    fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_replace(status);
    }

    fn phase(&self) -> ChannelPhase {
        self.status_tx.borrow().phase
    }

    fn remove(&self, id: u64) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .retain(|(handler_id, _)| *handler_id != id);
    }

    /// Deliver to a snapshot of the handlers, without holding the lock, so
    /// handlers may subscribe or unsubscribe.
    fn dispatch(&self, event: &PushEvent) {
        let handlers: Vec<Handler> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        trace!(kind = event.kind(), subscribers = handlers.len(), "dispatching push event");
        for handler in handlers {
            handler(event);
        }
    }

    fn dispatch_decoded(&self, decoded: Result<Option<PushEvent>, SyncError>) {
        match decoded {
            Ok(Some(event)) => self.dispatch(&event),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "skipping undecodable push frame"),
        }
    }
}

/// Removes its handler when dropped or unsubscribed.
#[must_use = "dropping a Subscription removes its handler"]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
            trace!(id = self.id, "push subscriber removed");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct RunningChannelTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

enum PumpEnd {
    Stopped,
    Closed(Option<u16>),
}

/// Owns the one push connection shared by every conversation.
pub struct ChannelManager {
    transport: Arc<dyn PushTransport>,
    policy: RetryPolicy,
    debounce: Duration,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<RunningChannelTask>>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn PushTransport>, policy: RetryPolicy, debounce: Duration) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::new(ChannelPhase::Idle, 0));
        Self {
            transport,
            policy,
            debounce,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                status_tx,
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn from_config(transport: Arc<dyn PushTransport>, config: &SyncConfig) -> Self {
        Self::new(
            transport,
            RetryPolicy::new(
                config.reconnect_base_delay_ms,
                config.reconnect_max_delay_ms,
                config.reconnect_max_attempts,
            ),
            config.connect_debounce(),
        )
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ChannelStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }

    /// Register `handler` for every decoded event, in arrival order.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let mut registry = self
            .shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id = registry.next_id.wrapping_add(1);
        registry.handlers.push((id, Arc::new(handler)));
        trace!(id, "push subscriber added");
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Open the connection unless one is open or pending.
    ///
    /// The open happens after the debounce window. A finished connection
    /// task (gave up, or closed normally by the server) is awaited before a
    /// new one starts.
    pub async fn connect(&self) {
        let mut running = self.running.lock().await;
        if let Some(task) = running.as_ref()
            && !task.task.is_finished()
            && matches!(
                self.shared.phase(),
                ChannelPhase::Connecting | ChannelPhase::Open | ChannelPhase::Reconnecting
            )
        {
            debug!(phase = ?self.shared.phase(), "push channel already active; connect is a no-op");
            return;
        }

        if let Some(stale) = running.take() {
            debug!("closing stale push channel task before reconnecting");
            stale.stop.cancel();
            if let Err(err) = stale.task.await {
                warn!(error = %err, "stale push channel task failed");
            }
        }

        self.shared
            .set_status(ChannelStatus::new(ChannelPhase::Connecting, 0));
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_channel(
            Arc::clone(&self.transport),
            Arc::clone(&self.shared),
            self.policy,
            self.debounce,
            stop.child_token(),
        ));
        *running = Some(RunningChannelTask { stop, task });
    }

    /// Close with a normal-closure code and stop reconnecting.
    pub async fn disconnect(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return;
        };
        running.stop.cancel();
        if let Err(err) = running.task.await {
            warn!(error = %err, "push channel task failed");
        }
        self.shared.set_status(ChannelStatus::new(ChannelPhase::Idle, 0));
        info!("push channel disconnected");
    }
}

async fn run_channel(
    transport: Arc<dyn PushTransport>,
    shared: Arc<Shared>,
    policy: RetryPolicy,
    debounce: Duration,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = stop.cancelled() => return,
        _ = tokio::time::sleep(debounce) => {}
    }

    let mut attempt: u32 = 0;
    loop {
        let phase = if attempt == 0 {
            ChannelPhase::Connecting
        } else {
            ChannelPhase::Reconnecting
        };
        shared.set_status(ChannelStatus::new(phase, attempt));

        let opened = tokio::select! {
            _ = stop.cancelled() => return,
            opened = transport.open() => opened,
        };

        let close_code = match opened {
            Ok(mut connection) => {
                attempt = 0;
                shared.set_status(ChannelStatus::new(ChannelPhase::Open, 0));
                info!("push channel open");
                match pump(connection.as_mut(), &shared, &stop).await {
                    PumpEnd::Stopped => {
                        if let Err(err) = connection.close(NORMAL_CLOSURE).await {
                            debug!(error = %err, "push channel close handshake failed");
                        }
                        return;
                    }
                    PumpEnd::Closed(code) => code,
                }
            }
            Err(err) => {
                warn!(attempt, error = %err, "push channel open failed");
                None
            }
        };

        if close_code == Some(NORMAL_CLOSURE) {
            info!("push channel closed normally by server");
            shared.set_status(ChannelStatus::new(ChannelPhase::Idle, 0));
            return;
        }

        let Some(delay) = policy.delay_for_attempt(attempt) else {
            warn!(attempt, "push channel reconnect attempts exhausted");
            shared.set_status(ChannelStatus::new(ChannelPhase::GaveUp, attempt));
            return;
        };
        attempt = attempt.saturating_add(1);
        let delay_ms = delay.as_millis() as u64;
        warn!(?close_code, attempt, delay_ms, "push channel closed abnormally; reconnecting");
        shared.set_status(ChannelStatus {
            phase: ChannelPhase::Reconnecting,
            attempt,
            retry_in_ms: Some(delay_ms),
        });

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(connection: &mut dyn PushConnection, shared: &Shared, stop: &CancellationToken) -> PumpEnd {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return PumpEnd::Stopped,
            frame = connection.next_frame() => frame,
        };
        match frame {
            Some(Ok(ChannelFrame::Text(text))) => shared.dispatch_decoded(decode_push_frame(&text)),
            Some(Ok(ChannelFrame::Binary(bytes))) => shared.dispatch_decoded(decode_push_bytes(&bytes)),
            Some(Ok(ChannelFrame::Closed { code })) => return PumpEnd::Closed(Some(code)),
            Some(Err(err)) => {
                warn!(error = %err, "push channel read failed");
                return PumpEnd::Closed(None);
            }
            None => return PumpEnd::Closed(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use tokio::{
        sync::mpsc,
        time::{Instant, timeout},
    };

    use super::*;

    pub(crate) struct FakeConnection {
        frames: mpsc::UnboundedReceiver<ChannelFrame>,
        closed_with: Arc<Mutex<Vec<u16>>>,
    }

    #[async_trait]
    impl PushConnection for FakeConnection {
        async fn next_frame(&mut self) -> Option<Result<ChannelFrame, ChannelError>> {
            self.frames.recv().await.map(Ok)
        }

        async fn close(&mut self, code: u16) -> Result<(), ChannelError> {
            self.closed_with.lock().expect("close log").push(code);
            Ok(())
        }
    }

    /// Hands out queued connections; fails to open once the queue is empty.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub opens: AtomicUsize,
        pub closed_with: Arc<Mutex<Vec<u16>>>,
        connections: Mutex<VecDeque<mpsc::UnboundedReceiver<ChannelFrame>>>,
    }

    impl FakeTransport {
        pub(crate) fn push_connection(&self) -> mpsc::UnboundedSender<ChannelFrame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.connections.lock().expect("connections").push_back(rx);
            tx
        }

        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushTransport for FakeTransport {
        async fn open(&self) -> Result<Box<dyn PushConnection>, ChannelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let frames = self
                .connections
                .lock()
                .expect("connections")
                .pop_front()
                .ok_or_else(|| ChannelError::Connect("connection refused".into()))?;
            Ok(Box::new(FakeConnection {
                frames,
                closed_with: Arc::clone(&self.closed_with),
            }))
        }
    }

    pub(crate) fn new_message_frame(id: &str, text: &str) -> ChannelFrame {
        ChannelFrame::Text(format!(
            r#"{{"type":"new_message","message":{{"id":"{id}","phone_number":"5215550001","text":"{text}","sender":"user","timestamp":"2024-05-01T10:00:00"}}}}"#
        ))
    }

    fn manager(transport: &Arc<FakeTransport>, max_attempts: u32) -> ChannelManager {
        ChannelManager::new(
            Arc::clone(transport) as Arc<dyn PushTransport>,
            RetryPolicy::new(1_000, 30_000, max_attempts),
            Duration::from_millis(150),
        )
    }

    async fn wait_for_phase(status: &mut watch::Receiver<ChannelStatus>, phase: ChannelPhase) -> ChannelStatus {
        *timeout(Duration::from_secs(120), status.wait_for(|s| s.phase == phase))
            .await
            .expect("phase should be reached in time")
            .expect("status sender should be alive")
    }

    fn collect_ids(manager: &ChannelManager) -> (Subscription, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = manager.subscribe(move |event| {
            if let PushEvent::NewMessage(message) = event {
                let _ = tx.send(message.id.clone());
            }
        });
        (subscription, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_opens_one_connection() {
        let transport = Arc::new(FakeTransport::default());
        let frames = transport.push_connection();
        let manager = manager(&transport, 5);
        let (_subscription, mut received) = collect_ids(&manager);

        manager.connect().await;
        manager.connect().await;
        frames.send(new_message_frame("wamid.1", "hola")).expect("frame send");

        let id = timeout(Duration::from_secs(1), received.recv())
            .await
            .expect("event should arrive")
            .expect("subscriber channel open");
        assert_eq!(id, "wamid.1");
        assert_eq!(transport.opens(), 1);
        assert!(received.try_recv().is_err(), "no duplicate delivery");
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_events_in_arrival_order_and_skips_garbage() {
        let transport = Arc::new(FakeTransport::default());
        let frames = transport.push_connection();
        let manager = manager(&transport, 5);
        let (_subscription, mut received) = collect_ids(&manager);
        manager.connect().await;

        frames.send(new_message_frame("a", "1")).expect("frame send");
        frames
            .send(ChannelFrame::Text("Mensaje recibido: ping".into()))
            .expect("frame send");
        frames
            .send(ChannelFrame::Text(r#"{"type":"typing"}"#.into()))
            .expect("frame send");
        frames.send(new_message_frame("b", "2")).expect("frame send");
        frames.send(new_message_frame("c", "3")).expect("frame send");

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                timeout(Duration::from_secs(1), received.recv())
                    .await
                    .expect("event should arrive")
                    .expect("subscriber channel open"),
            );
        }
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(manager.current_status().phase, ChannelPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_removes_exactly_one_handler() {
        let transport = Arc::new(FakeTransport::default());
        let frames = transport.push_connection();
        let manager = manager(&transport, 5);
        let (first, mut first_rx) = collect_ids(&manager);
        let (_second, mut second_rx) = collect_ids(&manager);
        assert_eq!(manager.subscriber_count(), 2);

        first.unsubscribe();
        assert_eq!(manager.subscriber_count(), 1);

        manager.connect().await;
        frames.send(new_message_frame("x", "hi")).expect("frame send");
        let id = timeout(Duration::from_secs(1), second_rx.recv())
            .await
            .expect("event should arrive")
            .expect("subscriber channel open");
        assert_eq!(id, "x");
        assert!(first_rx.recv().await.is_none(), "removed handler is dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_after_backoff() {
        let transport = Arc::new(FakeTransport::default());
        let first = transport.push_connection();
        let second = transport.push_connection();
        let manager = manager(&transport, 5);
        let (_subscription, mut received) = collect_ids(&manager);
        let mut status = manager.status();

        manager.connect().await;
        wait_for_phase(&mut status, ChannelPhase::Open).await;

        first.send(ChannelFrame::Closed { code: 1006 }).expect("frame send");
        let reconnecting = wait_for_phase(&mut status, ChannelPhase::Reconnecting).await;
        assert_eq!(reconnecting.attempt, 1);
        assert_eq!(reconnecting.retry_in_ms, Some(1_000));

        let started = Instant::now();
        wait_for_phase(&mut status, ChannelPhase::Open).await;
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(transport.opens(), 2);

        second.send(new_message_frame("after", "ok")).expect("frame send");
        let id = timeout(Duration::from_secs(1), received.recv())
            .await
            .expect("event should arrive")
            .expect("subscriber channel open");
        assert_eq!(id, "after");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_ceiling_until_connect() {
        let transport = Arc::new(FakeTransport::default());
        let manager = manager(&transport, 3);
        let mut status = manager.status();

        manager.connect().await;
        let gave_up = wait_for_phase(&mut status, ChannelPhase::GaveUp).await;
        assert_eq!(gave_up.attempt, 3);
        assert_eq!(transport.opens(), 4);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(transport.opens(), 4, "no retries after giving up");

        let _frames = transport.push_connection();
        manager.connect().await;
        wait_for_phase(&mut status, ChannelPhase::Open).await;
        assert_eq!(transport.opens(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_normally_and_suppresses_reconnect() {
        let transport = Arc::new(FakeTransport::default());
        let _frames = transport.push_connection();
        let manager = manager(&transport, 5);
        let mut status = manager.status();

        manager.connect().await;
        wait_for_phase(&mut status, ChannelPhase::Open).await;
        manager.disconnect().await;

        assert_eq!(
            *transport.closed_with.lock().expect("close log"),
            vec![NORMAL_CLOSURE]
        );
        assert_eq!(manager.current_status().phase, ChannelPhase::Idle);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_server_close_does_not_reconnect() {
        let transport = Arc::new(FakeTransport::default());
        let frames = transport.push_connection();
        let manager = manager(&transport, 5);
        let mut status = manager.status();

        manager.connect().await;
        wait_for_phase(&mut status, ChannelPhase::Open).await;
        frames
            .send(ChannelFrame::Closed {
                code: NORMAL_CLOSURE,
            })
            .expect("frame send");
        wait_for_phase(&mut status, ChannelPhase::Idle).await;

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(transport.opens(), 1);
    }

    struct PanickingTransport;

    #[async_trait]
    impl PushTransport for PanickingTransport {
        async fn open(&self) -> Result<Box<dyn PushConnection>, ChannelError> {
            panic!("transport blew up");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_survives_a_panicked_channel_task() {
        let manager = ChannelManager::new(
            Arc::new(PanickingTransport) as Arc<dyn PushTransport>,
            RetryPolicy::new(1_000, 30_000, 5),
            Duration::from_millis(150),
        );

        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.current_status().phase, ChannelPhase::Connecting);

        timeout(Duration::from_secs(5), manager.disconnect())
            .await
            .expect("disconnect should finish");
        assert_eq!(manager.current_status().phase, ChannelPhase::Idle);
    }

    #[test]
    fn channel_errors_map_to_channel_category() {
        let err: SyncError = ChannelError::Transport("reset".into()).into();
        assert_eq!(err.code, "channel_closed");
        assert!(err.is_recoverable());
    }
}
