//! WebSocket driver for the tunnel session.
//!
//! Feeds transport events and a short poll tick into [`TunnelSession`] and carries out
//! the actions it returns. Relayed requests run concurrently on the blocking pool; their
//! responses come back through a channel and are framed only if the connection they
//! arrived on is still the current one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use nanda_core::tunnel::DiscardReason;
use nanda_core::{
    ExecutorResponse, RelayRequest, TunnelAction, TunnelConfig, TunnelEvent, TunnelSession,
    TunnelTarget,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::dispatch::{execute_bounded, SharedExecutor};
use crate::registration::RegistrationClient;
use crate::registry::EndpointCell;
use crate::status::StatusHandle;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const POLL_TICK: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum Step {
    Tick,
    Transport(TunnelEvent),
    Executed(RelayRequest, ExecutorResponse),
}

pub struct TunnelDriver {
    session: TunnelSession,
    executor: SharedExecutor,
    executor_timeout: Duration,
    endpoint: EndpointCell,
    registration: Arc<RegistrationClient>,
    status: StatusHandle,
    ws: Option<WsStream>,
}

impl TunnelDriver {
    pub fn new(
        handle: &str,
        config: TunnelConfig,
        executor: SharedExecutor,
        executor_timeout: Duration,
        endpoint: EndpointCell,
        registration: Arc<RegistrationClient>,
        status: StatusHandle,
    ) -> Self {
        Self {
            session: TunnelSession::new(handle, config),
            executor,
            executor_timeout,
            endpoint,
            registration,
            status,
            ws: None,
        }
    }

    /// Runs until the task is aborted.
    pub async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(RelayRequest, ExecutorResponse)>();
        let mut tick = tokio::time::interval(POLL_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let step = tokio::select! {
                _ = tick.tick() => Step::Tick,
                event = next_event(&mut self.ws) => Step::Transport(event),
                Some((req, resp)) = done_rx.recv() => Step::Executed(req, resp),
            };
            let actions = match step {
                Step::Tick => self.on_tick().await,
                Step::Transport(event) => {
                    if event == TunnelEvent::Closed {
                        self.ws = None;
                        info!("tunnel closed by peer");
                    }
                    self.session.handle_event(event, Instant::now())
                }
                Step::Executed(req, resp) => self.frame_response(&req, &resp),
            };
            self.apply(actions, &done_tx).await;
            let state = self.session.state();
            self.status.update(|s| s.tunnel = state);
        }
    }

    async fn on_tick(&mut self) -> Vec<TunnelAction> {
        let now = Instant::now();
        let endpoint = self.endpoint.get().await;
        let mut actions = self
            .session
            .set_endpoint(endpoint.as_ref().map(|e| e.base_url()), now);
        actions.extend(self.session.set_registered(self.registration.is_registered(), now));
        actions.extend(self.session.poll(now));
        actions
    }

    fn frame_response(&self, req: &RelayRequest, resp: &ExecutorResponse) -> Vec<TunnelAction> {
        match self.session.respond(req, resp) {
            Some(frame) => vec![TunnelAction::Send(frame)],
            None => {
                debug!(id = %req.id, "connection gone; dropping response");
                vec![]
            }
        }
    }

    async fn apply(
        &mut self,
        actions: Vec<TunnelAction>,
        done_tx: &mpsc::UnboundedSender<(RelayRequest, ExecutorResponse)>,
    ) {
        let mut queue: VecDeque<TunnelAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                TunnelAction::Connect(target) => {
                    let event = self.connect(&target).await;
                    queue.extend(self.session.handle_event(event, Instant::now()));
                }
                TunnelAction::Send(frame) => {
                    let Some(ws) = self.ws.as_mut() else { continue };
                    if let Err(e) = ws.send(Message::Text(frame)).await {
                        warn!(error = %e, "tunnel send failed");
                        self.ws = None;
                        queue.extend(self.session.handle_event(TunnelEvent::Closed, Instant::now()));
                    }
                }
                TunnelAction::Dispatch(req) => {
                    debug!(id = %req.id, method = %req.method, path = %req.path, "relayed request");
                    let executor = self.executor.clone();
                    let timeout = self.executor_timeout;
                    let tx = done_tx.clone();
                    tokio::spawn(async move {
                        let resp = execute_bounded(
                            executor,
                            req.method.clone(),
                            req.path.clone(),
                            req.body.clone(),
                            timeout,
                        )
                        .await;
                        let _ = tx.send((req, resp));
                    });
                }
                TunnelAction::Close => {
                    if let Some(mut ws) = self.ws.take() {
                        let _ = ws.close(None).await;
                        info!("tunnel closed");
                    }
                }
                TunnelAction::Confirmed { handle } => {
                    info!(handle = handle.as_deref().unwrap_or("-"), "tunnel confirmed");
                }
                TunnelAction::Discarded(DiscardReason::Malformed(e)) => {
                    warn!(error = %e, "malformed tunnel frame dropped");
                }
                TunnelAction::Discarded(reason) => {
                    debug!(?reason, "tunnel frame dropped");
                }
            }
        }
    }

    async fn connect(&mut self, target: &TunnelTarget) -> TunnelEvent {
        let url = target.url();
        debug!(%url, "tunnel connecting");
        match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => {
                info!(%url, "tunnel connected");
                self.ws = Some(ws);
                TunnelEvent::Opened
            }
            Ok(Err(e)) => {
                warn!(%url, error = %e, "tunnel connect failed");
                TunnelEvent::Closed
            }
            Err(_) => {
                warn!(%url, "tunnel connect timed out");
                TunnelEvent::Closed
            }
        }
    }
}

/// Next transport event; pending forever while there is no connection.
async fn next_event(ws: &mut Option<WsStream>) -> TunnelEvent {
    let Some(stream) = ws.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return TunnelEvent::Text(text),
            Some(Ok(Message::Binary(bytes))) => {
                return TunnelEvent::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(Ok(Message::Close(_))) | None => return TunnelEvent::Closed,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "tunnel read error");
                return TunnelEvent::Closed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryClient, RegistryEndpoint};
    use nanda_core::{LocalRequestExecutor, TunnelState};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HANDLE: &str = "m5stick-a1b2c3";

    struct Battery;

    impl LocalRequestExecutor for Battery {
        fn execute(&self, _method: &str, path: &str, _body: &str) -> ExecutorResponse {
            if path == "/api/battery" {
                ExecutorResponse::ok(r#"{"voltage":4.1,"percent":90,"isCharging":false}"#)
            } else {
                ExecutorResponse::error(404, "Not found", path)
            }
        }
    }

    fn fast() -> TunnelConfig {
        TunnelConfig {
            reconnect_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(3),
            max_missed_acks: 2,
        }
    }

    /// Registered client whose endpoint then points at the tunnel server.
    async fn registered(registry: &MockServer, tunnel_base: &str) -> (Arc<RegistrationClient>, EndpointCell) {
        Mock::given(method("POST"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(201))
            .mount(registry)
            .await;
        let cell = EndpointCell::default();
        cell.set(RegistryEndpoint::new(&registry.uri())).await;
        let reg = Arc::new(RegistrationClient::new(
            HANDLE,
            "http://10.0.0.2",
            RegistryClient::new(Duration::from_secs(2)).unwrap(),
            cell.clone(),
            3,
        ));
        assert!(reg.register().await);
        cell.set(RegistryEndpoint::new(tunnel_base)).await;
        (reg, cell)
    }

    fn text(msg: Message) -> Option<serde_json::Value> {
        match msg {
            Message::Text(t) => serde_json::from_str(&t).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn relays_request_and_echoes_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = MockServer::start().await;
        let (reg, cell) = registered(&registry, &format!("http://{}", addr)).await;
        let status = StatusHandle::new();

        let driver = TunnelDriver::new(
            HANDLE,
            fast(),
            Arc::new(Battery),
            Duration::from_secs(1),
            cell,
            reg,
            status.clone(),
        );
        let task = tokio::spawn(driver.run());

        let (stream, _) = listener.accept().await.unwrap();
        let mut seen_uri = String::new();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            seen_uri = req.uri().to_string();
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .unwrap();
        assert_eq!(seen_uri, format!("/tunnel?handle={}", HANDLE));

        ws.send(Message::Text(format!(r#"{{"type":"connected","handle":"{}"}}"#, HANDLE)))
            .await
            .unwrap();
        ws.send(Message::Text("not json".into())).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"request","id":"r1","method":"GET","path":"/api/battery","body":""}"#.into(),
        ))
        .await
        .unwrap();

        let mut responses = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while responses.is_empty() {
            let msg = tokio::time::timeout_at(deadline, ws.next())
                .await
                .expect("response within deadline")
                .unwrap()
                .unwrap();
            if let Some(v) = text(msg) {
                if v["type"] == "response" {
                    responses.push(v);
                }
            }
        }
        let r = &responses[0];
        assert_eq!(r["id"], "r1");
        assert_eq!(r["status"], 200);
        assert_eq!(r["headers"]["Content-Type"], "application/json");
        assert_eq!(
            r["body"],
            Battery.execute("GET", "/api/battery", "").body.as_str()
        );
        assert_eq!(status.current().tunnel, TunnelState::Connected);
        task.abort();
    }

    #[tokio::test]
    async fn reconnects_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = MockServer::start().await;
        let (reg, cell) = registered(&registry, &format!("http://{}", addr)).await;

        let driver = TunnelDriver::new(
            HANDLE,
            fast(),
            Arc::new(Battery),
            Duration::from_secs(1),
            cell,
            reg,
            StatusHandle::new(),
        );
        let task = tokio::spawn(driver.run());

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let closed_at = Instant::now();
        ws.close(None).await.unwrap();
        drop(ws);

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("reconnect")
            .unwrap();
        assert!(closed_at.elapsed() >= Duration::from_millis(150));
        drop(stream);
        task.abort();
    }

    #[tokio::test]
    async fn stays_down_while_unregistered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cell = EndpointCell::default();
        cell.set(RegistryEndpoint::new(&format!("http://{}", addr))).await;
        let reg = Arc::new(RegistrationClient::new(
            HANDLE,
            "http://10.0.0.2",
            RegistryClient::new(Duration::from_secs(1)).unwrap(),
            cell.clone(),
            3,
        ));
        let driver = TunnelDriver::new(
            HANDLE,
            fast(),
            Arc::new(Battery),
            Duration::from_secs(1),
            cell,
            reg,
            StatusHandle::new(),
        );
        let task = tokio::spawn(driver.run());
        let accepted = tokio::time::timeout(Duration::from_millis(800), listener.accept()).await;
        assert!(accepted.is_err());
        task.abort();
    }
}
