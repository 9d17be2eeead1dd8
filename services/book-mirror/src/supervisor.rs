//! Connection Supervisor
//!
//! Owns the transport and runs the feed loop: connect, authenticate,
//! replay subscriptions, then read frames until the connection fails, goes
//! quiet for longer than the liveness timeout, or the token is cancelled.
//! Failed connections are retried with capped exponential backoff. The
//! transport is closed on every exit path.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MirrorConfig;
use crate::decoder::{decode, FeedMessage};
use crate::error::{MirrorError, Result};
use crate::protocol::{Request, Topic, AUTH_EXPIRY_MS, PING, PONG};
use crate::session::FeedSession;
use crate::transport::{Connector, Transport, TransportError};

/// Runtime subscription changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

/// Cloneable handle for adding and removing topics while running.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl SupervisorHandle {
    /// Returns false once the supervisor has stopped.
    pub fn subscribe(&self, topic: Topic) -> bool {
        self.tx.send(Control::Subscribe(topic)).is_ok()
    }

    pub fn unsubscribe(&self, topic: Topic) -> bool {
        self.tx.send(Control::Unsubscribe(topic)).is_ok()
    }
}

/// Why a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    PeerClosed,
    LivenessTimeout,
}

pub struct Supervisor<C: Connector> {
    connector: C,
    config: MirrorConfig,
    session: FeedSession,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl<C: Connector> Supervisor<C> {
    /// Registers every topic from `config` with the session.
    pub fn new(connector: C, config: MirrorConfig, mut session: FeedSession) -> Self {
        for topic in config.topics() {
            session.subscribe(topic, false);
        }
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            config,
            session,
            control_tx,
            control_rx,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn session(&self) -> &FeedSession {
        &self.session
    }

    /// Run until `cancel` fires or authentication fails on a private channel.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let url = self.config.ws_url.clone();
        let mut backoff = self.config.reconnect_interval;
        let mut connections: u64 = 0;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            info!(url = %url, "Connecting");
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                attempt = timeout(
                    self.config.connect_timeout,
                    self.connector.connect(&url),
                ) => attempt,
            };

            match attempt {
                Err(_) => {
                    let e = TransportError::ConnectTimeout(url.clone());
                    warn!(
                        error = %e,
                        timeout_ms = self.config.connect_timeout.as_millis() as u64,
                        "Connect failed"
                    );
                }
                Ok(Err(e)) => {
                    warn!(url = %url, error = %e, "Connect failed");
                }
                Ok(Ok(mut transport)) => {
                    if connections > 0 {
                        self.session.metrics().record_reconnect();
                    }
                    connections += 1;
                    info!(url = %url, connection = connections, "Connected");

                    let outcome = self.drive(&mut transport, &cancel).await;
                    transport.close().await;
                    if !matches!(outcome, Ok(Exit::Cancelled)) {
                        self.session.on_disconnected();
                    }

                    match outcome {
                        Ok(Exit::Cancelled) => break Ok(()),
                        Ok(exit) => {
                            warn!(reason = ?exit, "Connection ended");
                            backoff = self.config.reconnect_interval;
                        }
                        Err(MirrorError::Authentication(reason)) => {
                            error!(reason = %reason, "Authentication failed on private channel");
                            break Err(MirrorError::Authentication(reason));
                        }
                        Err(e) => {
                            warn!(error = %e, "Connection failed");
                            backoff = self.config.reconnect_interval;
                        }
                    }
                }
            }

            if !backoff_sleep(&cancel, backoff).await {
                break Ok(());
            }
            backoff = (backoff * 2).min(self.config.max_reconnect_interval);
        };

        self.session.close();
        info!("Supervisor stopped");
        result
    }

    /// One connection's lifetime.
    async fn drive(
        &mut self,
        transport: &mut C::Transport,
        cancel: &CancellationToken,
    ) -> Result<Exit> {
        // Topics added while disconnected join the replay.
        while let Ok(control) = self.control_rx.try_recv() {
            self.apply_control(control, false);
        }

        if let Some((key, secret)) = self.config.credentials() {
            let expires = Utc::now().timestamp_millis() + AUTH_EXPIRY_MS;
            match Request::auth(key, secret, expires) {
                Ok(request) => {
                    send_request(transport, &request).await?;
                    debug!(expires, "Auth request sent");
                }
                Err(e) if self.config.private => {
                    return Err(MirrorError::Authentication(format!(
                        "cannot sign auth request: {}",
                        e
                    )));
                }
                Err(e) => warn!(error = %e, "Cannot sign auth request, continuing on public data"),
            }
        }

        let replay = self.session.on_connected();
        info!(topics = replay.len(), "Replaying subscriptions");
        for request in &replay {
            send_request(transport, request).await?;
        }

        let ping_every = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(Exit::Cancelled),

                Some(control) = self.control_rx.recv() => {
                    if let Some(request) = self.apply_control(control, true) {
                        send_request(transport, &request).await?;
                    }
                }

                _ = ping.tick() => {
                    let silent = last_seen.elapsed();
                    if silent >= self.config.liveness_timeout {
                        warn!(
                            silent_ms = silent.as_millis() as u64,
                            "No traffic within liveness timeout"
                        );
                        return Ok(Exit::LivenessTimeout);
                    }
                    transport.send(PING.to_string()).await?;
                }

                frame = transport.recv() => match frame? {
                    Some(text) => {
                        last_seen = Instant::now();
                        for request in self.on_frame(&text)? {
                            send_request(transport, &request).await?;
                        }
                    }
                    None => return Ok(Exit::PeerClosed),
                },
            }
        }
    }

    fn apply_control(&mut self, control: Control, connected: bool) -> Option<Request> {
        match control {
            Control::Subscribe(topic) => self.session.subscribe(topic, connected),
            Control::Unsubscribe(topic) => self.session.unsubscribe(&topic, connected),
        }
    }

    /// Route one frame. Liveness replies never reach the decoder.
    fn on_frame(&mut self, text: &str) -> Result<Vec<Request>> {
        if text.trim() == PONG {
            return Ok(Vec::new());
        }

        match decode(text) {
            Err(e) => {
                self.session.metrics().record_decode_error();
                warn!(error = %e, "Discarding undecodable frame");
                Ok(Vec::new())
            }
            Ok(FeedMessage::Ack(ack)) if ack.op == "auth" => {
                if ack.success {
                    info!("Authenticated");
                } else if self.config.private {
                    return Err(MirrorError::Authentication(ack.ret_msg));
                } else {
                    warn!(reason = %ack.ret_msg, "Authentication rejected, continuing on public data");
                }
                Ok(Vec::new())
            }
            Ok(FeedMessage::Ack(ack))
                if ack.op == "subscribe" && !ack.success && self.session.awaiting_subscription() =>
            {
                // The replay on the next connection asks again after backoff.
                Err(MirrorError::SubscriptionRejected(ack.ret_msg))
            }
            Ok(message) => Ok(self.session.handle(message)),
        }
    }
}

async fn send_request<T: Transport>(transport: &mut T, request: &Request) -> Result<()> {
    let text = request.to_json()?;
    transport.send(text).await?;
    debug!(op = ?request.op, args = ?request.args, "Request sent");
    Ok(())
}

/// Sleep for `delay` unless cancelled first. Returns false when cancelled.
async fn backoff_sleep(cancel: &CancellationToken, delay: Duration) -> bool {
    info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
