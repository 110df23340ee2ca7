use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use longshore_wire::{ControlFrame, FrameCodec, Hello, OperatorFrame};

use crate::appstate::MonitorCommand;
use crate::deploy::WorkOrder;

use super::ChannelError;

/// Redial delay after a failed or dropped session.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long to wait for the welcome before abandoning the attempt.
const WELCOME_GRACE: Duration = Duration::from_secs(2);

/// Heartbeat interval when the welcome does not name one.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

pub struct ChannelClient {
    addr: String,
    token: String,
    orders: mpsc::Sender<WorkOrder>,
    monitor: mpsc::Sender<MonitorCommand>,
    cancel: CancellationToken,
}

impl ChannelClient {
    pub fn new(
        addr: String,
        token: String,
        orders: mpsc::Sender<WorkOrder>,
        monitor: mpsc::Sender<MonitorCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            token,
            orders,
            monitor,
            cancel,
        }
    }

    /// Dial, pump and redial until cancelled.
    pub async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.session().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "channel session ended");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn session(&self) -> Result<(), ChannelError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|source| {
            ChannelError::Connect {
                addr: self.addr.clone(),
                source,
            }
        })?;
        let mut framed = Framed::new(
            stream,
            FrameCodec::<ControlFrame, OperatorFrame>::new(),
        );
        framed
            .send(OperatorFrame::Hello(Hello {
                token: self.token.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }))
            .await?;
        info!(addr = %self.addr, "connected to control plane channel");

        // the handshake requires a welcome; an attempt without one is
        // abandoned and redialed
        let welcome = match timeout(WELCOME_GRACE, framed.next()).await {
            Ok(Some(Ok(ControlFrame::Welcome(welcome)))) => welcome,
            Ok(Some(Ok(frame))) => {
                warn!(?frame, "expected welcome as the first frame");
                return Err(ChannelError::NoWelcome);
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Err(ChannelError::Closed),
            Err(_) => return Err(ChannelError::NoWelcome),
        };
        let ping_interval = welcome
            .ping_interval_secs
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(DEFAULT_PING_INTERVAL);
        debug!(interval = ?ping_interval, "control plane welcomed the connection");

        let mut heartbeat =
            interval_at(Instant::now() + ping_interval, ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = heartbeat.tick() => {
                    framed.send(OperatorFrame::Ping).await?;
                }
                frame = framed.next() => match frame {
                    Some(Ok(ControlFrame::Welcome(welcome))) => {
                        if let Some(secs) = welcome.ping_interval_secs {
                            let interval = Duration::from_secs(secs.max(1));
                            heartbeat = interval_at(
                                Instant::now() + interval,
                                interval,
                            );
                            heartbeat.set_missed_tick_behavior(
                                MissedTickBehavior::Delay,
                            );
                        }
                    }
                    Some(Ok(frame)) => self.dispatch(frame).await,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ChannelError::Closed),
                },
            }
        }
    }

    /// Route one inbound command. Deploy-class commands block on the work
    /// queue so a busy worker backpressures the channel; informer updates
    /// are dropped with a warning instead, the control plane resends them
    /// with the next deploy.
    async fn dispatch(&self, frame: ControlFrame) {
        match frame {
            ControlFrame::Welcome(_) | ControlFrame::Pong => {}
            ControlFrame::Deploy(manifests) => {
                info!(app_id = %manifests.app_id, "deploy command received");
                if self
                    .orders
                    .send(WorkOrder::Deploy(manifests))
                    .await
                    .is_err()
                {
                    warn!("deploy worker is gone, dropping command");
                }
            }
            ControlFrame::AppInformers(spec) => {
                let command = MonitorCommand::Apply {
                    app_id: spec.app_id,
                    informers: spec.informers,
                };
                if let Err(e) = self.monitor.try_send(command) {
                    warn!(error = %e, "dropping informer update");
                }
            }
            ControlFrame::Preflight(req) => {
                info!(app_id = %req.app_id, "preflight command received");
                if self
                    .orders
                    .send(WorkOrder::Preflight(req))
                    .await
                    .is_err()
                {
                    warn!("deploy worker is gone, dropping command");
                }
            }
            ControlFrame::SupportBundle(req) => {
                info!(app_id = %req.app_id, "support bundle command received");
                if self
                    .orders
                    .send(WorkOrder::SupportBundle(req))
                    .await
                    .is_err()
                {
                    warn!("deploy worker is gone, dropping command");
                }
            }
        }
    }
}
