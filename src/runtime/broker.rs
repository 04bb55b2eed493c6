//! Broker control loop.
//!
//! One task owns the [`LoadBalancer`] and multiplexes the client-facing
//! channel, the worker-facing channel, the admin channel, and the liveness
//! sweep timer. Nothing in the loop blocks: every send is on an unbounded
//! channel and every wait is a `select!` branch.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::core::{
    Action, BrokerError, BrokerStatus, ClientAddress, Envelope, ErrorReply, FailureKind,
    LoadBalancer, WorkerAddress,
};
use crate::infra::InMemoryEnvelopeQueue;

/// Channel on which a worker endpoint receives dispatches.
pub type DispatchSender = mpsc::UnboundedSender<Envelope>;

/// Frames arriving on the client-facing channel.
#[derive(Debug)]
pub enum FrontendFrame {
    /// A gateway announces where its replies go.
    Connect {
        /// Gateway address.
        client: ClientAddress,
        /// Reply channel.
        replies: mpsc::UnboundedSender<Envelope>,
    },
    /// A request to route.
    Request(Envelope),
    /// A gateway leaves.
    Disconnect {
        /// Gateway address.
        client: ClientAddress,
    },
}

/// Frames arriving on the worker-facing channel.
#[derive(Debug)]
pub enum BackendFrame {
    /// The ready sentinel: the worker wants work on `dispatch`.
    Ready {
        /// Worker address.
        worker: WorkerAddress,
        /// Where to send its requests.
        dispatch: DispatchSender,
    },
    /// A finished request; also means the worker is ready again.
    Reply {
        /// Worker address.
        worker: WorkerAddress,
        /// Reply frame with the original routing.
        envelope: Envelope,
    },
    /// Liveness ping.
    Heartbeat {
        /// Worker address.
        worker: WorkerAddress,
    },
    /// The worker stops serving.
    Disconnect {
        /// Worker address.
        worker: WorkerAddress,
    },
}

/// Administrative commands.
#[derive(Debug)]
pub enum AdminCommand {
    /// Report counts.
    Status(oneshot::Sender<BrokerStatus>),
    /// Remove ghost workers and report them.
    Cleanup(oneshot::Sender<Vec<WorkerAddress>>),
    /// Drain, then stop. Answered once the loop has exited.
    Shutdown(oneshot::Sender<()>),
}

/// Worker-side connection to the broker.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    backend: mpsc::UnboundedSender<BackendFrame>,
}

impl WorkerLink {
    /// Send the ready sentinel.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub fn ready(&self, worker: WorkerAddress, dispatch: DispatchSender) -> Result<(), BrokerError> {
        self.send(BackendFrame::Ready { worker, dispatch })
    }

    /// Send a reply.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub fn reply(&self, worker: WorkerAddress, envelope: Envelope) -> Result<(), BrokerError> {
        self.send(BackendFrame::Reply { worker, envelope })
    }

    /// Send a liveness ping.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub fn heartbeat(&self, worker: WorkerAddress) -> Result<(), BrokerError> {
        self.send(BackendFrame::Heartbeat { worker })
    }

    /// Announce that the worker stops serving.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub fn disconnect(&self, worker: WorkerAddress) -> Result<(), BrokerError> {
        self.send(BackendFrame::Disconnect { worker })
    }

    fn send(&self, frame: BackendFrame) -> Result<(), BrokerError> {
        self.backend.send(frame).map_err(|_| BrokerError::Closed)
    }
}

/// Gateway-side connection to the broker.
#[derive(Debug)]
pub struct ClientLink {
    address: ClientAddress,
    frontend: mpsc::UnboundedSender<FrontendFrame>,
    replies: mpsc::UnboundedReceiver<Envelope>,
}

impl ClientLink {
    /// This gateway's address.
    #[must_use]
    pub const fn address(&self) -> &ClientAddress {
        &self.address
    }

    /// Submit a request frame.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub fn submit(&self, correlation_id: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let envelope = Envelope::new(self.address.clone(), correlation_id, payload);
        self.frontend
            .send(FrontendFrame::Request(envelope))
            .map_err(|_| BrokerError::Closed)
    }

    /// Next reply, or `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.replies.recv().await
    }
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        let _ = self.frontend.send(FrontendFrame::Disconnect {
            client: self.address.clone(),
        });
    }
}

/// Cloneable handle to a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    frontend: mpsc::UnboundedSender<FrontendFrame>,
    backend: mpsc::UnboundedSender<BackendFrame>,
    admin: mpsc::UnboundedSender<AdminCommand>,
}

impl BrokerHandle {
    /// Register a new gateway with a random address.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub fn connect_client(&self) -> Result<ClientLink, BrokerError> {
        let address = ClientAddress::random();
        let (tx, rx) = mpsc::unbounded_channel();
        self.frontend
            .send(FrontendFrame::Connect {
                client: address.clone(),
                replies: tx,
            })
            .map_err(|_| BrokerError::Closed)?;
        Ok(ClientLink {
            address,
            frontend: self.frontend.clone(),
            replies: rx,
        })
    }

    /// Worker-facing connection.
    #[must_use]
    pub fn worker_link(&self) -> WorkerLink {
        WorkerLink {
            backend: self.backend.clone(),
        }
    }

    /// Current counts.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub async fn status(&self) -> Result<BrokerStatus, BrokerError> {
        self.ask(AdminCommand::Status).await
    }

    /// Remove ghost workers.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker has stopped.
    pub async fn cleanup(&self) -> Result<Vec<WorkerAddress>, BrokerError> {
        self.ask(AdminCommand::Cleanup).await
    }

    /// Drain and stop; resolves once the loop has exited.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` if the broker had already stopped.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.ask(AdminCommand::Shutdown).await
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> AdminCommand) -> Result<T, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.admin.send(command(tx)).map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)
    }
}

/// The broker task.
pub struct BrokerService {
    balancer: LoadBalancer<DispatchSender, InMemoryEnvelopeQueue>,
    clients: HashMap<ClientAddress, mpsc::UnboundedSender<Envelope>>,
    frontend: mpsc::UnboundedReceiver<FrontendFrame>,
    backend: mpsc::UnboundedReceiver<BackendFrame>,
    admin: mpsc::UnboundedReceiver<AdminCommand>,
    config: BrokerConfig,
}

impl BrokerService {
    /// Start a broker on the current tokio runtime.
    #[must_use]
    pub fn spawn(config: BrokerConfig) -> (BrokerHandle, JoinHandle<()>) {
        let (frontend_tx, frontend) = mpsc::unbounded_channel();
        let (backend_tx, backend) = mpsc::unbounded_channel();
        let (admin_tx, admin) = mpsc::unbounded_channel();
        let service = Self {
            balancer: LoadBalancer::new(
                InMemoryEnvelopeQueue::new(config.max_pending),
                config.limits(),
            ),
            clients: HashMap::new(),
            frontend,
            backend,
            admin,
            config,
        };
        let handle = BrokerHandle {
            frontend: frontend_tx,
            backend: backend_tx,
            admin: admin_tx,
        };
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drain_deadline: Option<tokio::time::Instant> = None;
        let mut shutdown_waiters: Vec<oneshot::Sender<()>> = Vec::new();
        info!(max_pending = self.config.max_pending, "broker started");

        loop {
            if self.balancer.is_draining() && self.balancer.is_idle() {
                info!("broker drained");
                break;
            }
            let drain_expired = async move {
                match drain_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                Some(frame) = self.frontend.recv() => self.on_frontend(frame),
                Some(frame) = self.backend.recv() => self.on_backend(frame),
                Some(command) = self.admin.recv() => match command {
                    AdminCommand::Status(reply) => {
                        let _ = reply.send(self.status());
                    }
                    AdminCommand::Cleanup(reply) => {
                        let removed = self.balancer.cleanup(Instant::now());
                        let _ = reply.send(removed);
                    }
                    AdminCommand::Shutdown(reply) => {
                        shutdown_waiters.push(reply);
                        if !self.balancer.is_draining() {
                            info!(timeout = ?self.config.drain_timeout(), "broker draining");
                            self.balancer.begin_drain();
                            drain_deadline = Some(tokio::time::Instant::now() + self.config.drain_timeout());
                        }
                    }
                },
                _ = sweep.tick() => {
                    let actions = self.balancer.sweep(Instant::now());
                    self.execute(actions);
                }
                () = drain_expired => {
                    warn!("drain timeout elapsed, failing remaining requests");
                    let actions = self.balancer.abandon_all(FailureKind::Shutdown, "broker stopped before a reply arrived");
                    self.execute(actions);
                    break;
                }
            }
        }

        for waiter in shutdown_waiters {
            let _ = waiter.send(());
        }
        info!("broker stopped");
    }

    fn status(&self) -> BrokerStatus {
        BrokerStatus {
            clients: self.clients.len(),
            ..self.balancer.status()
        }
    }

    fn on_frontend(&mut self, frame: FrontendFrame) {
        match frame {
            FrontendFrame::Connect { client, replies } => {
                debug!(client = %client, "client connected");
                self.clients.insert(client, replies);
            }
            FrontendFrame::Request(envelope) => {
                let actions = self.balancer.submit(envelope, Instant::now());
                self.execute(actions);
            }
            FrontendFrame::Disconnect { client } => {
                debug!(client = %client, "client disconnected");
                self.clients.remove(&client);
            }
        }
    }

    fn on_backend(&mut self, frame: BackendFrame) {
        let now = Instant::now();
        let actions = match frame {
            BackendFrame::Ready { worker, dispatch } => self.balancer.register(worker, dispatch, now),
            BackendFrame::Reply { worker, envelope } => self.balancer.on_reply(&worker, envelope, now),
            BackendFrame::Heartbeat { worker } => {
                if !self.balancer.on_heartbeat(&worker, now) {
                    debug!(worker = %worker, "ping from unregistered worker ignored");
                }
                Vec::new()
            }
            BackendFrame::Disconnect { worker } => self.balancer.evict(&worker, "worker disconnected"),
        };
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<Action<DispatchSender>>) {
        let mut work: VecDeque<_> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                Action::Dispatch {
                    worker,
                    connection,
                    envelope,
                } => {
                    debug!(worker = %worker, correlation_id = %envelope.correlation_id, "dispatch");
                    if connection.send(envelope).is_err() {
                        work.extend(self.balancer.dispatch_failed(&worker));
                    }
                }
                Action::Forward { envelope } => self.deliver(envelope),
                Action::Fail {
                    envelope,
                    kind,
                    reason,
                } => {
                    warn!(
                        correlation_id = %envelope.correlation_id,
                        ?kind,
                        reason = %reason,
                        "request failed"
                    );
                    let payload = ErrorReply::new(kind, reason).to_payload();
                    self.deliver(envelope.reply_with(payload));
                }
            }
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        let client = envelope.client.clone();
        let delivered = self
            .clients
            .get(&client)
            .is_some_and(|tx| tx.send(envelope).is_ok());
        if !delivered {
            warn!(client = %client, "reply dropped, client not connected");
            self.clients.remove(&client);
        }
    }
}
