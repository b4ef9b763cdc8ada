use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::WorkerError;
use crate::events::{EventReceiver, EventSender, WorkerEvent};
use crate::job::{Job, JobState};
use crate::session::host::HostInfo;
use crate::session::logging::{LogForwarder, WORKER_TARGET};
use crate::session::outbound::OutboundSlot;
use crate::session::protocol::{FrameDecoder, Inbound, Outbound, ProtocolError};
use crate::shutdown::Shutdown;
use crate::worker::{Orchestrator, RESOURCE_EXHAUSTED_EXIT_CODE};

/// How long `TerminateWorker` and `ResetWorker` wait for the cancelled job to
/// be reported before the worker stops.
const HALT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingHeartbeat,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::AwaitingHeartbeat => "awaiting heartbeat",
        };
        f.write_str(s)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// The control server closed the stream or the transport failed.
    Closed,
    /// The control server could not be reached.
    Unreachable,
    /// No `Pong` within the heartbeat deadline.
    HeartbeatMissed,
    /// The worker was told to stop, or is shutting down.
    Halted,
}

enum Dispatch {
    Continue,
    Halt,
}

/// The worker's connection to the control server.
///
/// Reconnects with a fixed delay until the worker is told to stop. Inbound
/// messages become orchestrator commands; worker events become outbound
/// messages. Events raised while disconnected are dropped.
pub struct Session {
    addr: String,
    config: SessionConfig,
    host: HostInfo,
    orchestrator: Orchestrator,
    events: EventSender,
    outbound: OutboundSlot,
    logs: LogForwarder,
    shutdown: Shutdown,
    state: ConnectionState,
}

impl Session {
    pub fn new(
        addr: impl Into<String>,
        config: SessionConfig,
        orchestrator: Orchestrator,
        events: EventSender,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            addr: addr.into(),
            config,
            host: HostInfo::detect(),
            orchestrator,
            events,
            outbound: OutboundSlot::new(),
            logs: LogForwarder::new(),
            shutdown,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn with_host_info(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    /// Routes `job`/`worker` log events over this session's connection.
    pub fn with_log_forwarder(mut self, logs: LogForwarder) -> Self {
        self.logs = logs;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "Connection state changed");
            self.state = state;
        }
    }

    /// Runs until shutdown is requested or the control server halts the
    /// worker. `events` is the receiving end of the channel jobs and the
    /// orchestrator report on.
    pub async fn run(mut self, mut events: EventReceiver) {
        while !self.shutdown.is_requested() {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.requested() => break,
                result = TcpStream::connect(&self.addr) => result,
            };

            let end = match connected {
                Ok(stream) => {
                    tracing::info!(target: WORKER_TARGET, addr = %self.addr, "Connected to control server");
                    let end = self.serve(stream, &mut events).await;
                    tracing::info!(addr = %self.addr, reason = ?end, "Disconnected from control server");
                    end
                }
                Err(e) => {
                    tracing::debug!(addr = %self.addr, error = %e, "Control server unreachable");
                    ConnectionEnd::Unreachable
                }
            };
            self.set_state(ConnectionState::Disconnected);

            match end {
                ConnectionEnd::Halted => break,
                ConnectionEnd::Closed => {}
                ConnectionEnd::Unreachable | ConnectionEnd::HeartbeatMissed => {
                    if !self.backoff(&mut events).await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Sleeps the reconnect interval. Returns false if shutdown was requested
    /// meanwhile.
    async fn backoff(&self, events: &mut EventReceiver) -> bool {
        let wake = tokio::time::sleep(self.config.reconnect_interval);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.requested() => return false,
                Some(event) = events.recv() => self.forward_event(event).await,
                _ = &mut wake => return true,
            }
        }
    }

    async fn serve(&mut self, stream: TcpStream, events: &mut EventReceiver) -> ConnectionEnd {
        let (reader, writer) = stream.into_split();
        self.outbound.attach(writer).await;
        self.set_state(ConnectionState::Connected);

        if let Err(e) = self.outbound.send(&Outbound::Hello(self.host.clone())).await {
            tracing::warn!(error = %e, "Failed to send host information");
            self.outbound.detach().await;
            return ConnectionEnd::Closed;
        }
        let log_task = spawn_log_forwarder(&self.logs, self.outbound.clone());

        let end = self.read_loop(reader, events).await;
        if end == ConnectionEnd::Halted {
            // Report what the halted job left behind before hanging up.
            while let Ok(event) = events.try_recv() {
                self.forward_event(event).await;
            }
        }

        self.logs.detach();
        let _ = log_task.await;
        self.outbound.detach().await;
        end
    }

    async fn read_loop(
        &mut self,
        reader: OwnedReadHalf,
        events: &mut EventReceiver,
    ) -> ConnectionEnd {
        let mut lines = BufReader::new(reader).lines();
        let mut decoder = FrameDecoder::new();
        let mut deadline = Instant::now() + self.config.idle_timeout;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.requested() => return ConnectionEnd::Halted,
                Some(event) = events.recv() => {
                    self.forward_event(event).await;
                    continue;
                }
                read = tokio::time::timeout_at(deadline, lines.next_line()) => read,
            };

            match read {
                Err(_) if self.state == ConnectionState::AwaitingHeartbeat => {
                    tracing::warn!(addr = %self.addr, "No Pong from control server, dropping connection");
                    return ConnectionEnd::HeartbeatMissed;
                }
                Err(_) => {
                    self.set_state(ConnectionState::AwaitingHeartbeat);
                    deadline = Instant::now() + self.config.heartbeat_deadline;
                    if let Err(e) = self.outbound.send(&Outbound::Ping).await {
                        tracing::debug!(error = %e, "Failed to send Ping");
                        return ConnectionEnd::Closed;
                    }
                }
                Ok(Ok(Some(line))) => {
                    if let Some(message) = decoder.push_line(&line) {
                        if let Dispatch::Halt = self.dispatch(message).await {
                            return ConnectionEnd::Halted;
                        }
                    }
                    let timeout = match self.state {
                        ConnectionState::AwaitingHeartbeat => self.config.heartbeat_deadline,
                        _ => self.config.idle_timeout,
                    };
                    deadline = Instant::now() + timeout;
                }
                Ok(Ok(None)) => return ConnectionEnd::Closed,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Read from control server failed");
                    return ConnectionEnd::Closed;
                }
            }
        }
    }

    async fn dispatch(&mut self, message: Vec<String>) -> Dispatch {
        let inbound = match Inbound::parse(message) {
            Ok(inbound) => inbound,
            Err(ProtocolError::EmptyMessage) => {
                tracing::warn!("Ignoring empty message from control server");
                return Dispatch::Continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Protocol error in NewJob message");
                self.reply(Outbound::JobFailed(e.to_string())).await;
                return Dispatch::Continue;
            }
        };

        match inbound {
            Inbound::NewJob(spec) => {
                if self.orchestrator.is_busy() {
                    tracing::info!(job_id = %spec.id, "Refusing job, worker is busy");
                    self.reply(Outbound::JobRefused).await;
                    return Dispatch::Continue;
                }
                let job = Arc::new(Job::new(spec, self.events.clone()));
                let started = job
                    .set_state(JobState::Scheduled)
                    .and_then(|()| self.orchestrator.start_job(job.clone()));
                match started {
                    Ok(()) => {}
                    Err(WorkerError::Busy(_)) => {
                        self.reply(Outbound::JobRefused).await;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job.id(), error = %e, "Could not start job");
                        self.reply(Outbound::JobFailed(e.to_string())).await;
                    }
                }
            }
            Inbound::CancelJob => self.orchestrator.kill_job(),
            Inbound::TerminateWorker => {
                tracing::info!(target: WORKER_TARGET, "Control server terminates the worker");
                self.halt().await;
                return Dispatch::Halt;
            }
            Inbound::ResetWorker => {
                tracing::info!(target: WORKER_TARGET, "Control server resets the worker");
                self.halt().await;
                return Dispatch::Halt;
            }
            Inbound::Ping => self.reply(Outbound::Pong).await,
            Inbound::Pong => self.set_state(ConnectionState::Connected),
            Inbound::Unhandled { token, lines } => {
                tracing::error!(token = %token, lines = ?lines, "Unhandled message");
            }
        }
        Dispatch::Continue
    }

    /// Cancels the active job, gives it a moment to be reported, then asks
    /// the worker to exit.
    async fn halt(&self) {
        self.orchestrator.kill_job();
        if tokio::time::timeout(HALT_GRACE, self.orchestrator.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("Cancelled job did not finish in time");
        }
        self.shutdown.request_exit(0);
    }

    async fn forward_event(&self, event: WorkerEvent) {
        let message = match &event {
            WorkerEvent::StateChanged { state, .. } => Outbound::JobStateChange(state.clone()),
            WorkerEvent::JobStarted { .. } => Outbound::JobAccepted,
            WorkerEvent::JobFinished { .. } => Outbound::JobFinished,
            WorkerEvent::ResourceExhausted { job_id } => {
                tracing::error!(job_id = %job_id, "Resource exhaustion, stopping worker");
                self.shutdown.request_exit(RESOURCE_EXHAUSTED_EXIT_CODE);
                return;
            }
        };
        if let Err(e) = self.outbound.send(&message).await {
            tracing::debug!(event = ?event, error = %e, "Dropping event, not connected");
        }
    }

    async fn reply(&self, message: Outbound) {
        if let Err(e) = self.outbound.send(&message).await {
            tracing::debug!(error = %e, "Failed to reply to control server");
        }
    }
}

fn spawn_log_forwarder(logs: &LogForwarder, outbound: OutboundSlot) -> JoinHandle<()> {
    let mut records = logs.attach();
    tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            if outbound.send(&Outbound::Logging(record)).await.is_err() {
                break;
            }
        }
    })
}
