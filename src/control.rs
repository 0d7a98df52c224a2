//! Control-channel state machine and the tasks that drive it.
//!
//! [`ControlStateMachine`] is pure: it takes decoded messages and timestamps
//! and returns [`Action`]s. The reader task feeds it from the socket and
//! carries out the actions; the writer task owns the write half and sends
//! whatever is queued on its channel, so the reader never blocks on a write.

use crate::clock_sync::{monotonic_ns, ClockSync};
use crate::config::Mode;
use crate::measurements::Report;
use crate::protocol::{read_message, write_message, ControlMessage, ExperimentParams, MessageType};
use crate::session::RunFlag;
use crate::{Error, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Per-peer control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    Syncing,
    Ready,
    Running,
    Stopped,
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Queue a message for the peer
    Send(ControlMessage),
    /// Launch the role's UDP worker
    StartWorker {
        params: ExperimentParams,
        clock_offset: i64,
    },
    /// Clear the run flag
    Stop,
    /// The peer reported its statistics
    PeerStats(Report),
    /// A sync exchange completed
    Synced { offset_ns: i64, skew_ns: i64 },
}

#[derive(Debug)]
pub struct ControlStateMachine {
    mode: Mode,
    state: ControlState,
    clock: ClockSync,
}

impl ControlStateMachine {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            state: ControlState::Idle,
            clock: ClockSync::new(),
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn clock(&self) -> ClockSync {
        self.clock
    }

    /// The control connection is up. The client opens a sync exchange
    /// stamped `now`; the server waits for one.
    pub fn on_connect(&mut self, now: u64) -> Vec<Action> {
        self.state = ControlState::Syncing;
        match self.mode {
            Mode::Client => vec![Action::Send(ControlMessage::sync(now))],
            Mode::Server => Vec::new(),
        }
    }

    /// Dispatches one message received at local time `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] or [`Error::Json`] when a known message
    /// carries a payload that does not decode. Unknown types are not errors.
    pub fn on_message(&mut self, msg: &ControlMessage, now: u64) -> Result<Vec<Action>> {
        let actions = match msg.msg_type() {
            MessageType::Sync => {
                let t1 = msg.payload_timestamp()?;
                if self.state == ControlState::Syncing {
                    self.state = ControlState::Ready;
                }
                vec![Action::Send(ControlMessage::sync_resp(t1, now))]
            }
            MessageType::SyncResp => {
                self.clock.complete_from(msg, now)?;
                if self.state == ControlState::Syncing {
                    self.state = ControlState::Ready;
                }
                vec![Action::Synced {
                    offset_ns: self.clock.offset_ns(),
                    skew_ns: self.clock.skew_ns(),
                }]
            }
            MessageType::StartExp => {
                let params = msg.params()?;
                self.state = ControlState::Running;
                let mut actions = Vec::with_capacity(2);
                if self.mode == Mode::Server {
                    actions.push(Action::Send(ControlMessage::ack()));
                }
                actions.push(Action::StartWorker {
                    params,
                    clock_offset: msg.header.clock_offset,
                });
                actions
            }
            MessageType::StopExp => {
                if self.state == ControlState::Stopped {
                    Vec::new()
                } else {
                    self.state = ControlState::Stopped;
                    vec![Action::Stop]
                }
            }
            MessageType::Stats => vec![Action::PeerStats(msg.report()?)],
            MessageType::Ack | MessageType::Control => {
                debug!("Received {:?}", msg.msg_type());
                Vec::new()
            }
            MessageType::Unknown(byte) => {
                warn!("Ignoring control message of unknown type {}", byte);
                Vec::new()
            }
        };
        Ok(actions)
    }

    /// Local START: moves to `Running` and builds the message carrying the
    /// current skew estimate.
    pub fn start_local(&mut self, params: &ExperimentParams) -> Result<ControlMessage> {
        self.state = ControlState::Running;
        ControlMessage::start(params, self.clock.skew_ns())
    }

    /// Local stop (duration over, interrupt, worker done). Returns the STOP
    /// to send, or `None` if already stopped.
    pub fn stop_local(&mut self) -> Option<ControlMessage> {
        if self.state == ControlState::Stopped {
            return None;
        }
        self.state = ControlState::Stopped;
        Some(ControlMessage::stop())
    }
}

/// Something the coordinator needs to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Synced { offset_ns: i64, skew_ns: i64 },
    Start {
        params: ExperimentParams,
        clock_offset: i64,
    },
    PeerStats(Report),
    Stopped,
    Disconnected,
}

/// Queue into the writer task.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlSender {
    pub fn send(&self, msg: ControlMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::Connection("control channel writer has closed".to_string()))
    }
}

/// Spawns the writer task. It runs until every [`ControlSender`] is dropped
/// or a write fails, then shuts the write half down.
pub fn spawn_writer<W>(mut writer: W) -> (ControlSender, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();
    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            debug!("Sending {:?}", msg.msg_type());
            write_message(&mut writer, &msg).await?;
        }
        let _ = writer.shutdown().await;
        Ok(())
    });
    (ControlSender { tx }, handle)
}

/// Reads and dispatches control messages until the peer goes away or the
/// run flag is cleared.
///
/// The flag is checked after each message, so a message that itself stops
/// the session is still fully handled. A read error or malformed payload
/// clears the flag and reports [`SessionEvent::Disconnected`].
pub async fn run_reader<R>(
    mut reader: R,
    machine: Arc<Mutex<ControlStateMachine>>,
    sender: ControlSender,
    events: mpsc::UnboundedSender<SessionEvent>,
    flag: RunFlag,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(e) => {
                if e.is_disconnect() {
                    info!("Control connection closed by peer");
                } else {
                    warn!("Control connection failed: {}", e);
                }
                flag.stop();
                let _ = events.send(SessionEvent::Disconnected);
                return;
            }
        };
        debug!("Received {:?} ({} byte payload)", msg.msg_type(), msg.payload.len());

        let actions = machine.lock().on_message(&msg, monotonic_ns());
        let actions = match actions {
            Ok(actions) => actions,
            Err(e) => {
                warn!("Malformed {:?} message: {}", msg.msg_type(), e);
                flag.stop();
                let _ = events.send(SessionEvent::Disconnected);
                return;
            }
        };

        for action in actions {
            match action {
                Action::Send(reply) => {
                    if let Err(e) = sender.send(reply) {
                        warn!("{}", e);
                    }
                }
                Action::StartWorker { params, clock_offset } => {
                    let _ = events.send(SessionEvent::Start { params, clock_offset });
                }
                Action::Stop => {
                    info!("Peer requested stop");
                    flag.stop();
                    let _ = events.send(SessionEvent::Stopped);
                }
                Action::PeerStats(report) => {
                    let _ = events.send(SessionEvent::PeerStats(report));
                }
                Action::Synced { offset_ns, skew_ns } => {
                    let _ = events.send(SessionEvent::Synced { offset_ns, skew_ns });
                }
            }
        }

        if !flag.is_running() {
            debug!("Run flag cleared, control reader exiting");
            return;
        }
    }
}

/// How long shutdown waits for the reader to finish on its own.
pub const READER_GRACE: Duration = Duration::from_secs(1);

/// A running control connection: state machine, reader and writer tasks,
/// and the event stream the coordinator consumes.
pub struct ControlChannel {
    machine: Arc<Mutex<ControlStateMachine>>,
    sender: ControlSender,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
}

impl ControlChannel {
    /// Spawns the tasks for an established connection and performs the
    /// role's on-connect step.
    pub fn spawn<R, W>(reader: R, writer: W, mode: Mode, flag: RunFlag) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let machine = Arc::new(Mutex::new(ControlStateMachine::new(mode)));
        let (sender, writer) = spawn_writer(writer);
        let (events_tx, events) = mpsc::unbounded_channel();

        let connect_actions = machine.lock().on_connect(monotonic_ns());
        for action in connect_actions {
            if let Action::Send(msg) = action {
                sender.send(msg)?;
            }
        }

        let reader = tokio::spawn(run_reader(reader, machine.clone(), sender.clone(), events_tx, flag));

        Ok(Self {
            machine,
            sender,
            events,
            reader,
            writer,
        })
    }

    pub fn from_tcp(stream: TcpStream, mode: Mode, flag: RunFlag) -> Result<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Self::spawn(reader, writer, mode, flag)
    }

    pub fn send(&self, msg: ControlMessage) -> Result<()> {
        self.sender.send(msg)
    }

    pub fn state(&self) -> ControlState {
        self.machine.lock().state()
    }

    pub fn clock(&self) -> ClockSync {
        self.machine.lock().clock()
    }

    /// Sends START for `params` and moves to `Running`.
    pub fn start(&self, params: &ExperimentParams) -> Result<()> {
        let msg = self.machine.lock().start_local(params)?;
        self.send(msg)
    }

    /// Sends STOP unless the session is already stopped.
    pub fn stop(&self) -> Result<()> {
        let msg = self.machine.lock().stop_local();
        match msg {
            Some(msg) => self.send(msg),
            None => Ok(()),
        }
    }

    /// Next event, `None` once the reader has exited and the queue is empty.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Waits up to `limit` for an event selected by `pick`. Events that do
    /// not match are discarded; a disconnect or a closed queue ends the wait.
    pub async fn wait_for<T>(&mut self, limit: Duration, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> Option<T> {
        let wait = async {
            while let Some(event) = self.events.recv().await {
                let disconnected = event == SessionEvent::Disconnected;
                if let Some(found) = pick(event) {
                    return Some(found);
                }
                if disconnected {
                    return None;
                }
            }
            None
        };
        timeout(limit, wait).await.ok().flatten()
    }

    /// Flushes queued messages and joins both tasks. The reader gets
    /// [`READER_GRACE`] to exit before it is aborted.
    pub async fn shutdown(self) {
        let Self {
            sender,
            mut reader,
            writer,
            ..
        } = self;
        drop(sender);

        if timeout(READER_GRACE, &mut reader).await.is_err() {
            debug!("Control reader still blocked, aborting it");
            reader.abort();
            let _ = reader.await;
        }

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Control writer failed: {}", e),
            Err(e) => warn!("Control writer task failed: {}", e),
        }
    }
}
