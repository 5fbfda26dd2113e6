// MIT License

//! Protocol session: TCP connection, read loop, acknowledgements and
//! command dispatch.
//!
//! One spawned reader task owns the read half of the socket and feeds
//! every inbound telegram through the correlator (ACK matching) and the
//! device state model (event emission). Writes are serialized behind a
//! mutex; each frame goes out as a single write. A second task ticks the
//! correlator for command timeouts.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};

use crate::codec::{ControlField, FrameBuffer, Telegram};
use crate::config::SessionConfig;
use crate::correlator::{ArmMode, CommandAction, CommandOutcome, Correlator};
use crate::error::{GmsError, Result};
use crate::event::{event_channel, DecodedEvent, EventReceiver, EventSender};
use crate::state::{PanelState, Snapshot};

struct Shared {
    config: SessionConfig,
    state: Mutex<PanelState>,
    correlator: Mutex<Correlator>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    event_tx: EventSender,
    connected: RwLock<bool>,
}

/// A live connection to a panel (or the simulator).
pub struct Session {
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
    tick_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Session {
    /// Connect to the panel and start the background tasks.
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let stream = open_stream(&config).await?;
        let (read_half, write_half) = stream.into_split();
        let (event_tx, _) = event_channel(config.event_capacity);

        let shared = Arc::new(Shared {
            state: Mutex::new(PanelState::new(config.address_table.clone())),
            correlator: Mutex::new(Correlator::new(config.command_timeout)),
            writer: Mutex::new(Some(write_half)),
            event_tx,
            connected: RwLock::new(true),
            config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader_task =
            tokio::spawn(reader_loop(shared.clone(), read_half, shutdown_rx.clone()));
        let tick_task = tokio::spawn(tick_loop(shared.clone(), shutdown_rx));

        let _ = shared.event_tx.send(DecodedEvent::Connected);
        info!("Connected to {}:{}", shared.config.host, shared.config.port);

        Ok(Self { shared, reader_task, tick_task, shutdown_tx })
    }

    /// Subscribe to decoded events. Every receiver sees every event from
    /// the moment it subscribes; slow receivers lag, never block.
    pub fn events(&self) -> EventReceiver {
        self.shared.event_tx.subscribe()
    }

    /// Point-in-time copy of the device state model.
    pub async fn snapshot(&self) -> Snapshot {
        self.shared.state.lock().await.snapshot()
    }

    pub async fn is_connected(&self) -> bool {
        *self.shared.connected.read().await
    }

    /// Arm an area.
    pub async fn arm(&self, area: u8, mode: ArmMode) -> Result<CommandOutcome> {
        self.send_command(CommandAction::Arm { area, mode }).await
    }

    /// Disarm an area.
    pub async fn disarm(&self, area: u8) -> Result<CommandOutcome> {
        self.send_command(CommandAction::Disarm { area }).await
    }

    /// Activate or deactivate a switchable output.
    pub async fn set_output(&self, address: u16, active: bool) -> Result<CommandOutcome> {
        self.send_command(CommandAction::SetOutput { address, active }).await
    }

    /// Issue a command and wait for its outcome.
    ///
    /// The exchange is `SEND_NORM` + `SEND_NDAT`, each expecting a
    /// `CONFIRM_ACK`. Fails fast with [`GmsError::Busy`] while another
    /// command for the same target is pending.
    pub async fn send_command(&self, action: CommandAction) -> Result<CommandOutcome> {
        if !self.is_connected().await {
            return Err(GmsError::Disconnected);
        }

        if let CommandAction::Arm { area, .. } | CommandAction::Disarm { area } = action {
            let max = self.shared.config.address_table.area_count();
            if area == 0 || area > max {
                return Err(GmsError::InvalidArea { area, max });
            }
        }

        let block = action.to_block(&self.shared.config.address_table);
        let norm = Telegram::send_norm().encode();
        let data = Telegram::send_ndat(block.encode()).encode();

        // Registration and the writes share the writer critical section so
        // that correlator submission order always equals wire order; the
        // FIFO ACK matching depends on the two never diverging.
        debug!("Sending command {:?}", action);
        let (token, done) = {
            let mut guard = self.shared.writer.lock().await;
            let writer = guard.as_mut().ok_or(GmsError::Disconnected)?;
            let (token, done) =
                self.shared.correlator.lock().await.submit(&action, Instant::now())?;

            let written: std::io::Result<()> = async {
                writer.write_all(&norm).await?;
                writer.write_all(&data).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                self.shared.correlator.lock().await.fail(token, CommandOutcome::Disconnected);
                return Err(GmsError::Io(e));
            }
            (token, done)
        };

        // The correlator's tick resolves the normal timeout; the backstop
        // only fires if the tick task itself is gone.
        let backstop = self.shared.config.command_timeout * 2;
        match timeout(backstop, done).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(GmsError::ChannelClosed),
            Err(_) => {
                self.shared.correlator.lock().await.fail(token, CommandOutcome::TimedOut);
                Err(GmsError::TimedOut { timeout_ms: backstop.as_millis() as u64 })
            }
        }
    }

    /// Shut down the session: stop the tasks, fail pending commands and
    /// mark the model stale.
    pub async fn disconnect(self) {
        let _ = self.shutdown_tx.send(true);
        self.reader_task.abort();
        self.tick_task.abort();
        handle_disconnect(&self.shared).await;
        info!("Session closed");
    }
}

async fn open_stream(config: &SessionConfig) -> Result<TcpStream> {
    let addr = format!("{}:{}", config.host, config.port);
    match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(GmsError::Io(e)),
        Err(_) => Err(GmsError::ConnectTimeout),
    }
}

async fn handle_disconnect(shared: &Arc<Shared>) {
    *shared.connected.write().await = false;
    shared.writer.lock().await.take();
    shared.correlator.lock().await.fail_all(CommandOutcome::Disconnected);
    shared.state.lock().await.mark_stale();
    let _ = shared.event_tx.send(DecodedEvent::Disconnected);
}

async fn reader_loop(
    shared: Arc<Shared>,
    mut read_half: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 4096];

    loop {
        let lost = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    info!("Panel closed the connection");
                    true
                }
                Ok(n) => {
                    frames.extend(&buf[..n]);
                    while let Some(telegram) = frames.next_telegram() {
                        process_telegram(&shared, &telegram).await;
                    }
                    false
                }
                Err(e) => {
                    warn!("Read error: {}", e);
                    true
                }
            },
        };

        if lost {
            handle_disconnect(&shared).await;
            match reconnect(&shared, &mut shutdown_rx).await {
                Some(new_read) => {
                    read_half = new_read;
                    frames = FrameBuffer::new();
                }
                None => return,
            }
        }
    }
}

async fn process_telegram(shared: &Arc<Shared>, telegram: &Telegram) {
    // ACK/NAK matching happens before state so command completion is
    // ordered ahead of the status telegrams that follow it.
    shared.correlator.lock().await.on_telegram(telegram);

    match telegram.control {
        ControlField::SendNorm | ControlField::SendNdat => {
            let ack = Telegram::confirm_ack().encode();
            {
                let mut guard = shared.writer.lock().await;
                if let Some(writer) = guard.as_mut() {
                    if let Err(e) = writer.write_all(&ack).await {
                        warn!("Failed to acknowledge telegram: {}", e);
                    }
                }
            }
            let events = shared.state.lock().await.apply(telegram);
            for event in events {
                debug!("Event: {:?}", event);
                let _ = shared.event_tx.send(event);
            }
        }
        ControlField::ConfirmAck | ControlField::ConfirmNak => {}
        ControlField::Other(b) => {
            debug!("Ignoring telegram with unknown control {b:#04x}");
        }
    }
}

/// Reconnect per policy. Returns the new read half, or `None` when the
/// policy forbids further attempts or shutdown was requested.
async fn reconnect(
    shared: &Arc<Shared>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<OwnedReadHalf> {
    let policy = &shared.config.reconnect;
    if !policy.enabled {
        info!("Reconnect disabled, session stays down");
        return None;
    }

    let mut attempt = 1u32;
    while policy.allows_attempt(attempt) {
        let delay = policy.delay_for(attempt);
        info!("Reconnect attempt {} in {:?}", attempt, delay);
        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return None;
                }
            }
        }

        match open_stream(&shared.config).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                *shared.writer.lock().await = Some(write_half);
                *shared.connected.write().await = true;
                let _ = shared.event_tx.send(DecodedEvent::Connected);
                info!("Reconnected to {}:{}", shared.config.host, shared.config.port);
                return Some(read_half);
            }
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                attempt += 1;
            }
        }
    }

    warn!("Giving up after {} failed reconnect attempts", attempt.saturating_sub(1));
    None
}

async fn tick_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.tick_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.correlator.lock().await.tick(Instant::now());
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}
