// MIT License

//! Panel simulator.
//!
//! Speaks the panel side of the GMS protocol over TCP: periodic block
//! status for inputs, areas and outputs, a recurring alarm raise/restore
//! cycle on Meldergruppe 1, an identification burst on connect, and
//! acknowledgement plus application of arm/disarm/output commands.
//! Multiple clients can be connected at once; they share one topology.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::classify::{AddressCategory, AddressTable};
use crate::codec::{ControlField, FrameBuffer, Telegram};
use crate::error::Result;
use crate::message::{
    AlarmKind, BlockStatus, MessageBlock, StateChange, ADDR_EXT_INPUTS, ADDR_EXT_OUTPUTS,
    RESTORE_BIT,
};
use crate::state::AreaStatusFlags;

/// Simulator settings, loadable from TOML.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_alarm_interval_ms")]
    pub alarm_interval_ms: u64,
    #[serde(default = "default_alarm_hold_ms")]
    pub alarm_hold_ms: u64,
    #[serde(default = "default_areas")]
    pub areas: u8,
    #[serde(default = "default_detector_groups")]
    pub detector_groups: u16,
    #[serde(default)]
    pub max_clients: Option<usize>,
    #[serde(default = "default_identification")]
    pub identification: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8234
}
fn default_status_interval_ms() -> u64 {
    3000
}
fn default_alarm_interval_ms() -> u64 {
    30000
}
fn default_alarm_hold_ms() -> u64 {
    5000
}
fn default_areas() -> u8 {
    2
}
fn default_detector_groups() -> u16 {
    32
}
fn default_identification() -> String {
    "123456".to_string()
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            status_interval_ms: default_status_interval_ms(),
            alarm_interval_ms: default_alarm_interval_ms(),
            alarm_hold_ms: default_alarm_hold_ms(),
            areas: default_areas(),
            detector_groups: default_detector_groups(),
            max_clients: None,
            identification: default_identification(),
        }
    }
}

/// Shared simulated panel state.
#[derive(Debug)]
pub struct SimTopology {
    table: AddressTable,
    areas: BTreeMap<u8, AreaStatusFlags>,
    inputs: Vec<bool>,
    outputs: BTreeMap<u16, bool>,
}

impl SimTopology {
    fn new(config: &SimulatorConfig) -> Self {
        let table = AddressTable::default();
        let mut areas = BTreeMap::new();
        for index in 1..=config.areas {
            areas.insert(
                index,
                AreaStatusFlags::DISARMED
                    | AreaStatusFlags::READY_HOME
                    | AreaStatusFlags::READY_AWAY,
            );
        }
        let mut outputs = BTreeMap::new();
        for address in table.outputs_start..table.outputs_start + 16 {
            outputs.insert(address, false);
        }
        Self {
            table,
            areas,
            inputs: vec![false; config.detector_groups as usize],
            outputs,
        }
    }

    pub fn area(&self, index: u8) -> Option<AreaStatusFlags> {
        self.areas.get(&index).copied()
    }

    pub fn input(&self, index: usize) -> Option<bool> {
        self.inputs.get(index).copied()
    }

    pub fn output(&self, address: u16) -> Option<bool> {
        self.outputs.get(&address).copied()
    }

    pub fn set_input(&mut self, index: usize, active: bool) {
        if let Some(slot) = self.inputs.get_mut(index) {
            *slot = active;
        }
    }

    fn input_status_block(&self) -> MessageBlock {
        // Inverted logic on the wire: 0 = active. Bits past the configured
        // inputs stay 1 (inactive).
        let byte_count = (self.inputs.len() + 7) / 8;
        let mut status = vec![0xFFu8; byte_count];
        for (index, active) in self.inputs.iter().enumerate() {
            if *active {
                status[index / 8] &= !(1u8 << (index % 8));
            }
        }
        MessageBlock::BlockStatus(BlockStatus {
            device_area: 0,
            start_address: 0x0000,
            extension: ADDR_EXT_INPUTS,
            status,
        })
    }

    fn area_status_block(&self) -> MessageBlock {
        let count = self.areas.keys().max().copied().unwrap_or(0);
        let mut status = Vec::with_capacity(count as usize);
        for index in 1..=count {
            let flags = self.areas.get(&index).copied().unwrap_or_default();
            status.push(flags.to_status_byte());
        }
        MessageBlock::BlockStatus(BlockStatus {
            device_area: 0,
            start_address: self.table.area_status_start,
            extension: ADDR_EXT_OUTPUTS,
            status,
        })
    }

    fn output_status_block(&self) -> MessageBlock {
        let mut status = vec![0xFFu8; 2];
        for (address, active) in &self.outputs {
            let offset = (address - self.table.outputs_start) as usize;
            if *active && offset < 16 {
                status[offset / 8] &= !(1u8 << (offset % 8));
            }
        }
        MessageBlock::BlockStatus(BlockStatus {
            device_area: 0,
            start_address: self.table.outputs_start,
            extension: ADDR_EXT_OUTPUTS,
            status,
        })
    }

    /// Apply a command state-change block; returns false for blocks the
    /// simulator does not understand (they are still acknowledged).
    fn apply_command(&mut self, sc: &StateChange) -> bool {
        let classified = self.table.classify(sc.address);
        match classified.category {
            AddressCategory::AreaStatus => {
                let index = classified.index as u8;
                let Some(flags) = self.areas.get_mut(&index) else {
                    warn!("Command for unknown area {index}");
                    return false;
                };
                if !matches!(sc.kind(), AlarmKind::ArmAway | AlarmKind::ArmHome) {
                    debug!("Unsupported area command {:?}", sc.kind());
                    return false;
                }
                flags.remove(
                    AreaStatusFlags::DISARMED
                        | AreaStatusFlags::ARMED_HOME
                        | AreaStatusFlags::ARMED_AWAY,
                );
                if sc.is_restore() {
                    flags.insert(AreaStatusFlags::DISARMED);
                    flags.remove(AreaStatusFlags::ALARM);
                } else if sc.kind() == AlarmKind::ArmAway {
                    flags.insert(AreaStatusFlags::ARMED_AWAY);
                } else {
                    flags.insert(AreaStatusFlags::ARMED_HOME);
                }
                info!("Area {index} now {:?}", flags);
                true
            }
            AddressCategory::Output => {
                let active = !sc.is_restore();
                self.outputs.insert(sc.address, active);
                info!("Output 0x{:04X} set {}", sc.address, active);
                true
            }
            _ => {
                debug!("Ignoring command for {}", classified.label);
                false
            }
        }
    }

    fn raise_alarm(&mut self) {
        self.set_input(0, true);
        if let Some(flags) = self.areas.get_mut(&1) {
            flags.insert(AreaStatusFlags::ALARM);
        }
    }

    fn clear_alarm(&mut self) {
        self.set_input(0, false);
        if let Some(flags) = self.areas.get_mut(&1) {
            flags.remove(AreaStatusFlags::ALARM);
        }
    }
}

/// A running simulator instance.
pub struct Simulator {
    local_addr: SocketAddr,
    topology: Arc<Mutex<SimTopology>>,
    accept_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Simulator {
    /// Bind and start accepting clients. Port 0 picks a free port;
    /// [`local_addr`](Self::local_addr) reports the actual one.
    pub async fn bind(config: SimulatorConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Simulator listening on {}", local_addr);

        let topology = Arc::new(Mutex::new(SimTopology::new(&config)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(config),
            topology.clone(),
            shutdown_rx,
        ));

        Ok(Self { local_addr, topology, accept_task, shutdown_tx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared topology handle, mainly for tests poking the panel state.
    pub fn topology(&self) -> Arc<Mutex<SimTopology>> {
        self.topology.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();
        info!("Simulator stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<SimulatorConfig>,
    topology: Arc<Mutex<SimTopology>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let active_clients = Arc::new(AtomicUsize::new(0));
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                if let Some(max) = config.max_clients {
                    if active_clients.load(Ordering::SeqCst) >= max {
                        warn!("Rejecting {} (client limit {} reached)", peer, max);
                        continue;
                    }
                }
                info!("Client connected from {}", peer);
                active_clients.fetch_add(1, Ordering::SeqCst);
                let config = config.clone();
                let topology = topology.clone();
                let shutdown_rx = shutdown_rx.clone();
                let active = active_clients.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, config, topology, shutdown_rx).await {
                        debug!("Client {} gone: {}", peer, e);
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                    info!("Client {} disconnected", peer);
                });
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    config: Arc<SimulatorConfig>,
    topology: Arc<Mutex<SimTopology>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 4096];

    // Identification burst and banner straight after connect, the way the
    // panel announces itself.
    let mut hello = MessageBlock::Ident(config.identification.clone()).encode();
    hello.extend(MessageBlock::AsciiText("EMZ complex400H".into()).encode());
    writer.write_all(&Telegram::send_ndat(hello).encode()).await?;

    let mut status_ticker = interval(Duration::from_millis(config.status_interval_ms));
    let mut alarm_ticker = interval(Duration::from_millis(config.alarm_interval_ms));
    // An interval fires immediately on its first tick; the status burst
    // should, the alarm cycle should not.
    alarm_ticker.tick().await;

    let mut pending_restore: Option<Instant> = None;

    loop {
        let restore_at = pending_restore.unwrap_or_else(Instant::now);
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            _ = status_ticker.tick() => {
                let payload = {
                    let topo = topology.lock().await;
                    let mut payload = topo.input_status_block().encode();
                    payload.extend(topo.area_status_block().encode());
                    payload.extend(topo.output_status_block().encode());
                    payload
                };
                writer.write_all(&Telegram::send_ndat(payload).encode()).await?;
            }
            _ = alarm_ticker.tick() => {
                topology.lock().await.raise_alarm();
                let block = MessageBlock::StateChange(StateChange {
                    device_area: 0,
                    address: 0x0000,
                    extension: ADDR_EXT_INPUTS,
                    message_type: AlarmKind::Burglary.code(),
                });
                writer.write_all(&Telegram::send_ndat(block.encode()).encode()).await?;
                pending_restore =
                    Some(Instant::now() + Duration::from_millis(config.alarm_hold_ms));
            }
            _ = sleep_until(restore_at), if pending_restore.is_some() => {
                pending_restore = None;
                topology.lock().await.clear_alarm();
                let block = MessageBlock::StateChange(StateChange {
                    device_area: 0,
                    address: 0x0000,
                    extension: ADDR_EXT_INPUTS,
                    message_type: AlarmKind::Burglary.code() | RESTORE_BIT,
                });
                writer.write_all(&Telegram::send_ndat(block.encode()).encode()).await?;
            }
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                frames.extend(&buf[..n]);
                while let Some(telegram) = frames.next_telegram() {
                    match telegram.control {
                        ControlField::SendNorm => {
                            writer.write_all(&Telegram::confirm_ack().encode()).await?;
                        }
                        ControlField::SendNdat => {
                            {
                                let mut topo = topology.lock().await;
                                for block in MessageBlock::parse_all(&telegram.payload) {
                                    if let MessageBlock::StateChange(sc) = block {
                                        topo.apply_command(&sc);
                                    }
                                }
                            }
                            writer.write_all(&Telegram::confirm_ack().encode()).await?;
                        }
                        // The panel never acknowledges acknowledgements.
                        ControlField::ConfirmAck | ControlField::ConfirmNak => {}
                        ControlField::Other(b) => {
                            debug!("Unknown control {b:#04x} from client");
                            writer.write_all(&Telegram::confirm_nak().encode()).await?;
                        }
                    }
                }
            }
        }
    }
}
