// MIT License

//! Command/ACK correlation.
//!
//! A GMS command is a two-telegram exchange: `SEND_NORM`, then a
//! `SEND_NDAT` carrying a state-change block, each answered with
//! `CONFIRM_ACK`. The acknowledgements carry no sequence number, so
//! pending commands are matched FIFO against the order they were
//! submitted, two ACKs each. Only one command may be pending per target
//! at a time, which keeps the FIFO matching unambiguous.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::classify::AddressTable;
use crate::codec::{ControlField, Telegram};
use crate::error::{GmsError, Result};
use crate::message::{MessageBlock, StateChange, ADDR_EXT_OUTPUTS, RESTORE_BIT};

/// What a command is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTarget {
    Area(u8),
    Output(u16),
}

impl std::fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Area(index) => write!(f, "area {index}"),
            Self::Output(address) => write!(f, "output 0x{address:04X}"),
        }
    }
}

/// Arming mode for area commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmMode {
    Away,
    Home,
}

/// A command the client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Arm { area: u8, mode: ArmMode },
    Disarm { area: u8 },
    SetOutput { address: u16, active: bool },
}

impl CommandAction {
    pub fn target(&self) -> CommandTarget {
        match self {
            Self::Arm { area, .. } | Self::Disarm { area } => CommandTarget::Area(*area),
            Self::SetOutput { address, .. } => CommandTarget::Output(*address),
        }
    }

    /// Wire message type for the state-change block.
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Arm { mode: ArmMode::Away, .. } => 0x61,
            Self::Arm { mode: ArmMode::Home, .. } => 0x62,
            Self::Disarm { .. } => 0x61 | RESTORE_BIT,
            Self::SetOutput { active: true, .. } => 0x00,
            Self::SetOutput { active: false, .. } => RESTORE_BIT,
        }
    }

    /// Encode as the state-change block the panel expects.
    pub fn to_block(&self, table: &AddressTable) -> MessageBlock {
        let address = match self {
            Self::Arm { area, .. } | Self::Disarm { area } => table.area_command_address(*area),
            Self::SetOutput { address, .. } => *address,
        };
        MessageBlock::StateChange(StateChange {
            device_area: 0,
            address,
            extension: ADDR_EXT_OUTPUTS,
            message_type: self.message_type(),
        })
    }
}

/// Final state of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Acknowledged,
    Rejected,
    TimedOut,
    Disconnected,
}

/// Opaque handle for a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(u64);

#[derive(Debug)]
struct PendingCommand {
    token: CorrelationToken,
    target: CommandTarget,
    deadline: Instant,
    acks_remaining: u8,
    done: oneshot::Sender<CommandOutcome>,
}

/// Tracks pending commands and resolves them from inbound telegrams.
#[derive(Debug)]
pub struct Correlator {
    next_token: u64,
    timeout: Duration,
    pending: VecDeque<PendingCommand>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self { next_token: 1, timeout, pending: VecDeque::new() }
    }

    /// Register a command. Fails with [`GmsError::Busy`] while another
    /// command for the same target is still pending.
    pub fn submit(
        &mut self,
        action: &CommandAction,
        now: Instant,
    ) -> Result<(CorrelationToken, oneshot::Receiver<CommandOutcome>)> {
        let target = action.target();
        if self.pending.iter().any(|p| p.target == target) {
            return Err(GmsError::Busy { target });
        }

        let token = CorrelationToken(self.next_token);
        self.next_token += 1;
        let (done, rx) = oneshot::channel();
        self.pending.push_back(PendingCommand {
            token,
            target,
            deadline: now + self.timeout,
            acks_remaining: 2,
            done,
        });
        Ok((token, rx))
    }

    /// Feed one inbound telegram. Consumes ACK/NAK telegrams against the
    /// oldest pending command; everything else is ignored.
    pub fn on_telegram(&mut self, telegram: &Telegram) {
        match telegram.control {
            ControlField::ConfirmAck => match self.pending.front_mut() {
                Some(front) if front.acks_remaining > 1 => front.acks_remaining -= 1,
                Some(_) => {
                    if let Some(cmd) = self.pending.pop_front() {
                        debug!("Command for {} acknowledged", cmd.target);
                        let _ = cmd.done.send(CommandOutcome::Acknowledged);
                    }
                }
                None => debug!("CONFIRM_ACK with no pending command, ignoring"),
            },
            ControlField::ConfirmNak => {
                if let Some(cmd) = self.pending.pop_front() {
                    warn!("Command for {} rejected by panel", cmd.target);
                    let _ = cmd.done.send(CommandOutcome::Rejected);
                } else {
                    debug!("CONFIRM_NAK with no pending command, ignoring");
                }
            }
            _ => {}
        }
    }

    /// Expire commands whose deadline has passed.
    pub fn tick(&mut self, now: Instant) {
        let mut keep = VecDeque::with_capacity(self.pending.len());
        for cmd in self.pending.drain(..) {
            if cmd.deadline > now {
                keep.push_back(cmd);
            } else {
                warn!("Command for {} timed out", cmd.target);
                let _ = cmd.done.send(CommandOutcome::TimedOut);
            }
        }
        self.pending = keep;
    }

    /// Fail one specific command (e.g. its write never made it out).
    pub fn fail(&mut self, token: CorrelationToken, outcome: CommandOutcome) {
        if let Some(pos) = self.pending.iter().position(|p| p.token == token) {
            if let Some(cmd) = self.pending.remove(pos) {
                let _ = cmd.done.send(outcome);
            }
        }
    }

    /// Fail every pending command, e.g. on connection loss.
    pub fn fail_all(&mut self, outcome: CommandOutcome) {
        for cmd in self.pending.drain(..) {
            debug!("Failing pending command for {}: {:?}", cmd.target, outcome);
            let _ = cmd.done.send(outcome);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
