// MIT License

//! Device state model.
//!
//! [`PanelState`] mirrors the panel: areas (Sicherungsbereiche), inputs and
//! outputs, created lazily the first time the panel mentions them. Applying
//! a telegram returns the [`DecodedEvent`]s the change produced; applying
//! the same telegram again produces none.

use std::collections::BTreeMap;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::classify::{AddressCategory, AddressTable, Classified};
use crate::codec::{ControlField, Telegram};
use crate::event::DecodedEvent;
use crate::message::{
    AlarmKind, MessageBlock, PanelDateTime, StateChange, ADDR_EXT_INPUTS, ADDR_EXT_OUTPUTS,
};

bitflags! {
    /// One area's status byte, bit-for-bit as the panel reports it in the
    /// area-status window (after undoing the wire's inverted logic).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AreaStatusFlags: u8 {
        const DISARMED   = 0b0000_0001;
        const ARMED_HOME = 0b0000_0010;
        const ARMED_AWAY = 0b0000_0100;
        const ALARM      = 0b0000_1000;
        const TROUBLE    = 0b0001_0000;
        const READY_HOME = 0b0010_0000;
        const READY_AWAY = 0b0100_0000;
        const BUZZER     = 0b1000_0000;
    }
}

impl AreaStatusFlags {
    /// Decode a raw status byte from the wire (0 = active).
    pub fn from_status_byte(byte: u8) -> Self {
        Self::from_bits_truncate(!byte)
    }

    /// Re-encode for the wire (0 = active).
    pub fn to_status_byte(self) -> u8 {
        !self.bits()
    }
}

/// Arming state derived from the status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmedState {
    Disarmed,
    ArmedHome,
    ArmedAway,
    Unknown,
}

impl AreaStatusFlags {
    pub fn armed_state(self) -> ArmedState {
        if self.contains(Self::ARMED_AWAY) {
            ArmedState::ArmedAway
        } else if self.contains(Self::ARMED_HOME) {
            ArmedState::ArmedHome
        } else if self.contains(Self::DISARMED) {
            ArmedState::Disarmed
        } else {
            ArmedState::Unknown
        }
    }
}

/// One Sicherungsbereich.
#[derive(Debug, Clone)]
pub struct Area {
    pub index: u8,
    pub label: String,
    pub status: AreaStatusFlags,
    pub stale: bool,
    pub last_changed: DateTime<Utc>,
}

/// One input (Meldergruppe, Melderbus detector or keypad contact).
#[derive(Debug, Clone)]
pub struct Input {
    pub address: u16,
    pub category: AddressCategory,
    pub label: String,
    pub active: bool,
    pub stale: bool,
    pub last_changed: DateTime<Utc>,
}

/// One output.
#[derive(Debug, Clone)]
pub struct Output {
    pub address: u16,
    pub label: String,
    pub active: bool,
    pub stale: bool,
    pub last_changed: DateTime<Utc>,
}

/// Serializable point-in-time view of the model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub identification: Option<String>,
    pub panel_clock: Option<PanelDateTime>,
    pub areas: Vec<AreaSnapshot>,
    pub inputs: Vec<InputSnapshot>,
    pub outputs: Vec<OutputSnapshot>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AreaSnapshot {
    pub index: u8,
    pub label: String,
    pub armed_state: ArmedState,
    pub alarm: bool,
    pub trouble: bool,
    pub ready_home: bool,
    pub ready_away: bool,
    pub buzzer: bool,
    pub stale: bool,
    pub last_changed: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InputSnapshot {
    pub address: u16,
    pub category: AddressCategory,
    pub label: String,
    pub active: bool,
    pub stale: bool,
    pub last_changed: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OutputSnapshot {
    pub address: u16,
    pub label: String,
    pub active: bool,
    pub stale: bool,
    pub last_changed: DateTime<Utc>,
}

/// The mirrored panel state.
#[derive(Debug)]
pub struct PanelState {
    table: AddressTable,
    areas: BTreeMap<u8, Area>,
    inputs: BTreeMap<u16, Input>,
    outputs: BTreeMap<u16, Output>,
    identification: Option<String>,
    panel_clock: Option<PanelDateTime>,
}

impl PanelState {
    pub fn new(table: AddressTable) -> Self {
        Self {
            table,
            areas: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            identification: None,
            panel_clock: None,
        }
    }

    pub fn address_table(&self) -> &AddressTable {
        &self.table
    }

    pub fn identification(&self) -> Option<&str> {
        self.identification.as_deref()
    }

    pub fn panel_clock(&self) -> Option<PanelDateTime> {
        self.panel_clock
    }

    pub fn area(&self, index: u8) -> Option<&Area> {
        self.areas.get(&index)
    }

    pub fn input(&self, address: u16) -> Option<&Input> {
        self.inputs.get(&address)
    }

    pub fn output(&self, address: u16) -> Option<&Output> {
        self.outputs.get(&address)
    }

    /// Apply one inbound telegram, returning the events it produced.
    ///
    /// Only `SEND_NDAT` telegrams carry state; everything else is a no-op
    /// here (acknowledgements are the correlator's business).
    pub fn apply(&mut self, telegram: &Telegram) -> Vec<DecodedEvent> {
        if telegram.control != ControlField::SendNdat {
            return Vec::new();
        }

        let mut events = Vec::new();
        for block in MessageBlock::parse_all(&telegram.payload) {
            match block {
                MessageBlock::BlockStatus(bs) => {
                    // Stage area bits as (covered mask, active bits) so a
                    // block that covers only part of an area's byte leaves
                    // the unmentioned bits alone.
                    let mut staged_areas: BTreeMap<u8, (u8, u8)> = BTreeMap::new();
                    for (address, active) in bs.bits() {
                        if let Some((area, bit)) = self.table.area_bit(address) {
                            let (mask, bits) = staged_areas.entry(area).or_insert((0, 0));
                            *mask |= 1u8 << bit;
                            if active {
                                *bits |= 1u8 << bit;
                            }
                            continue;
                        }
                        match bs.extension {
                            ADDR_EXT_INPUTS => self.update_input(address, active, &mut events),
                            ADDR_EXT_OUTPUTS => self.update_output(address, active, &mut events),
                            ext => debug!("Block status with unknown extension {ext:#04x}"),
                        }
                    }
                    for (index, (mask, bits)) in staged_areas {
                        let old = self.areas.get(&index).map(|a| a.status.bits()).unwrap_or(0);
                        let merged = (old & !mask) | bits;
                        self.update_area(
                            index,
                            AreaStatusFlags::from_bits_truncate(merged),
                            &mut events,
                        );
                    }
                }
                MessageBlock::StateChange(sc) => self.apply_state_change(&sc, &mut events),
                MessageBlock::AsciiText(text) => {
                    events.push(DecodedEvent::TextMessage { text });
                }
                MessageBlock::Ident(identification) => {
                    if self.identification.as_deref() != Some(identification.as_str()) {
                        self.identification = Some(identification.clone());
                        events.push(DecodedEvent::PanelIdentified { identification });
                    }
                }
                MessageBlock::DateTime(dt) => {
                    self.panel_clock = Some(dt);
                }
                MessageBlock::Unknown { msg_type, ref data } => {
                    debug!("Ignoring unknown message block {msg_type:#04x} ({} bytes)", data.len());
                }
            }
        }
        events
    }

    fn apply_state_change(&mut self, sc: &StateChange, events: &mut Vec<DecodedEvent>) {
        let classified = self.table.classify(sc.address);
        events.push(DecodedEvent::AlarmMessage {
            address: sc.address,
            label: classified.label.clone(),
            kind: sc.kind(),
            restored: sc.is_restore(),
        });

        if classified.category == AddressCategory::AreaStatus {
            self.apply_area_state_change(sc, &classified, events);
            return;
        }

        let active = !sc.is_restore();
        match sc.extension {
            ADDR_EXT_INPUTS => self.update_input(sc.address, active, events),
            ADDR_EXT_OUTPUTS => self.update_output(sc.address, active, events),
            ext => debug!("State change with unknown extension {ext:#04x}"),
        }
    }

    fn apply_area_state_change(
        &mut self,
        sc: &StateChange,
        classified: &Classified,
        events: &mut Vec<DecodedEvent>,
    ) {
        let index = classified.index as u8;
        let mut flags = self.areas.get(&index).map(|a| a.status).unwrap_or_default();
        let restore = sc.is_restore();

        match sc.kind() {
            AlarmKind::ArmAway => {
                flags.remove(
                    AreaStatusFlags::DISARMED
                        | AreaStatusFlags::ARMED_HOME
                        | AreaStatusFlags::ARMED_AWAY,
                );
                flags.insert(if restore {
                    AreaStatusFlags::DISARMED
                } else {
                    AreaStatusFlags::ARMED_AWAY
                });
            }
            AlarmKind::ArmHome => {
                flags.remove(
                    AreaStatusFlags::DISARMED
                        | AreaStatusFlags::ARMED_HOME
                        | AreaStatusFlags::ARMED_AWAY,
                );
                flags.insert(if restore {
                    AreaStatusFlags::DISARMED
                } else {
                    AreaStatusFlags::ARMED_HOME
                });
            }
            AlarmKind::Burglary
            | AlarmKind::Fire
            | AlarmKind::Panic
            | AlarmKind::Sabotage
            | AlarmKind::TechnicalAlarm => {
                flags.set(AreaStatusFlags::ALARM, !restore);
            }
            AlarmKind::Trouble
            | AlarmKind::PowerTrouble
            | AlarmKind::BatteryTrouble
            | AlarmKind::CommTrouble => {
                flags.set(AreaStatusFlags::TROUBLE, !restore);
            }
            other => {
                debug!("State change {other} for area {index} does not map to a status bit");
            }
        }

        self.update_area(index, flags, events);
    }

    fn update_area(&mut self, index: u8, flags: AreaStatusFlags, events: &mut Vec<DecodedEvent>) {
        let label = format!("Sicherungsbereich {index}");
        let (old, was_stale, created) = match self.areas.get_mut(&index) {
            Some(area) => {
                let old = area.status;
                let was_stale = area.stale;
                if old != flags {
                    area.last_changed = Utc::now();
                }
                area.status = flags;
                area.stale = false;
                (old, was_stale, false)
            }
            None => {
                self.areas.insert(
                    index,
                    Area {
                        index,
                        label: label.clone(),
                        status: flags,
                        stale: false,
                        last_changed: Utc::now(),
                    },
                );
                (AreaStatusFlags::default(), false, true)
            }
        };

        if !created && old == flags && !was_stale {
            return;
        }

        events.push(DecodedEvent::AreaStatusChanged {
            area: index,
            label,
            armed_state: flags.armed_state(),
            alarm: flags.contains(AreaStatusFlags::ALARM),
            trouble: flags.contains(AreaStatusFlags::TROUBLE),
            ready_home: flags.contains(AreaStatusFlags::READY_HOME),
            ready_away: flags.contains(AreaStatusFlags::READY_AWAY),
        });

        let alarm_now = flags.contains(AreaStatusFlags::ALARM);
        let alarm_before = !created && old.contains(AreaStatusFlags::ALARM);
        if alarm_now && !alarm_before {
            events.push(DecodedEvent::AlarmRaised { area: index });
        } else if !alarm_now && alarm_before {
            events.push(DecodedEvent::AlarmCleared { area: index });
        }
    }

    fn update_input(&mut self, address: u16, active: bool, events: &mut Vec<DecodedEvent>) {
        let (changed, category, label) = match self.inputs.get_mut(&address) {
            Some(input) => {
                let changed = input.active != active || input.stale;
                if input.active != active {
                    input.last_changed = Utc::now();
                }
                input.active = active;
                input.stale = false;
                (changed, input.category, input.label.clone())
            }
            None => {
                let classified = self.table.classify(address);
                self.inputs.insert(
                    address,
                    Input {
                        address,
                        category: classified.category,
                        label: classified.label.clone(),
                        active,
                        stale: false,
                        last_changed: Utc::now(),
                    },
                );
                (true, classified.category, classified.label)
            }
        };
        if changed {
            events.push(DecodedEvent::InputChanged { address, category, label, active });
        }
    }

    fn update_output(&mut self, address: u16, active: bool, events: &mut Vec<DecodedEvent>) {
        let (changed, label) = match self.outputs.get_mut(&address) {
            Some(output) => {
                let changed = output.active != active || output.stale;
                if output.active != active {
                    output.last_changed = Utc::now();
                }
                output.active = active;
                output.stale = false;
                (changed, output.label.clone())
            }
            None => {
                let classified = self.table.classify(address);
                self.outputs.insert(
                    address,
                    Output {
                        address,
                        label: classified.label.clone(),
                        active,
                        stale: false,
                        last_changed: Utc::now(),
                    },
                );
                (true, classified.label)
            }
        };
        if changed {
            events.push(DecodedEvent::OutputChanged { address, label, active });
        }
    }

    /// Mark every entity stale. Values are retained; the next telegram that
    /// mentions an entity refreshes it and re-emits its current state.
    pub fn mark_stale(&mut self) {
        for area in self.areas.values_mut() {
            area.stale = true;
        }
        for input in self.inputs.values_mut() {
            input.stale = true;
        }
        for output in self.outputs.values_mut() {
            output.stale = true;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            identification: self.identification.clone(),
            panel_clock: self.panel_clock,
            areas: self
                .areas
                .values()
                .map(|a| AreaSnapshot {
                    index: a.index,
                    label: a.label.clone(),
                    armed_state: a.status.armed_state(),
                    alarm: a.status.contains(AreaStatusFlags::ALARM),
                    trouble: a.status.contains(AreaStatusFlags::TROUBLE),
                    ready_home: a.status.contains(AreaStatusFlags::READY_HOME),
                    ready_away: a.status.contains(AreaStatusFlags::READY_AWAY),
                    buzzer: a.status.contains(AreaStatusFlags::BUZZER),
                    stale: a.stale,
                    last_changed: a.last_changed,
                })
                .collect(),
            inputs: self
                .inputs
                .values()
                .map(|i| InputSnapshot {
                    address: i.address,
                    category: i.category,
                    label: i.label.clone(),
                    active: i.active,
                    stale: i.stale,
                    last_changed: i.last_changed,
                })
                .collect(),
            outputs: self
                .outputs
                .values()
                .map(|o| OutputSnapshot {
                    address: o.address,
                    label: o.label.clone(),
                    active: o.active,
                    stale: o.stale,
                    last_changed: o.last_changed,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BlockStatus;

    fn input_status_telegram(status: Vec<u8>) -> Telegram {
        let block = MessageBlock::BlockStatus(BlockStatus {
            device_area: 0,
            start_address: 0x0000,
            extension: ADDR_EXT_INPUTS,
            status,
        });
        Telegram::send_ndat(block.encode())
    }

    fn area_status_telegram(area1_byte: u8) -> Telegram {
        let block = MessageBlock::BlockStatus(BlockStatus {
            device_area: 0,
            start_address: 0x0530,
            extension: ADDR_EXT_OUTPUTS,
            status: vec![area1_byte],
        });
        Telegram::send_ndat(block.encode())
    }

    #[test]
    fn test_lazy_creation_and_idempotence() {
        let mut state = PanelState::new(AddressTable::default());
        let telegram = input_status_telegram(vec![0xFE]); // input 0 active

        let events = state.apply(&telegram);
        // 8 inputs created, each gets an event.
        assert_eq!(events.len(), 8);
        assert!(state.input(0x0000).unwrap().active);
        assert!(!state.input(0x0001).unwrap().active);

        // Same telegram again: nothing changed, nothing emitted.
        assert!(state.apply(&telegram).is_empty());
    }

    #[test]
    fn test_input_change_emits_single_event() {
        let mut state = PanelState::new(AddressTable::default());
        state.apply(&input_status_telegram(vec![0xFF]));
        let events = state.apply(&input_status_telegram(vec![0xFD]));
        assert_eq!(
            events,
            vec![DecodedEvent::InputChanged {
                address: 0x0001,
                category: AddressCategory::Meldergruppe,
                label: "Meldergruppe 2".into(),
                active: true,
            }]
        );
    }

    #[test]
    fn test_area_status_and_alarm_transitions() {
        let mut state = PanelState::new(AddressTable::default());

        // Disarmed (bit 0 active => wire byte has bit 0 low).
        let events = state.apply(&area_status_telegram(!0b0000_0001));
        assert_eq!(events.len(), 1);
        assert_eq!(state.area(1).unwrap().status.armed_state(), ArmedState::Disarmed);

        // Armed away + alarm.
        let events = state.apply(&area_status_telegram(!0b0000_1100));
        assert!(events.contains(&DecodedEvent::AlarmRaised { area: 1 }));
        let area = state.area(1).unwrap();
        assert_eq!(area.status.armed_state(), ArmedState::ArmedAway);
        assert!(area.status.contains(AreaStatusFlags::ALARM));

        // Alarm cleared.
        let events = state.apply(&area_status_telegram(!0b0000_0100));
        assert!(events.contains(&DecodedEvent::AlarmCleared { area: 1 }));
    }

    #[test]
    fn test_partial_area_block_keeps_uncovered_bits() {
        let mut state = PanelState::new(AddressTable::default());
        state.apply(&area_status_telegram(!0b0000_0001)); // area 1 disarmed
        assert_eq!(state.area(1).unwrap().status.armed_state(), ArmedState::Disarmed);

        // A block starting mid-byte (0x0533 = area 1 bit 3) that raises
        // the alarm bit must not clobber the arming bits it never covers.
        let partial = Telegram::send_ndat(
            MessageBlock::BlockStatus(BlockStatus {
                device_area: 0,
                start_address: 0x0533,
                extension: ADDR_EXT_OUTPUTS,
                status: vec![0xFE], // bit 0 => address 0x0533 active
            })
            .encode(),
        );
        let events = state.apply(&partial);
        assert!(events.contains(&DecodedEvent::AlarmRaised { area: 1 }));
        let area = state.area(1).unwrap();
        assert!(area.status.contains(AreaStatusFlags::ALARM));
        assert_eq!(area.status.armed_state(), ArmedState::Disarmed);
    }

    #[test]
    fn test_state_change_routes_to_input() {
        let mut state = PanelState::new(AddressTable::default());
        let raise = Telegram::send_ndat(
            MessageBlock::StateChange(StateChange {
                device_area: 0,
                address: 0x0003,
                extension: ADDR_EXT_INPUTS,
                message_type: 0x22,
            })
            .encode(),
        );
        let events = state.apply(&raise);
        assert!(events.iter().any(|e| matches!(
            e,
            DecodedEvent::AlarmMessage { kind: AlarmKind::Burglary, restored: false, .. }
        )));
        assert!(state.input(0x0003).unwrap().active);

        let restore = Telegram::send_ndat(
            MessageBlock::StateChange(StateChange {
                device_area: 0,
                address: 0x0003,
                extension: ADDR_EXT_INPUTS,
                message_type: 0xA2,
            })
            .encode(),
        );
        let events = state.apply(&restore);
        assert!(!state.input(0x0003).unwrap().active);
        assert!(events
            .iter()
            .any(|e| matches!(e, DecodedEvent::InputChanged { active: false, .. })));
    }

    #[test]
    fn test_arm_state_change_updates_area() {
        let mut state = PanelState::new(AddressTable::default());
        let table = AddressTable::default();
        let arm = Telegram::send_ndat(
            MessageBlock::StateChange(StateChange {
                device_area: 0,
                address: table.area_command_address(2),
                extension: ADDR_EXT_OUTPUTS,
                message_type: 0x61,
            })
            .encode(),
        );
        state.apply(&arm);
        assert_eq!(state.area(2).unwrap().status.armed_state(), ArmedState::ArmedAway);

        let disarm = Telegram::send_ndat(
            MessageBlock::StateChange(StateChange {
                device_area: 0,
                address: table.area_command_address(2),
                extension: ADDR_EXT_OUTPUTS,
                message_type: 0xE1,
            })
            .encode(),
        );
        state.apply(&disarm);
        assert_eq!(state.area(2).unwrap().status.armed_state(), ArmedState::Disarmed);
    }

    #[test]
    fn test_stale_entities_reemit_on_refresh() {
        let mut state = PanelState::new(AddressTable::default());
        let telegram = input_status_telegram(vec![0xFE]);
        state.apply(&telegram);
        state.mark_stale();
        assert!(state.input(0x0000).unwrap().stale);

        // Unchanged values, but the refresh after staleness re-emits.
        let events = state.apply(&telegram);
        assert_eq!(events.len(), 8);
        assert!(!state.input(0x0000).unwrap().stale);
    }

    #[test]
    fn test_ident_and_text_and_clock() {
        let mut state = PanelState::new(AddressTable::default());
        let mut payload = MessageBlock::Ident("123456".into()).encode();
        payload.extend(MessageBlock::AsciiText("EMZ complex400H".into()).encode());
        payload.extend(
            MessageBlock::DateTime(PanelDateTime {
                year: 25,
                month: 6,
                day: 1,
                weekday: 0,
                hour: 12,
                minute: 0,
                second: 0,
            })
            .encode(),
        );
        let events = state.apply(&Telegram::send_ndat(payload.clone()));
        assert!(events.contains(&DecodedEvent::PanelIdentified {
            identification: "123456".into()
        }));
        assert!(events.contains(&DecodedEvent::TextMessage { text: "EMZ complex400H".into() }));
        assert_eq!(state.identification(), Some("123456"));
        assert!(state.panel_clock().is_some());

        // Ident unchanged on replay: only the text event repeats.
        let events = state.apply(&Telegram::send_ndat(payload));
        assert_eq!(events, vec![DecodedEvent::TextMessage { text: "EMZ complex400H".into() }]);
    }

    #[test]
    fn test_non_ndat_telegrams_ignored() {
        let mut state = PanelState::new(AddressTable::default());
        assert!(state.apply(&Telegram::confirm_ack()).is_empty());
        assert!(state.apply(&Telegram::send_norm()).is_empty());
    }
}
