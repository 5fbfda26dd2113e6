// MIT License

use tokio::sync::broadcast;

use crate::classify::AddressCategory;
use crate::message::AlarmKind;
use crate::state::ArmedState;

/// Decoded, deduplicated events emitted by the session.
///
/// Events fire only on actual change: replaying the same status telegram
/// produces nothing. Slow consumers of the broadcast channel lose the
/// oldest events (`RecvError::Lagged`), never block the session.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    /// TCP connection to the panel established (or re-established).
    Connected,
    /// Connection lost; the device model is marked stale.
    Disconnected,
    /// An area's status byte changed.
    AreaStatusChanged {
        area: u8,
        label: String,
        armed_state: ArmedState,
        alarm: bool,
        trouble: bool,
        ready_home: bool,
        ready_away: bool,
    },
    /// An area's alarm bit went high.
    AlarmRaised { area: u8 },
    /// An area's alarm bit went low.
    AlarmCleared { area: u8 },
    /// An input changed between active and inactive.
    InputChanged {
        address: u16,
        category: AddressCategory,
        label: String,
        active: bool,
    },
    /// An output changed between active and inactive.
    OutputChanged { address: u16, label: String, active: bool },
    /// A state-change telegram arrived (raised or restored condition).
    AlarmMessage {
        address: u16,
        label: String,
        kind: AlarmKind,
        restored: bool,
    },
    /// Free-form text from the panel.
    TextMessage { text: String },
    /// The panel sent its identification number.
    PanelIdentified { identification: String },
}

pub type EventSender = broadcast::Sender<DecodedEvent>;
pub type EventReceiver = broadcast::Receiver<DecodedEvent>;

/// Create the event broadcast channel.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
