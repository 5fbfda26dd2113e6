// MIT License

//! Direct TCP/IP communication with Telenot complex400-class intrusion
//! alarm panels via the GMS telegram protocol.
//!
//! The crate decodes the panel's binary telegram stream into a live device
//! model (areas, inputs, outputs) and a stream of change events, and sends
//! arm/disarm/output commands with acknowledgement tracking. A built-in
//! [`Simulator`] speaks the panel side for development and tests.
//!
//! # Quick start
//!
//! ```no_run
//! use telenot_gms::{ArmMode, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::builder("192.168.1.50").port(8234).build();
//!     let session = Session::connect(config).await?;
//!
//!     let mut events = session.events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{event:?}");
//!         }
//!     });
//!
//!     let outcome = session.arm(1, ArmMode::Away).await?;
//!     println!("arm area 1: {outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod event;
pub mod message;
pub mod session;
pub mod simulator;
pub mod state;

pub use classify::{AddressCategory, AddressTable, Classified};
pub use codec::{ControlField, FrameBuffer, Telegram};
pub use config::{BackoffKind, ReconnectPolicy, SessionConfig, SessionConfigBuilder};
pub use correlator::{ArmMode, CommandAction, CommandOutcome, CommandTarget, CorrelationToken};
pub use error::{GmsError, Result};
pub use event::{DecodedEvent, EventReceiver, EventSender};
pub use message::{AlarmKind, MessageBlock, PanelDateTime, StateChange};
pub use session::Session;
pub use simulator::{SimTopology, Simulator, SimulatorConfig};
pub use state::{AreaStatusFlags, ArmedState, PanelState, Snapshot};
