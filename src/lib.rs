//! # trustbus
//!
//! Mutual trust between an application processor (AP) and the components
//! attached to its bus. The AP discovers components, agrees a session key with
//! each one, verifies its attestation, authorizes it to boot, and then exchanges
//! authenticated, encrypted records with it.
//!
//! ## Layout
//! - [`core`]: packet layout, checksums on the wire, stream codecs
//! - [`protocol`]: session state machine and the handshake steps
//! - [`service`]: the AP driver and the component responder
//! - [`transport`]: bus abstraction, in-process loopback, TCP bridge
//! - [`utils`]: crypto, key storage, console, logging, metrics
//!
//! ## Example
//! ```no_run
//! use trustbus::utils::keystore::{Deployment, DeploymentParams, FlashStore};
//! use trustbus::protocol::attestation::AttestationReport;
//! use trustbus::utils::console::Console;
//! use trustbus::{ApplicationProcessor, BusAddress, Component, LoopbackBus};
//!
//! # fn main() -> trustbus::Result<()> {
//! let report = AttestationReport::new("Lab", "2024-01-01", "Acme")?;
//! let deployment = Deployment::generate(&DeploymentParams {
//!     pin: "123456",
//!     token: "0123456789abcdef",
//!     report: &report,
//!     ap_boot_message: "AP booted",
//!     component_boot_message: "Component booted",
//! })?;
//!
//! let id = 0x1111_1124;
//! let mut bus = LoopbackBus::new();
//! bus.attach(
//!     BusAddress::from_component_id(id),
//!     Component::from_secrets(id, &deployment.component)?,
//! );
//!
//! let mut ap = ApplicationProcessor::new(
//!     bus,
//!     deployment.ap,
//!     FlashStore::in_memory(&[id]),
//!     Console::new(std::io::stdout()),
//!     Default::default(),
//! )?;
//! ap.boot_all()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::packet::{Magic, Packet};
pub use config::TrustConfig;
pub use error::{ProtocolError, Result};
pub use protocol::session::{Role, Session, SessionState};
pub use service::{ApplicationProcessor, Component};
pub use transport::{Bus, BusAddress, LoopbackBus, Responder, StreamBus};
