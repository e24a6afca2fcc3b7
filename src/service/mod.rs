//! # Protocol Roles
//!
//! ## Components
//! - **ApplicationProcessor**: drives components through the trust sequence
//! - **Component**: answers one bus request at a time
//! - **Secure**: sealed records for post-handshake traffic

pub mod ap;
pub mod component;
pub mod secure;

pub use ap::ApplicationProcessor;
pub use component::Component;
