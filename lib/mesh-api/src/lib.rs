//! Mesh API types shared by every participant of the service mesh
//!
//! This library defines the values that cross process boundaries:
//! - InstanceDescriptor: a registered service instance and its routing metadata
//! - Envelope: the (kind, id, payload) structure carried by every RPC operation
//! - CodeType: the payload encoding chosen for a call

pub mod envelope;
pub mod instance;

pub use envelope::{CodeType, Envelope, MessageKind};
pub use instance::InstanceDescriptor;
