//! This crate implements the DICOM upper layer protocol:
//! the association engine which lets DICOM nodes
//! negotiate sessions and exchange DIMSE messages over TCP.
//!
//! It can be used as a base
//! for concrete service class users (SCUs)
//! and service class providers (SCPs).
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   and their streaming decoder and encoder.
//! - The [`association`] module
//!   comprises the association state machine,
//!   presentation context negotiation,
//!   and the requester and acceptor sides of an association.
//! - The [`dimse`] module
//!   splits DIMSE messages into presentation data values and joins them back.
//! - The [`codec`] module
//!   maps transfer syntaxes to externally provided pixel data codecs.
//! - The [`listener`] module
//!   serves many associations concurrently on a single port.
//! - The [`verification`] module
//!   implements both sides of the Verification service class.
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.

pub mod address;
pub mod association;
pub mod codec;
pub mod dimse;
pub mod listener;
pub mod pdu;
pub mod uids;
pub mod verification;

/// The implementation class UID of this crate.
///
/// Generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.302810946347186953734190285104527730641";

/// The implementation version name of this crate.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-ULP 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use listener::{Listener, ListenerOptions};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
