/*!
 * Bridge protocol implementations for LabBus.
 *
 * This module contains the channel bindings for the supported bus bridges.
 */

// Export protocol implementations
pub mod prologix;

// Re-export specific protocol implementations for convenience
pub use prologix::{PrologixChannel, StreamConnector, TcpConnector};
