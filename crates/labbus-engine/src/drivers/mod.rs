/*!
 * Instrument drivers shipped with LabBus.
 */

pub mod ieee488;

pub use ieee488::{Identity, Ieee488Command, Ieee488Driver, Ieee488Status};
