/*!
 * Transport commands.
 *
 * A `TransportCommand` is one unit of work for a controller: an optional bus
 * address, the operation to perform and, once the worker has run it, the
 * outcome. Commands are correlated by their `CommandId`, never by content.
 */
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::address::BusAddress;
use crate::error::{BusError, Result};

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique command identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

/// Byte sequence ending a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminator {
    /// `\r`
    Cr,
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    CrLf,
    /// `\n\r`
    LfCr,
}

impl Terminator {
    /// The terminator bytes
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Terminator::Cr => b"\r",
            Terminator::Lf => b"\n",
            Terminator::CrLf => b"\r\n",
            Terminator::LfCr => b"\n\r",
        }
    }

    /// Configuration name of the terminator
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminator::Cr => "cr",
            Terminator::Lf => "lf",
            Terminator::CrLf => "crlf",
            Terminator::LfCr => "lfcr",
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Terminator {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cr" => Ok(Terminator::Cr),
            "lf" => Ok(Terminator::Lf),
            "crlf" => Ok(Terminator::CrLf),
            "lfcr" => Ok(Terminator::LfCr),
            other => Err(BusError::invalid_argument(format!(
                "Unknown terminator '{}', expected cr, lf, crlf or lfcr",
                other
            ))),
        }
    }
}

/// Status byte returned by a serial poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusByte(pub u8);

impl StatusByte {
    /// Request-service bit
    pub const RQS: u8 = 0x40;

    /// Raw value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether the device is requesting service
    pub fn requests_service(&self) -> bool {
        self.0 & Self::RQS != 0
    }

    /// Whether bit `bit` (0..=7) is set
    pub fn bit(&self, bit: u8) -> bool {
        bit < 8 && self.0 & (1 << bit) != 0
    }
}

impl fmt::Display for StatusByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A single channel primitive with its arguments
#[derive(Debug, Clone)]
pub enum ChannelOp {
    /// Read until the terminator, returning raw bytes
    Read {
        /// Response terminator
        terminator: Terminator,
    },
    /// Read until the terminator, returning text
    ReadLine {
        /// Response terminator
        terminator: Terminator,
    },
    /// Read exactly `count` bytes
    ReadN {
        /// Number of bytes
        count: usize,
    },
    /// Write a payload verbatim
    Write {
        /// Payload
        data: Bytes,
    },
    /// Write then read raw bytes
    WriteRead {
        /// Payload
        data: Bytes,
        /// Response terminator
        terminator: Terminator,
    },
    /// Write then read a line of text
    WriteReadLine {
        /// Payload
        data: Bytes,
        /// Response terminator
        terminator: Terminator,
    },
    /// Write then read exactly `count` bytes
    WriteReadN {
        /// Payload
        data: Bytes,
        /// Number of bytes
        count: usize,
    },
    /// Serial-poll the addressed device
    SerialPoll,
}

impl ChannelOp {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ChannelOp::Read { .. } => "read",
            ChannelOp::ReadLine { .. } => "readline",
            ChannelOp::ReadN { .. } => "read_n",
            ChannelOp::Write { .. } => "write",
            ChannelOp::WriteRead { .. } => "write_and_read",
            ChannelOp::WriteReadLine { .. } => "write_and_readline",
            ChannelOp::WriteReadN { .. } => "write_and_read_n",
            ChannelOp::SerialPoll => "serial_poll",
        }
    }

    /// Shape check performed before the op reaches a channel
    pub fn validate(&self) -> Result<()> {
        match self {
            ChannelOp::Write { data }
            | ChannelOp::WriteRead { data, .. }
            | ChannelOp::WriteReadLine { data, .. }
            | ChannelOp::WriteReadN { data, .. }
                if data.is_empty() =>
            {
                Err(BusError::invalid_argument(format!(
                    "{} needs a non-empty payload",
                    self.name()
                )))
            }
            ChannelOp::ReadN { count: 0 } | ChannelOp::WriteReadN { count: 0, .. } => Err(
                BusError::invalid_argument(format!("{} needs a byte count above zero", self.name())),
            ),
            _ => Ok(()),
        }
    }
}

/// What a command asks the controller to do
#[derive(Debug, Clone)]
pub enum CommandKind {
    /// One channel primitive against the command's address
    Op(ChannelOp),
    /// Several primitives run back-to-back with no other command in between
    Sequence(Vec<ChannelOp>),
    /// Pulse interface clear on the bus
    InterfaceClear,
    /// Reset the bridge itself
    ResetBridge,
}

impl CommandKind {
    /// Whether this kind targets a device and therefore needs an address
    pub fn is_addressed(&self) -> bool {
        matches!(self, CommandKind::Op(_) | CommandKind::Sequence(_))
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Op(op) => op.name(),
            CommandKind::Sequence(_) => "sequence",
            CommandKind::InterfaceClear => "interface_clear",
            CommandKind::ResetBridge => "reset_bridge",
        }
    }
}

impl From<ChannelOp> for CommandKind {
    fn from(op: ChannelOp) -> Self {
        CommandKind::Op(op)
    }
}

/// Successful outcome of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// The command produced no data
    Done,
    /// Raw response bytes
    Bytes(Vec<u8>),
    /// Response text without terminator
    Line(String),
    /// Serial poll result
    StatusByte(StatusByte),
    /// One result per op of a sequence
    Sequence(Vec<CommandResult>),
}

impl CommandResult {
    fn mismatch(&self, expected: &str) -> BusError {
        BusError::invalid_argument(format!("Expected {} result, got {:?}", expected, self))
    }

    /// Response bytes; a line is returned as its UTF-8 bytes
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            CommandResult::Bytes(bytes) => Ok(bytes),
            CommandResult::Line(line) => Ok(line.into_bytes()),
            other => Err(other.mismatch("byte")),
        }
    }

    /// Response text
    pub fn into_line(self) -> Result<String> {
        match self {
            CommandResult::Line(line) => Ok(line),
            CommandResult::Bytes(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            other => Err(other.mismatch("line")),
        }
    }

    /// Serial poll status byte
    pub fn into_status_byte(self) -> Result<StatusByte> {
        match self {
            CommandResult::StatusByte(status) => Ok(status),
            other => Err(other.mismatch("status byte")),
        }
    }

    /// Per-op results of a sequence
    pub fn into_sequence(self) -> Result<Vec<CommandResult>> {
        match self {
            CommandResult::Sequence(results) => Ok(results),
            other => Err(other.mismatch("sequence")),
        }
    }
}

/// A unit of work for a controller
#[derive(Debug)]
pub struct TransportCommand {
    id: CommandId,
    address: Option<BusAddress>,
    kind: CommandKind,
    outcome: OnceLock<Result<CommandResult>>,
}

impl TransportCommand {
    /// Create a command with a fresh identifier
    pub fn new(address: Option<BusAddress>, kind: CommandKind) -> Self {
        Self {
            id: CommandId::next(),
            address,
            kind,
            outcome: OnceLock::new(),
        }
    }

    /// Create a command targeting a device
    pub fn addressed<K: Into<CommandKind>>(address: BusAddress, kind: K) -> Self {
        Self::new(Some(address), kind.into())
    }

    /// Create a bus-level directive that needs no address
    pub fn directive(kind: CommandKind) -> Self {
        Self::new(None, kind)
    }

    /// Identifier
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Target address
    pub fn address(&self) -> Option<BusAddress> {
        self.address
    }

    /// Requested operation
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Local shape check done by the worker before execution
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_addressed() && self.address.is_none() {
            return Err(BusError::invalid_argument(format!(
                "{} {} needs a bus address",
                self.id,
                self.kind.name()
            )));
        }
        match &self.kind {
            CommandKind::Op(op) => op.validate(),
            CommandKind::Sequence(ops) if ops.is_empty() => Err(BusError::invalid_argument(
                format!("{} is an empty sequence", self.id),
            )),
            CommandKind::Sequence(ops) => ops.iter().try_for_each(ChannelOp::validate),
            CommandKind::InterfaceClear | CommandKind::ResetBridge => Ok(()),
        }
    }

    /// Record the outcome; returns `false` if one was already recorded
    pub fn complete(&self, outcome: Result<CommandResult>) -> bool {
        self.outcome.set(outcome).is_ok()
    }

    /// Whether an outcome has been recorded
    pub fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Recorded outcome, if any
    pub fn outcome(&self) -> Option<&Result<CommandResult>> {
        self.outcome.get()
    }

    /// Copy of the recorded outcome; an unfinished command is reported as interrupted
    pub fn result(&self) -> Result<CommandResult> {
        match self.outcome.get() {
            Some(outcome) => outcome.clone(),
            None => Err(BusError::interrupted(format!("{} never completed", self.id))),
        }
    }
}
