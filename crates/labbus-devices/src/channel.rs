/*!
 * Channel capability and command dispatch.
 *
 * A `BusChannel` is an open connection to the bus through some bridge. The
 * controller worker owns exactly one channel and runs every command through
 * [`execute`], so channel implementations only provide the primitives.
 */
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::address::BusAddress;
use crate::command::{ChannelOp, CommandKind, CommandResult, StatusByte, Terminator, TransportCommand};
use crate::error::{BusError, Result};

/// Primitive operations of an open bus connection
#[async_trait]
pub trait BusChannel: Send {
    /// Prepare the bridge after connecting
    async fn initialize(&mut self) -> Result<()>;

    /// Make `address` the target of following reads and writes
    async fn switch_address(&mut self, address: BusAddress) -> Result<()>;

    /// Send a payload to the current target
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read until `terminator`, which is not included in the result
    async fn read_until(&mut self, terminator: Terminator) -> Result<Vec<u8>>;

    /// Read exactly `count` bytes
    async fn read_exact(&mut self, count: usize) -> Result<Vec<u8>>;

    /// Serial-poll a device
    async fn serial_poll(&mut self, address: BusAddress) -> Result<StatusByte>;

    /// Pulse interface clear
    async fn interface_clear(&mut self) -> Result<()>;

    /// Reset the bridge
    async fn reset(&mut self) -> Result<()>;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;
}

/// Opens channels for a controller
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a new channel
    async fn connect(&self) -> Result<Box<dyn BusChannel>>;

    /// Human readable endpoint, for logs
    fn endpoint(&self) -> String;
}

/// Run one command on `channel`
///
/// Every addressed op switches to the command's address first. A sequence
/// stops at its first failing op and reports that failure.
pub async fn execute(channel: &mut dyn BusChannel, command: &TransportCommand) -> Result<CommandResult> {
    match command.kind() {
        CommandKind::Op(op) => execute_op(channel, required_address(command)?, op).await,
        CommandKind::Sequence(ops) => {
            let address = required_address(command)?;
            let mut results = Vec::with_capacity(ops.len());
            for op in ops {
                results.push(execute_op(channel, address, op).await?);
            }
            Ok(CommandResult::Sequence(results))
        }
        CommandKind::InterfaceClear => channel.interface_clear().await.map(|_| CommandResult::Done),
        CommandKind::ResetBridge => channel.reset().await.map(|_| CommandResult::Done),
    }
}

fn required_address(command: &TransportCommand) -> Result<BusAddress> {
    command.address().ok_or_else(|| {
        BusError::invalid_argument(format!("{} has no bus address", command.id()))
    })
}

async fn execute_op(channel: &mut dyn BusChannel, address: BusAddress, op: &ChannelOp) -> Result<CommandResult> {
    trace!(%address, op = op.name(), "Executing");
    channel.switch_address(address).await?;
    match op {
        ChannelOp::Read { terminator } => channel.read_until(*terminator).await.map(CommandResult::Bytes),
        ChannelOp::ReadLine { terminator } => channel.read_until(*terminator).await.map(into_line),
        ChannelOp::ReadN { count } => channel.read_exact(*count).await.map(CommandResult::Bytes),
        ChannelOp::Write { data } => channel.write(data).await.map(|_| CommandResult::Done),
        ChannelOp::WriteRead { data, terminator } => {
            channel.write(data).await?;
            channel.read_until(*terminator).await.map(CommandResult::Bytes)
        }
        ChannelOp::WriteReadLine { data, terminator } => {
            channel.write(data).await?;
            channel.read_until(*terminator).await.map(into_line)
        }
        ChannelOp::WriteReadN { data, count } => {
            channel.write(data).await?;
            channel.read_exact(*count).await.map(CommandResult::Bytes)
        }
        ChannelOp::SerialPoll => channel.serial_poll(address).await.map(CommandResult::StatusByte),
    }
}

fn into_line(bytes: Vec<u8>) -> CommandResult {
    CommandResult::Line(String::from_utf8_lossy(&bytes).into_owned())
}

async fn next_byte<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, collected: &[u8]) -> Result<u8> {
    reader.read_u8().await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => BusError::io(format!(
            "End of stream before terminator after {} bytes",
            collected.len()
        )),
        _ => e.into(),
    })
}

/// Read one byte at a time until `terminator` has been consumed
///
/// The terminator is not part of the returned bytes. For two-byte terminators
/// the first byte must be followed by the second, otherwise the stream is out
/// of sync and an I/O error is returned.
pub async fn read_until_terminator<R>(reader: &mut R, terminator: Terminator) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let pattern = terminator.bytes();
    let mut collected = Vec::new();
    loop {
        let byte = next_byte(reader, &collected).await?;
        if byte != pattern[0] {
            collected.push(byte);
            continue;
        }
        if let Some(&second) = pattern.get(1) {
            let next = next_byte(reader, &collected).await?;
            if next != second {
                return Err(BusError::io(format!(
                    "Expected {:?} after {:?} for {} terminator, got {:?}",
                    second as char, pattern[0] as char, terminator, next as char
                )));
            }
        }
        return Ok(collected);
    }
}

/// Read exactly `count` bytes
pub async fn read_exact_bytes<R>(reader: &mut R, count: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; count];
    reader.read_exact(&mut buffer).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            BusError::io(format!("End of stream before {} bytes were read", count))
        }
        _ => e.into(),
    })?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_single_byte_terminators() {
        let mut input: &[u8] = b"1.25\n2.50\r";
        assert_eq!(read_until_terminator(&mut input, Terminator::Lf).await.unwrap(), b"1.25");
        assert_eq!(read_until_terminator(&mut input, Terminator::Cr).await.unwrap(), b"2.50");
    }

    #[tokio::test]
    async fn test_two_byte_terminators() {
        let mut input: &[u8] = b"MODEL-X\r\nNEXT";
        assert_eq!(
            read_until_terminator(&mut input, Terminator::CrLf).await.unwrap(),
            b"MODEL-X"
        );
        assert_eq!(input, b"NEXT");

        let mut input: &[u8] = b"OK\n\r";
        assert_eq!(read_until_terminator(&mut input, Terminator::LfCr).await.unwrap(), b"OK");
    }

    #[tokio::test]
    async fn test_broken_pair_is_io_error() {
        let mut input: &[u8] = b"ABC\rX\n";
        let err = read_until_terminator(&mut input, Terminator::CrLf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let mut input: &[u8] = b"ABC\nX";
        let err = read_until_terminator(&mut input, Terminator::LfCr).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_lone_lf_is_data_under_crlf() {
        let mut input: &[u8] = b"A\nB\r\n";
        assert_eq!(read_until_terminator(&mut input, Terminator::CrLf).await.unwrap(), b"A\nB");
    }

    #[tokio::test]
    async fn test_eof_before_terminator() {
        let mut input: &[u8] = b"partial";
        let err = read_until_terminator(&mut input, Terminator::Lf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_read_exact_bytes() {
        let mut input: &[u8] = b"\x01\x02\x03\x04";
        assert_eq!(read_exact_bytes(&mut input, 3).await.unwrap(), vec![1, 2, 3]);
        let err = read_exact_bytes(&mut input, 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
