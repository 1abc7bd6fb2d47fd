//! Command frames, status bytes and the data token handshake

use crate::bus::{selected, SdBus, SD_FILL_BYTE};
use crate::errors::{BusError, BusyTimeoutSnafu, IoError, TokenTimeoutSnafu, WriteRejectedSnafu};
use log::trace;
use snafu::prelude::*;

/// Length of a command frame in bytes
pub const SD_CMD_FRAME_LEN: usize = 6;

/// Every frame ends with this byte. It is the valid CRC7 of CMD0 and of
/// CMD8 with the 0x1AA argument, the card ignores it for everything else.
pub const SD_CMD_TRAILER: u8 = 0x95;

/// Number of fill bytes clocked while waiting for a status byte
pub const SD_RESPONSE_POLLS: usize = 8;

/// Start token for single block reads and writes
pub const SD_DATA_START_TOKEN: u8 = 0xFE;

/// Mask applied to the data response byte after a write
pub const SD_DATA_RES_MASK: u8 = 0x1F;

/// Masked data response for an accepted block
pub const SD_DATA_RES_ACCEPTED: u8 = 0x05;

/// Length of the CRC16 that trails every data block
pub const SD_DATA_CRC_LEN: usize = 2;

/// Voltage range (2.7-3.6v) and check pattern for CMD8
pub const SD_IF_COND_ARG: u32 = 0x1AA;

/// HCS bit for ACMD41, tells the card we can address high capacity media
pub const SD_HCS: u32 = 0x4000_0000;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// Commands the driver knows how to send in SPI mode
pub enum SdCmd {
    /// CMD0: GO_IDLE_STATE, resets the card into SPI mode
    GoIdleState,
    /// CMD1: SEND_OP_COND, legacy initialization for version 1 cards
    SendOpCond,
    /// CMD8: SEND_IF_COND, supply the voltage range and check pattern
    SendIfCond(u32),
    /// CMD9: SEND_CSD, the register follows as a data block
    SendCsd,
    /// CMD16: SET_BLOCKLEN, supply the block length in bytes
    SetBlockLen(u32),
    /// CMD17: READ_SINGLE_BLOCK, supply the data address
    ReadSingleBlock(u32),
    /// CMD24: WRITE_BLOCK, supply the data address
    WriteBlock(u32),
    /// ACMD41: SD_APP_OP_COND, supply the host capacity support argument.
    /// Only valid right after an AppCmd.
    SdAppOpCond(u32),
    /// CMD55: APP_CMD, marks the next command as application specific
    AppCmd,
    /// CMD58: READ_OCR, the register follows the status byte
    ReadOcr,
}

impl SdCmd {
    #[inline]
    /// Get the index of a command
    pub fn get_cmd_index(&self) -> u8 {
        match self {
            Self::GoIdleState => 0,
            Self::SendOpCond => 1,
            Self::SendIfCond(_) => 8,
            Self::SendCsd => 9,
            Self::SetBlockLen(_) => 16,
            Self::ReadSingleBlock(_) => 17,
            Self::WriteBlock(_) => 24,
            Self::SdAppOpCond(_) => 41,
            Self::AppCmd => 55,
            Self::ReadOcr => 58,
        }
    }

    /// Get the 32 bit argument of a command
    pub fn get_argument(&self) -> u32 {
        match self {
            Self::SendIfCond(arg)
            | Self::SetBlockLen(arg)
            | Self::ReadSingleBlock(arg)
            | Self::WriteBlock(arg)
            | Self::SdAppOpCond(arg) => *arg,
            // And some commands don't have an argument
            Self::GoIdleState | Self::SendOpCond | Self::SendCsd | Self::AppCmd | Self::ReadOcr => 0,
        }
    }

    /// Format the command as it goes on the wire
    pub fn format(&self) -> [u8; SD_CMD_FRAME_LEN] {
        CommandFrame::new(self.get_cmd_index(), self.get_argument()).0
    }
}

/// A raw six byte command frame
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CommandFrame(pub [u8; SD_CMD_FRAME_LEN]);

impl CommandFrame {
    /// Build a frame for any command index. Only the low 6 bits of the
    /// index are used.
    pub fn new(index: u8, argument: u32) -> Self {
        let arg = argument.to_be_bytes();

        // Start bit 0, transmission bit 1, then the index
        Self([
            0x40 | (index & 0x3F),
            arg[0],
            arg[1],
            arg[2],
            arg[3],
            SD_CMD_TRAILER,
        ])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Single byte R1 status returned after every command
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct R1Status(pub u8);

impl R1Status {
    /// Card is initialized and the command succeeded
    pub const READY: R1Status = R1Status(0x00);
    /// Card is in the idle state, nothing else to report
    pub const IDLE: R1Status = R1Status(0x01);
    /// Idle and the command was not recognized, what version 1 cards say to CMD8
    pub const IDLE_ILLEGAL: R1Status = R1Status(0x05);

    #[inline]
    /// Returns false when the card never drove the line, bit 7 set
    pub fn is_valid(&self) -> bool {
        (self.0 & 0x80) == 0
    }
    #[inline]
    /// Returns true if the IN_IDLE_STATE bit is set
    pub fn idle(&self) -> bool {
        (self.0 & 0x01) > 0
    }
    #[inline]
    /// Returns true if the ILLEGAL_COMMAND bit is set
    pub fn illegal_command(&self) -> bool {
        (self.0 & 0x04) > 0
    }
    #[inline]
    /// Returns true if the ADDRESS_ERROR bit is set
    pub fn address_error(&self) -> bool {
        (self.0 & 0x20) > 0
    }
    #[inline]
    /// Returns true if the PARAMETER_ERROR bit is set
    pub fn parameter_error(&self) -> bool {
        (self.0 & 0x40) > 0
    }
}

/// Send a command and return its status byte
///
/// Select is asserted for the frame and the response window and released
/// before returning, even when the bus fails half way. If no byte with a
/// clear high bit shows up within [`SD_RESPONSE_POLLS`] fill bytes the last
/// byte polled is returned as is, so callers have to check it.
pub fn send_command<B: SdBus>(bus: &mut B, command: SdCmd) -> Result<R1Status, BusError> {
    let frame = command.format();

    let status = selected(bus, |bus| exchange_frame(bus, &frame))?;

    trace!(
        "CMD{} arg {:#010x} -> {:#04x}",
        command.get_cmd_index(),
        command.get_argument(),
        status.0
    );

    Ok(status)
}

fn exchange_frame<B: SdBus>(bus: &mut B, frame: &[u8; SD_CMD_FRAME_LEN]) -> Result<R1Status, BusError> {
    bus.exchange_block(Some(frame), None, frame.len())?;

    let mut response = SD_FILL_BYTE;
    for _ in 0..SD_RESPONSE_POLLS {
        response = bus.exchange_byte(SD_FILL_BYTE)?;

        if R1Status(response).is_valid() {
            break;
        }
    }

    Ok(R1Status(response))
}

/// Clock fill bytes until the data start token shows up, then read
/// `buffer.len()` bytes and drop the CRC. Gives up after `polls` bytes.
pub fn receive_data<B: SdBus>(bus: &mut B, buffer: &mut [u8], polls: u32) -> Result<(), IoError> {
    let mut token = SD_FILL_BYTE;
    for _ in 0..polls {
        token = bus.exchange_byte(SD_FILL_BYTE)?;

        if token == SD_DATA_START_TOKEN {
            break;
        }
    }

    ensure!(token == SD_DATA_START_TOKEN, TokenTimeoutSnafu { polls });

    let len = buffer.len();
    bus.exchange_block(None, Some(buffer), len)?;

    // CRC isn't checked in SPI mode
    bus.exchange_block(None, None, SD_DATA_CRC_LEN)?;

    Ok(())
}

/// Send the start token, `data` and a dummy CRC, then check the data
/// response and wait up to `polls` bytes for the card to stop holding the
/// line low.
pub fn transmit_data<B: SdBus>(bus: &mut B, data: &[u8], polls: u32) -> Result<(), IoError> {
    bus.exchange_byte(SD_DATA_START_TOKEN)?;
    bus.exchange_block(Some(data), None, data.len())?;
    bus.exchange_block(None, None, SD_DATA_CRC_LEN)?;

    let response = bus.exchange_byte(SD_FILL_BYTE)?;
    ensure!(
        (response & SD_DATA_RES_MASK) == SD_DATA_RES_ACCEPTED,
        WriteRejectedSnafu { response }
    );

    let mut line = 0x00;
    for _ in 0..polls {
        line = bus.exchange_byte(SD_FILL_BYTE)?;

        if line == SD_FILL_BYTE {
            break;
        }
    }

    ensure!(line == SD_FILL_BYTE, BusyTimeoutSnafu { polls });

    Ok(())
}
