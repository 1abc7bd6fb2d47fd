//! Errors in the sdspi ecosystem

use embedded_io::{blocking::ReadExactError, Error, ErrorKind};
use snafu::prelude::*;

/// Failures of the raw bus, independent of what the card said
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum BusError {
    #[snafu(display("(BUS) SPI transfer failed!"))]
    Spi {},
    #[snafu(display("(BUS) Failed to drive the chip select line!"))]
    ChipSelect {},
}

/// Failures while bringing a card up
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display("(INIT) No valid response to CMD{command} (got {status:#04x})!"))]
    NoResponse { command: u8, status: u8 },
    #[snafu(display("(INIT) Unrecognized card generation (CMD8 got {status:#04x})!"))]
    UnknownGeneration { status: u8 },
    #[snafu(display("(INIT) Card still busy after {iterations} op-cond polls!"))]
    OpCondTimeout { iterations: u32 },
    #[snafu(display("(INIT) Card rejected the block length (got {status:#04x})!"))]
    BlockLenRejected { status: u8 },
    #[snafu(context(false), display("(INIT) {source}"))]
    InitBus { source: BusError },
}

/// Failures of a single block transfer
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum IoError {
    #[snafu(display("(IO) Card rejected CMD{command} (got {status:#04x})!"))]
    CommandRejected { command: u8, status: u8 },
    #[snafu(display("(IO) No data token after {polls} polls!"))]
    TokenTimeout { polls: u32 },
    #[snafu(display("(IO) Card rejected the written block (response {response:#04x})!"))]
    WriteRejected { response: u8 },
    #[snafu(display("(IO) Card still busy after {polls} polls!"))]
    BusyTimeout { polls: u32 },
    #[snafu(display("(IO) Card size is unknown, read the CSD first!"))]
    SizeUnknown {},
    #[snafu(display("(IO) Position {position} is past the end of the card!"))]
    PastEnd { position: u64 },
    #[snafu(display("(IO) Unexpected EOF!"))]
    UnexpectedEof {},
    #[snafu(context(false), display("(IO) {source}"))]
    IoBus { source: BusError },
}

/// Reasons a boot sector cannot be mounted
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum LayoutError {
    #[snafu(display("(FAT) Failed to read the boot sector: {source}"))]
    ReadBoot { source: IoError },
    #[snafu(display("(FAT) Unsupported sector size {bytes_per_sector}!"))]
    BadSectorSize { bytes_per_sector: u16 },
    #[snafu(display("(FAT) Missing boot signature (got {signature:#06x})!"))]
    BadSignature { signature: u16 },
    #[snafu(display("(FAT) Not a FAT32 filesystem!"))]
    NotFat32 { fs_type: [u8; 8] },
    #[snafu(display("(FAT) {num_fats} FATs of {fat_size_sectors} sectors don't fit on a card!"))]
    BadGeometry { num_fats: u8, fat_size_sectors: u32 },
}

/// Failures of the volume layer
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum FormatError {
    #[snafu(display("(FAT) Format was not confirmed!"))]
    NotConfirmed {},
    #[snafu(display("(FAT) Failed to initialize the card: {source}"))]
    FormatInit { source: InitError },
    #[snafu(display("(FAT) Failed to write the {step}: {source}"))]
    WriteStep { step: &'static str, source: IoError },
    #[snafu(context(false), display("{source}"))]
    Layout { source: LayoutError },
    #[snafu(display("(FAT) Filesystem written but could not be mounted: {source}"))]
    Mount { source: LayoutError },
}

impl Error for IoError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

impl From<IoError> for ReadExactError<IoError> {
    fn from(e: IoError) -> ReadExactError<IoError> {
        Self::Other(e)
    }
}

impl From<ReadExactError<IoError>> for IoError {
    fn from(e: ReadExactError<IoError>) -> IoError {
        match e {
            ReadExactError::UnexpectedEof => Self::UnexpectedEof {},
            ReadExactError::Other(e) => e,
        }
    }
}
