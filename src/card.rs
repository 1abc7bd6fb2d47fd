//! Code used to bring up SD cards over SPI and move 512 byte blocks

use crate::bus::{selected, SdBus};
use crate::command::{
    receive_data, send_command, transmit_data, R1Status, SdCmd, SD_HCS, SD_IF_COND_ARG,
};
use crate::errors::{
    BlockLenRejectedSnafu, BusError, CommandRejectedSnafu, InitError, IoError, NoResponseSnafu,
    OpCondTimeoutSnafu, PastEndSnafu, SizeUnknownSnafu, UnexpectedEofSnafu,
    UnknownGenerationSnafu,
};
use crate::fat32::{FormatConfig, VolumeLayout};
use crate::registers::{SdCsd, SdOcr};
use core::cmp;
use embedded_io::blocking::{Read, Seek, Write};
use embedded_io::{Io, SeekFrom};
use fugit::HertzU32;
use log::{debug, info, warn};
use snafu::prelude::*;

/// Block length for SD operations
pub const SD_BLOCK_LEN: usize = 512;

/// Clock rate used while the card is being brought up
pub const SD_CLK_INIT: HertzU32 = HertzU32::kHz(400);

/// Clock rate once the card is ready
pub const SD_CLK_FULL: HertzU32 = HertzU32::MHz(25);

/// Length of the CSD register in bytes
pub const SD_CSD_LEN: usize = 16;

/// Length of the OCR register in bytes
pub const SD_OCR_LEN: usize = 4;

/// How long the select line is held low during diagnostics, in milliseconds
pub const SD_DIAG_HOLD_MS: u32 = 100;

/// Byte echoed during the diagnostics loopback test
pub const SD_DIAG_LOOPBACK: u8 = 0x55;

/// Pattern exchanged during diagnostics
pub const SD_DIAG_PATTERN: [u8; 4] = [0xAA, 0x55, 0x00, 0xFF];

/// A single block
pub type Block = [u8; SD_BLOCK_LEN];

/// Tunables for the driver. Bounds are iteration counts, not time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdConfig {
    /// Clock rate for bring-up
    pub init_clock: HertzU32,
    /// Clock rate once the card is ready
    pub full_clock: HertzU32,
    /// Fill bytes clocked with select released before CMD0
    pub power_up_bytes: usize,
    /// Maximum ACMD41/CMD1 attempts
    pub op_cond_retries: u32,
    /// Delay between op-cond attempts, in milliseconds
    pub op_cond_delay_ms: u32,
    /// Bytes polled for the data start token
    pub token_polls: u32,
    /// Bytes polled for the card to finish programming
    pub busy_polls: u32,
    /// Geometry used by `format`
    pub format: FormatConfig,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            init_clock: SD_CLK_INIT,
            full_clock: SD_CLK_FULL,
            // 80 clocks
            power_up_bytes: 10,
            op_cond_retries: 1000,
            op_cond_delay_ms: 10,
            token_polls: 1000,
            busy_polls: 1000,
            format: FormatConfig::default(),
        }
    }
}

/// Generation of the card, decided during initialization
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    #[default]
    Unknown,
    /// Version 1 card, byte addressed
    SdV1,
    /// Version 2 standard capacity card, byte addressed
    SdV2,
    /// Version 2 high capacity card, block addressed
    Sdhc,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CardState {
    pub kind: CardKind,
    pub ready: bool,
}

/// Steps of the bring-up sequence. Failing any of them ends the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    Reset,
    VoltageCheck,
    AppInit,
    LegacyInit,
    OcrCheck,
    BlockLenSet,
    Ready,
}

/// Result of the bus self test
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticReport {
    /// Byte sent and byte received with select released
    pub loopback: (u8, u8),
    /// Whether the select line could be toggled
    pub select_toggled: bool,
    /// Sent and received pairs for the pattern, exchanged under select
    pub pattern: [(u8, u8); 4],
    /// First bus failure, the fields after it are left at their defaults
    pub error: Option<BusError>,
}

/// SD card over SPI
pub struct SdSpi<B: SdBus> {
    /// The bus the card hangs off of
    pub(crate) bus: B,
    pub(crate) config: SdConfig,
    pub(crate) state: CardState,
    /// The CSD register, if it has been read
    csd: Option<SdCsd>,
    /// The size of the sd card in blocks, 0 if unknown
    size: u32,
    /// Layout of the mounted volume
    pub(crate) volume: Option<VolumeLayout>,
}

impl<B: SdBus> SdSpi<B> {
    /// Create a new driver with the default configuration
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, SdConfig::default())
    }

    pub fn with_config(bus: B, config: SdConfig) -> Self {
        Self {
            bus,
            config,
            state: CardState::default(),
            csd: None,
            size: 0,
            volume: None,
        }
    }

    /// Initialize the SD card
    ///
    /// Forgets everything known about the previous card first. On failure
    /// the card is left not ready.
    pub fn initialize(&mut self) -> Result<CardState, InitError> {
        self.state = CardState::default();
        self.csd = None;
        self.size = 0;
        self.volume = None;

        match self.bring_up() {
            Ok(()) => {
                self.state.ready = true;
                info!("SD card ready: {:?}", self.state.kind);
                Ok(self.state)
            }
            Err(e) => {
                // Nothing learned half way is kept
                self.state = CardState::default();
                warn!("SD card initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<(), InitError> {
        self.bus.set_clock_rate(self.config.init_clock)?;

        // The card needs at least 74 clocks with select released
        self.bus.deassert_select()?;
        self.bus.exchange_block(None, None, self.config.power_up_bytes)?;

        let mut step = InitStep::Reset;

        loop {
            debug!("init step {:?}", step);

            step = match step {
                InitStep::Reset => {
                    let status = send_command(&mut self.bus, SdCmd::GoIdleState)?;

                    ensure!(
                        status == R1Status::IDLE,
                        NoResponseSnafu {
                            command: 0u8,
                            status: status.0
                        }
                    );

                    InitStep::VoltageCheck
                }
                InitStep::VoltageCheck => {
                    match send_command(&mut self.bus, SdCmd::SendIfCond(SD_IF_COND_ARG))? {
                        R1Status::IDLE => {
                            self.state.kind = CardKind::SdV2;
                            InitStep::AppInit
                        }
                        R1Status::IDLE_ILLEGAL => {
                            self.state.kind = CardKind::SdV1;
                            InitStep::LegacyInit
                        }
                        status => {
                            return UnknownGenerationSnafu { status: status.0 }.fail();
                        }
                    }
                }
                InitStep::AppInit => {
                    self.wait_op_cond(|bus| {
                        send_command(bus, SdCmd::AppCmd)?;
                        send_command(bus, SdCmd::SdAppOpCond(SD_HCS))
                    })?;

                    InitStep::OcrCheck
                }
                InitStep::LegacyInit => {
                    self.wait_op_cond(|bus| send_command(bus, SdCmd::SendOpCond))?;

                    InitStep::BlockLenSet
                }
                InitStep::OcrCheck => {
                    let status = send_command(&mut self.bus, SdCmd::ReadOcr)?;

                    // A card that won't give up its OCR stays standard capacity
                    if status == R1Status::READY {
                        let mut raw = [0u8; SD_OCR_LEN];
                        selected(&mut self.bus, |bus| {
                            bus.exchange_block(None, Some(&mut raw), SD_OCR_LEN)
                        })?;

                        let ocr = SdOcr::from_bytes(raw);
                        debug!("OCR {:#010x}", ocr.ocr);

                        // CCS only means something once power up is done
                        if !ocr.is_busy() && ocr.ccs() {
                            self.state.kind = CardKind::Sdhc;
                        }
                    }

                    InitStep::BlockLenSet
                }
                InitStep::BlockLenSet => {
                    // High capacity cards are fixed at 512
                    if self.state.kind != CardKind::Sdhc {
                        let status =
                            send_command(&mut self.bus, SdCmd::SetBlockLen(SD_BLOCK_LEN as u32))?;

                        ensure!(
                            status == R1Status::READY,
                            BlockLenRejectedSnafu { status: status.0 }
                        );
                    }

                    InitStep::Ready
                }
                InitStep::Ready => {
                    self.bus.set_clock_rate(self.config.full_clock)?;

                    return Ok(());
                }
            };
        }
    }

    /// Repeat `attempt` until the card leaves the idle state
    fn wait_op_cond<F>(&mut self, mut attempt: F) -> Result<(), InitError>
    where
        F: FnMut(&mut B) -> Result<R1Status, BusError>,
    {
        let iterations = self.config.op_cond_retries;

        for _ in 0..iterations {
            if attempt(&mut self.bus)? == R1Status::READY {
                return Ok(());
            }

            self.bus.delay_ms(self.config.op_cond_delay_ms);
        }

        OpCondTimeoutSnafu { iterations }.fail()
    }

    /// Read a single block
    ///
    /// The address goes on the wire untouched: high capacity cards take a
    /// block number, older cards a byte offset.
    pub fn read_block(&mut self, address: u32) -> Result<Block, IoError> {
        let mut block = [0u8; SD_BLOCK_LEN];
        self.read_block_into(address, &mut block)?;

        Ok(block)
    }

    /// Read a single block into `block`
    pub fn read_block_into(&mut self, address: u32, block: &mut Block) -> Result<(), IoError> {
        let command = SdCmd::ReadSingleBlock(address);
        self.command_accepted(command)?;

        let polls = self.config.token_polls;
        selected(&mut self.bus, |bus| receive_data(bus, block, polls)).map_err(|e| {
            warn!("Failed to read block {}: {}", address, e);
            e
        })
    }

    /// Write a single block, returns once the card is done programming it
    pub fn write_block(&mut self, address: u32, data: &Block) -> Result<(), IoError> {
        let command = SdCmd::WriteBlock(address);
        self.command_accepted(command)?;

        let polls = self.config.busy_polls;
        selected(&mut self.bus, |bus| transmit_data(bus, data, polls)).map_err(|e| {
            warn!("Failed to write block {}: {}", address, e);
            e
        })
    }

    /// Read the CSD register and work out the card size from it
    pub fn read_csd(&mut self) -> Result<SdCsd, IoError> {
        self.command_accepted(SdCmd::SendCsd)?;

        let mut raw = [0u8; SD_CSD_LEN];
        let polls = self.config.token_polls;
        selected(&mut self.bus, |bus| receive_data(bus, &mut raw, polls))?;

        let csd = SdCsd::new(raw);
        self.size = csd.block_count().unwrap_or(0);
        self.csd = Some(csd);

        info!("SD card size: {} blocks", self.size);

        Ok(csd)
    }

    fn command_accepted(&mut self, command: SdCmd) -> Result<(), IoError> {
        let status = send_command(&mut self.bus, command)?;

        if status != R1Status::READY {
            warn!(
                "CMD{} rejected: idle {} illegal {} address {} parameter {}",
                command.get_cmd_index(),
                status.idle(),
                status.illegal_command(),
                status.address_error(),
                status.parameter_error()
            );

            return CommandRejectedSnafu {
                command: command.get_cmd_index(),
                status: status.0,
            }
            .fail();
        }

        Ok(())
    }

    /// Exercise the bus without talking to the card. Informational only.
    pub fn diagnostics(&mut self) -> DiagnosticReport {
        let mut report = DiagnosticReport::default();

        if let Err(e) = self.run_diagnostics(&mut report) {
            warn!("Bus self test failed: {}", e);
            report.error = Some(e);
        }

        report
    }

    fn run_diagnostics(&mut self, report: &mut DiagnosticReport) -> Result<(), BusError> {
        let echoed = self.bus.exchange_byte(SD_DIAG_LOOPBACK)?;
        report.loopback = (SD_DIAG_LOOPBACK, echoed);
        debug!("loopback sent {:#04x} got {:#04x}", SD_DIAG_LOOPBACK, echoed);

        self.bus.assert_select()?;
        self.bus.delay_ms(SD_DIAG_HOLD_MS);
        self.bus.deassert_select()?;
        report.select_toggled = true;

        selected(&mut self.bus, |bus| {
            for (i, out) in SD_DIAG_PATTERN.iter().enumerate() {
                report.pattern[i] = (*out, bus.exchange_byte(*out)?);
            }

            Ok::<(), BusError>(())
        })
    }

    /// Generation and readiness of the card
    pub fn card_state(&self) -> CardState {
        self.state
    }

    pub fn card_kind(&self) -> CardKind {
        self.state.kind
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready
    }

    /// The CSD, if `read_csd` has succeeded since the last initialization
    pub fn csd(&self) -> Option<SdCsd> {
        self.csd
    }

    /// Size of the card in blocks, 0 until the CSD has been read
    pub fn card_size(&self) -> u32 {
        self.size
    }

    /// True once a boot sector has been parsed successfully
    pub fn is_mounted(&self) -> bool {
        self.volume.is_some()
    }

    /// Layout of the mounted volume
    pub fn layout(&self) -> Option<&VolumeLayout> {
        self.volume.as_ref()
    }

    /// Bytes per sector of the mounted volume, 0 if nothing is mounted
    pub fn bytes_per_sector(&self) -> u32 {
        self.volume.map_or(0, |v| v.bytes_per_sector as u32)
    }

    /// Sectors per cluster of the mounted volume, 0 if nothing is mounted
    pub fn sectors_per_cluster(&self) -> u32 {
        self.volume.map_or(0, |v| v.sectors_per_cluster as u32)
    }

    pub fn config(&self) -> &SdConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Give the bus back
    pub fn release(self) -> B {
        self.bus
    }

    /// Byte stream view of the card
    pub fn cursor(&mut self) -> SdCursor<'_, B> {
        SdCursor::new(self)
    }
}

/// Byte addressed reader/writer on top of the block interface
///
/// Keeps one working block. Writes land in the working block and reach the
/// card when another block is needed or on `flush`, so flush before
/// dropping. Block numbers are used as addresses, the same convention as
/// the volume layer.
pub struct SdCursor<'a, B: SdBus> {
    card: &'a mut SdSpi<B>,
    /// The current working block
    working_block: Block,
    /// The number of the working block, None until one is loaded
    working_block_num: Option<u32>,
    /// True if the working block has unwritten changes
    dirty: bool,
    /// The current read/write position
    position: u64,
}

impl<'a, B: SdBus> SdCursor<'a, B> {
    pub fn new(card: &'a mut SdSpi<B>) -> Self {
        Self {
            card,
            working_block: [0; SD_BLOCK_LEN],
            working_block_num: None,
            dirty: false,
            position: 0,
        }
    }

    /// The current read/write position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True once the position is at or past the end of a card of known size
    fn at_end(&self) -> bool {
        let size = self.card.card_size() as u64;
        size > 0 && self.position / (SD_BLOCK_LEN as u64) >= size
    }

    /// Make sure the block under the position is the working block
    fn load(&mut self) -> Result<(), IoError> {
        let position = self.position;
        ensure!(!self.at_end(), PastEndSnafu { position });

        let current_block_num = u32::try_from(position / (SD_BLOCK_LEN as u64))
            .ok()
            .context(PastEndSnafu { position })?;

        if self.working_block_num != Some(current_block_num) {
            self.flush()?;

            self.card.read_block_into(current_block_num, &mut self.working_block)?;
            self.working_block_num = Some(current_block_num);
        }

        Ok(())
    }

    fn offset(&self) -> usize {
        (self.position % (SD_BLOCK_LEN as u64)) as usize
    }
}

impl<B: SdBus> Io for SdCursor<'_, B> {
    type Error = IoError;
}

impl<B: SdBus> Read for SdCursor<'_, B> {
    /// Reads at most up to the end of the current block, nothing once the
    /// end of the card is reached
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, IoError> {
        if buffer.is_empty() || self.at_end() {
            return Ok(0);
        }

        self.load()?;

        let offset = self.offset();
        let len = cmp::min(buffer.len(), SD_BLOCK_LEN - offset);
        buffer[..len].copy_from_slice(&self.working_block[offset..offset + len]);
        self.position += len as u64;

        Ok(len)
    }
}

impl<B: SdBus> Write for SdCursor<'_, B> {
    /// Writes at most up to the end of the current block
    fn write(&mut self, buffer: &[u8]) -> Result<usize, IoError> {
        if buffer.is_empty() {
            return Ok(0);
        }

        self.load()?;

        let offset = self.offset();
        let len = cmp::min(buffer.len(), SD_BLOCK_LEN - offset);
        self.working_block[offset..offset + len].copy_from_slice(&buffer[..len]);
        self.dirty = true;
        self.position += len as u64;

        Ok(len)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        if let (true, Some(block_num)) = (self.dirty, self.working_block_num) {
            self.card.write_block(block_num, &self.working_block)?;
            self.dirty = false;
        }

        Ok(())
    }
}

impl<B: SdBus> Seek for SdCursor<'_, B> {
    fn seek(&mut self, position: SeekFrom) -> Result<u64, IoError> {
        let target = match position {
            SeekFrom::Start(position) => Some(position),
            SeekFrom::End(delta) => {
                let size = self.card.card_size() as u64 * SD_BLOCK_LEN as u64;
                ensure!(size > 0, SizeUnknownSnafu);
                size.checked_add_signed(delta)
            }
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        self.position = target.context(UnexpectedEofSnafu)?;

        Ok(self.position)
    }
}
