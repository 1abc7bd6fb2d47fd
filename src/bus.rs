//! Byte-level transport between the host and the card

use crate::errors::{BusError, ChipSelectSnafu, SpiSnafu};
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use fugit::HertzU32;
use snafu::prelude::*;

/// Byte sent whenever the host only wants to clock data in
pub const SD_FILL_BYTE: u8 = 0xFF;

/// Time the select line is given to settle on each edge, in microseconds
pub const SD_SELECT_SETTLE_US: u32 = 1;

/// Synchronous full-duplex transport to a single card
///
/// Every call blocks until the bus lines have been driven. Nothing is
/// buffered or queued.
pub trait SdBus {
    /// Pull the chip select line low
    fn assert_select(&mut self) -> Result<(), BusError>;
    /// Release the chip select line
    fn deassert_select(&mut self) -> Result<(), BusError>;
    /// Clock one byte out and return the byte clocked in at the same time
    fn exchange_byte(&mut self, out: u8) -> Result<u8, BusError>;
    /// Exchange `len` bytes. When `output` is `None` fill bytes are sent,
    /// when `input` is `None` the incoming side is dropped.
    fn exchange_block(
        &mut self,
        output: Option<&[u8]>,
        input: Option<&mut [u8]>,
        len: usize,
    ) -> Result<(), BusError>;
    /// Change the serial clock rate
    fn set_clock_rate(&mut self, rate: HertzU32) -> Result<(), BusError>;
    /// Block for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32);
}

/// Run `f` with select asserted and release it afterwards, whether or not
/// `f` succeeded. The first error wins.
pub fn selected<B, T, E, F>(bus: &mut B, f: F) -> Result<T, E>
where
    B: SdBus + ?Sized,
    E: From<BusError>,
    F: FnOnce(&mut B) -> Result<T, E>,
{
    bus.assert_select()?;
    let result = f(bus);
    let released = bus.deassert_select();

    let value = result?;
    released?;

    Ok(value)
}

/// Something able to retune the SPI peripheral's clock
pub trait ClockControl {
    fn set_rate(&mut self, rate: HertzU32);
}

/// Clock control for peripherals that run at a single rate
pub struct FixedClock;

impl ClockControl for FixedClock {
    fn set_rate(&mut self, _rate: HertzU32) {}
}

/// `SdBus` built out of embedded-hal blocking SPI, an output pin and a delay
pub struct SpiBus<SPI, CS, D, C = FixedClock> {
    spi: SPI,
    cs: CS,
    delay: D,
    clock: C,
    /// Last rate handed to the clock control
    rate: Option<HertzU32>,
}

impl<SPI, CS, D> SpiBus<SPI, CS, D, FixedClock> {
    /// Create a bus whose clock never changes
    pub fn new(spi: SPI, cs: CS, delay: D) -> Self {
        Self::with_clock(spi, cs, delay, FixedClock)
    }
}

impl<SPI, CS, D, C> SpiBus<SPI, CS, D, C> {
    /// Create a bus that forwards rate changes to `clock`
    pub fn with_clock(spi: SPI, cs: CS, delay: D, clock: C) -> Self {
        Self {
            spi,
            cs,
            delay,
            clock,
            rate: None,
        }
    }

    /// The last clock rate requested by the driver, if any
    pub fn clock_rate(&self) -> Option<HertzU32> {
        self.rate
    }

    /// Give the peripherals back
    pub fn release(self) -> (SPI, CS, D, C) {
        (self.spi, self.cs, self.delay, self.clock)
    }
}

impl<SPI, CS, D, C> SdBus for SpiBus<SPI, CS, D, C>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    D: DelayUs<u32> + DelayMs<u32>,
    C: ClockControl,
{
    fn assert_select(&mut self) -> Result<(), BusError> {
        self.cs.set_low().ok().context(ChipSelectSnafu)?;
        self.delay.delay_us(SD_SELECT_SETTLE_US);
        Ok(())
    }

    fn deassert_select(&mut self) -> Result<(), BusError> {
        self.delay.delay_us(SD_SELECT_SETTLE_US);
        self.cs.set_high().ok().context(ChipSelectSnafu)?;
        Ok(())
    }

    fn exchange_byte(&mut self, out: u8) -> Result<u8, BusError> {
        let mut word = [out];
        let read = self.spi.transfer(&mut word).ok().context(SpiSnafu)?;

        Ok(read[0])
    }

    fn exchange_block(
        &mut self,
        output: Option<&[u8]>,
        mut input: Option<&mut [u8]>,
        len: usize,
    ) -> Result<(), BusError> {
        // Go in chunks so we never need an allocation
        let mut chunk = [SD_FILL_BYTE; 64];
        let mut done = 0;

        while done < len {
            let n = core::cmp::min(chunk.len(), len - done);

            match output {
                Some(out) => chunk[..n].copy_from_slice(&out[done..done + n]),
                None => chunk[..n].fill(SD_FILL_BYTE),
            }

            let read = self.spi.transfer(&mut chunk[..n]).ok().context(SpiSnafu)?;

            if let Some(input) = input.as_deref_mut() {
                input[done..done + n].copy_from_slice(&read[..n]);
            }

            done += n;
        }

        Ok(())
    }

    fn set_clock_rate(&mut self, rate: HertzU32) -> Result<(), BusError> {
        self.clock.set_rate(rate);
        self.rate = Some(rate);
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }
}
