//! Crate used to interface with SD cards over SPI, plus just enough FAT32
//! to mount and format them
//!
//! *currently in the alpha phase: works but missing important features and
//! is poorly optimised. future updates guarentee breaking changes.*
//!
//! ```ignore
//! let bus = SpiBus::with_clock(spi, cs, delay, clock);
//! let mut card = SdSpi::new(bus);
//!
//! card.initialize()?;
//! let layout = card.parse_boot_sector()?;
//! let block = card.read_block(layout.root_dir_sector)?;
//! ```

#![cfg_attr(not(test), no_std)]

pub mod bus;
pub mod card;
pub mod command;
pub mod errors;
pub mod fat32;
pub mod registers;
pub mod shared;

pub use bus::{ClockControl, FixedClock, SdBus, SpiBus};
pub use card::{CardKind, CardState, DiagnosticReport, SdConfig, SdCursor, SdSpi};
pub use errors::{BusError, FormatError, InitError, IoError, LayoutError};
pub use fat32::{BootSector, FormatConfig, VolumeLayout};
pub use shared::SharedCard;
