//! Sharing one card between contexts

use crate::bus::SdBus;
use crate::card::SdSpi;
use core::cell::RefCell;
use critical_section::Mutex;

/// A card behind a single lock
///
/// Whole operations run inside one critical section, a half sent command
/// can't be interleaved with another one.
///
/// On single core targets the critical section masks interrupts for as long
/// as the closure runs. Keep it to block sized work: `initialize` can spend
/// up to `op_cond_retries * op_cond_delay_ms` (10 s by default) waiting on
/// the card, so bring the card up before sharing it.
pub struct SharedCard<B: SdBus> {
    card: Mutex<RefCell<SdSpi<B>>>,
}

impl<B: SdBus> SharedCard<B> {
    pub const fn new(card: SdSpi<B>) -> Self {
        Self {
            card: Mutex::new(RefCell::new(card)),
        }
    }

    /// Run `f` with exclusive access to the card
    pub fn with<R>(&self, f: impl FnOnce(&mut SdSpi<B>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.card.borrow(cs).borrow_mut()))
    }

    pub fn into_inner(self) -> SdSpi<B> {
        self.card.into_inner().into_inner()
    }
}
