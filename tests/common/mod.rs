// Simulated SD card speaking SPI mode, byte by byte
#![allow(dead_code)]

use fugit::HertzU32;
use rp_sdspi::{BusError, SdBus};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Answers CMD8 with illegal command
    V1,
    /// Standard capacity version 2
    V2,
    /// High capacity version 2
    Sdhc,
    /// Never drives the line
    Silent,
    /// Answers CMD8 with something nobody expects
    Confused,
}

#[derive(Debug)]
enum Rx {
    Command,
    WriteToken { address: u32 },
    WriteData { address: u32, data: Vec<u8> },
}

pub struct SimCard {
    pub kind: SimKind,
    /// ACMD41/CMD1 attempts answered with idle before the card is ready
    pub op_cond_busy: u32,
    /// Answer CMD58 with an error
    pub ocr_fails: bool,
    pub reject_block_len: bool,
    /// Fill bytes before the data token on reads
    pub token_delay: usize,
    /// Never send a data token
    pub withhold_token: bool,
    /// Bytes the card stays busy after a write
    pub write_busy: usize,
    /// Refuse the data of writes to this address
    pub reject_write_at: Option<u32>,
    pub csd: [u8; 16],
    pub blocks: HashMap<u32, [u8; 512]>,

    pub selected: bool,
    pub selects: usize,
    pub commands: Vec<(u8, u32)>,
    pub clock_rates: Vec<u32>,
    pub delay_ms_total: u64,
    /// Bytes clocked while select was released
    pub idle_bytes: usize,

    initialized: bool,
    app_cmd: bool,
    attempts: u32,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    rx: Rx,
}

impl SimCard {
    pub fn new(kind: SimKind) -> Self {
        Self {
            kind,
            op_cond_busy: 3,
            ocr_fails: false,
            reject_block_len: false,
            token_delay: 4,
            withhold_token: false,
            write_busy: 10,
            reject_write_at: None,
            csd: [0; 16],
            blocks: HashMap::new(),
            selected: false,
            selects: 0,
            commands: Vec::new(),
            clock_rates: Vec::new(),
            delay_ms_total: 0,
            idle_bytes: 0,
            initialized: false,
            app_cmd: false,
            attempts: 0,
            out: VecDeque::new(),
            frame: Vec::new(),
            rx: Rx::Command,
        }
    }

    /// Indices of every command received, in order
    pub fn command_indices(&self) -> Vec<u8> {
        self.commands.iter().map(|(index, _)| *index).collect()
    }

    pub fn block(&self, address: u32) -> [u8; 512] {
        self.blocks.get(&address).copied().unwrap_or([0; 512])
    }

    fn status(&self) -> u8 {
        if self.initialized { 0x00 } else { 0x01 }
    }

    fn op_cond(&mut self) -> u8 {
        self.attempts += 1;
        if self.attempts > self.op_cond_busy {
            self.initialized = true;
        }
        self.status()
    }

    fn respond(&mut self, status: u8, extra: &[u8]) {
        // One byte of Ncr before the status
        self.out.push_back(0xFF);
        self.out.push_back(status);
        self.out.extend(extra.iter().copied());
    }

    fn handle_command(&mut self, index: u8, argument: u32) {
        self.commands.push((index, argument));
        self.out.clear();

        if self.kind == SimKind::Silent {
            return;
        }

        let app_cmd = std::mem::take(&mut self.app_cmd);

        match index {
            0 => {
                self.initialized = false;
                self.attempts = 0;
                self.respond(0x01, &[]);
            }
            8 => match self.kind {
                SimKind::V1 => self.respond(0x05, &[]),
                SimKind::Confused => self.respond(0x09, &[]),
                _ => {
                    let arg = argument.to_be_bytes();
                    self.respond(0x01, &[0x00, 0x00, arg[2], arg[3]]);
                }
            },
            55 => {
                self.app_cmd = true;
                let status = self.status();
                self.respond(status, &[]);
            }
            41 if app_cmd && self.kind != SimKind::V1 => {
                let status = self.op_cond();
                self.respond(status, &[]);
            }
            1 => {
                let status = self.op_cond();
                self.respond(status, &[]);
            }
            58 => {
                if self.ocr_fails {
                    self.respond(0x04, &[]);
                } else {
                    let top = if self.kind == SimKind::Sdhc { 0xC0 } else { 0x80 };
                    let status = self.status();
                    self.respond(status, &[top, 0xFF, 0x80, 0x00]);
                }
            }
            16 => {
                let status = if self.reject_block_len { 0x40 } else { self.status() };
                self.respond(status, &[]);
            }
            9 | 17 if self.initialized => {
                let mut data = vec![0xFF; self.token_delay];
                if !self.withhold_token {
                    data.push(0xFE);
                    if index == 9 {
                        data.extend_from_slice(&self.csd);
                    } else {
                        data.extend_from_slice(&self.block(argument));
                    }
                    data.extend_from_slice(&[0xAB, 0xCD]);
                }
                self.respond(0x00, &data);
            }
            24 if self.initialized => {
                self.rx = Rx::WriteToken { address: argument };
                self.respond(0x00, &[]);
            }
            9 | 17 | 24 => self.respond(0x01, &[]),
            _ => self.respond(0x05, &[]),
        }
    }

    fn receive(&mut self, byte: u8) {
        match &mut self.rx {
            Rx::Command => {
                if self.frame.is_empty() && (byte & 0xC0) != 0x40 {
                    return;
                }

                self.frame.push(byte);

                if self.frame.len() == 6 {
                    let frame = std::mem::take(&mut self.frame);
                    let argument = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
                    self.handle_command(frame[0] & 0x3F, argument);
                }
            }
            Rx::WriteToken { address } => {
                if byte == 0xFE {
                    self.rx = Rx::WriteData {
                        address: *address,
                        data: Vec::new(),
                    };
                }
            }
            Rx::WriteData { address, data } => {
                data.push(byte);

                // Payload plus CRC
                if data.len() == 512 + 2 {
                    let address = *address;
                    let mut block = [0u8; 512];
                    block.copy_from_slice(&data[..512]);
                    self.rx = Rx::Command;

                    if self.reject_write_at == Some(address) {
                        self.out.push_back(0x0B);
                    } else {
                        self.blocks.insert(address, block);
                        self.out.push_back(0xE5);
                        self.out.extend(std::iter::repeat(0x00).take(self.write_busy));
                    }
                }
            }
        }
    }
}

impl SdBus for SimCard {
    fn assert_select(&mut self) -> Result<(), BusError> {
        assert!(!self.selected, "select asserted twice");
        self.selected = true;
        self.selects += 1;
        Ok(())
    }

    fn deassert_select(&mut self) -> Result<(), BusError> {
        self.selected = false;
        self.frame.clear();
        Ok(())
    }

    fn exchange_byte(&mut self, out: u8) -> Result<u8, BusError> {
        if !self.selected {
            self.idle_bytes += 1;
            return Ok(0xFF);
        }

        let reply = self.out.pop_front().unwrap_or(0xFF);
        self.receive(out);

        Ok(reply)
    }

    fn exchange_block(
        &mut self,
        output: Option<&[u8]>,
        mut input: Option<&mut [u8]>,
        len: usize,
    ) -> Result<(), BusError> {
        for i in 0..len {
            let out = output.map_or(0xFF, |o| o[i]);
            let reply = self.exchange_byte(out)?;

            if let Some(input) = input.as_deref_mut() {
                input[i] = reply;
            }
        }

        Ok(())
    }

    fn set_clock_rate(&mut self, rate: HertzU32) -> Result<(), BusError> {
        self.clock_rates.push(rate.to_Hz());
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay_ms_total += ms as u64;
    }
}

/// Deterministic payloads for round trip tests
pub struct XorShift(pub u32);

impl XorShift {
    pub fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    pub fn block(&mut self) -> [u8; 512] {
        let mut block = [0u8; 512];
        for chunk in block.chunks_mut(4) {
            chunk.copy_from_slice(&self.next().to_le_bytes());
        }
        block
    }
}
