//! Recording register bus used by unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bus::RegisterBus;
use crate::error::{Error, Result};
use crate::transport::{RmiTransport, TransportConfig, PAGE_SELECT_REGISTER};

#[derive(Default)]
struct State {
    page: u8,
    memory: HashMap<u16, u8>,
    packets: HashMap<u16, Vec<u8>>,
    pinned: HashMap<u16, Vec<u8>>,
    fail_next: u32,
    page_selects: Vec<u8>,
    writes: Vec<(u16, Vec<u8>)>,
    reads: Vec<(u16, usize)>,
}

/// Flat 64 KiB register space with optional packet registers
///
/// A packet register answers every read at its address with its own
/// content regardless of what follows it in the flat space.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<State>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> RmiTransport {
        RmiTransport::with_config(
            self.clone(),
            TransportConfig::default().with_retry_delay(std::time::Duration::ZERO),
        )
    }

    pub fn poke(&self, addr: u16, data: &[u8]) {
        let mut s = self.state.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            s.memory.insert(addr.wrapping_add(i as u16), *b);
        }
    }

    pub fn packet(&self, addr: u16, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .packets
            .insert(addr, data.to_vec());
    }

    /// Register whose reads ignore writes, like a self-clearing command
    pub fn pin(&self, addr: u16, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .pinned
            .insert(addr, data.to_vec());
    }

    pub fn peek(&self, addr: u16) -> u8 {
        let s = self.state.lock().unwrap();
        s.memory.get(&addr).copied().unwrap_or(0)
    }

    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub fn page_selects(&self) -> Vec<u8> {
        self.state.lock().unwrap().page_selects.clone()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn reads(&self) -> Vec<(u16, usize)> {
        self.state.lock().unwrap().reads.clone()
    }

    pub fn clear_log(&self) {
        let mut s = self.state.lock().unwrap();
        s.writes.clear();
        s.reads.clear();
    }
}

impl RegisterBus for MockBus {
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return Err(Error::Transfer);
        }
        let addr = ((s.page as u16) << 8) | reg as u16;
        s.reads.push((addr, buf.len()));
        if let Some(packet) = s.pinned.get(&addr).or_else(|| s.packets.get(&addr)) {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = packet.get(i).copied().unwrap_or(0);
            }
            return Ok(());
        }
        for (i, b) in buf.iter_mut().enumerate() {
            *b = s
                .memory
                .get(&addr.wrapping_add(i as u16))
                .copied()
                .unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return Err(Error::Transfer);
        }
        if reg == PAGE_SELECT_REGISTER {
            s.page = data[0];
            s.page_selects.push(data[0]);
            return Ok(());
        }
        let addr = ((s.page as u16) << 8) | reg as u16;
        s.writes.push((addr, data.to_vec()));
        if s.pinned.contains_key(&addr) {
            return Ok(());
        }
        if s.packets.contains_key(&addr) {
            s.packets.insert(addr, data.to_vec());
            return Ok(());
        }
        for (i, b) in data.iter().enumerate() {
            s.memory.insert(addr.wrapping_add(i as u16), *b);
        }
        Ok(())
    }
}
