//! In-memory register backends for unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use genlock_if::{
    mmio::RegisterAccess,
    timer::{Scheduler, TimerId, TimerPayload},
};

use crate::msgbus::{
    C20_RD_ADDRESS_H, C20_RD_ADDRESS_L, C20_RD_DATA_H, C20_RD_DATA_L, C20_WR_ADDRESS_H,
    C20_WR_ADDRESS_L, C20_WR_DATA_H, C20_WR_DATA_L, ctl_reg, status_reg,
};

type WriteHook = Box<dyn FnMut(u32, u32) + Send>;

#[derive(Default)]
struct FileState {
    regs: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    on_write: Option<WriteHook>,
}

/// Flat register file. Unwritten registers read as zero.
#[derive(Default)]
pub struct RegisterFile {
    state: Mutex<FileState>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets a register without logging a write.
    pub fn poke(&self, offset: u32, value: u32) {
        self.state().regs.insert(offset, value);
    }

    pub fn peek(&self, offset: u32) -> u32 {
        self.state().regs.get(&offset).copied().unwrap_or(0)
    }

    /// Every write issued through [`RegisterAccess`], in order.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state().writes.clone()
    }

    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.state()
            .writes
            .iter()
            .filter(|(reg, _)| *reg == offset)
            .map(|(_, val)| *val)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Runs `hook` after every write.
    pub fn set_on_write(&self, hook: impl FnMut(u32, u32) + Send + 'static) {
        self.state().on_write = Some(Box::new(hook));
    }
}

impl RegisterAccess for RegisterFile {
    fn read32(&self, offset: u32) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state();
        state.regs.insert(offset, value);
        state.writes.push((offset, value));
        if let Some(hook) = state.on_write.as_mut() {
            hook(offset, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    Read,
    WriteUncommitted,
    WriteCommitted,
}

/// One message-bus transaction seen by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub port: u32,
    pub lane: u8,
    pub kind: TxKind,
    pub addr: u16,
    pub data: u8,
    pub ok: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct SramLatch {
    wr_addr: u16,
    wr_data_high: u8,
    rd_addr: u16,
}

#[derive(Default)]
struct SimState {
    mmio: HashMap<u32, u32>,
    phy: HashMap<(u32, u8, u16), u8>,
    sram: HashMap<(u32, u16), u16>,
    latches: HashMap<u32, SramLatch>,
    fail_acks: usize,
    swap_acks: usize,
    stuck: bool,
    resets: usize,
    log: Vec<Transaction>,
}

enum Target {
    Ctl(u32, u8),
    Status(u32, u8),
}

const PENDING: u32 = 1 << 31;
const RESET: u32 = 1 << 15;
const READY: u32 = 1 << 31;
const ERROR: u32 = 1 << 15;
const READ_ACK: u32 = 4 << 27;
const WRITE_ACK: u32 = 5 << 27;

/// Emulates the Cx0 message bus of every port, plus C20 SRAM behind its
/// indirect address/data registers. Other MMIO offsets behave like a plain
/// register file.
#[derive(Default)]
pub struct Cx0Sim {
    state: Mutex<SimState>,
}

impl Cx0Sim {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decode(offset: u32) -> Option<Target> {
        (0..8u32).find_map(|port| {
            (0..2u8).find_map(|lane| {
                if offset == ctl_reg(port, lane) {
                    Some(Target::Ctl(port, lane))
                } else if offset == status_reg(port, lane) {
                    Some(Target::Status(port, lane))
                } else {
                    None
                }
            })
        })
    }

    pub fn set_phy(&self, port: u32, lane: u8, addr: u16, val: u8) {
        self.state().phy.insert((port, lane, addr), val);
    }

    pub fn phy(&self, port: u32, lane: u8, addr: u16) -> u8 {
        self.state()
            .phy
            .get(&(port, lane, addr))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_sram(&self, port: u32, addr: u16, val: u16) {
        self.state().sram.insert((port, addr), val);
    }

    pub fn sram(&self, port: u32, addr: u16) -> u16 {
        self.state().sram.get(&(port, addr)).copied().unwrap_or(0)
    }

    pub fn status(&self, port: u32, lane: u8) -> u32 {
        self.state()
            .mmio
            .get(&status_reg(port, lane))
            .copied()
            .unwrap_or(0)
    }

    /// The next `n` transactions are answered with the error bit set.
    pub fn fail_next_acks(&self, n: usize) {
        self.state().fail_acks = n;
    }

    /// The next `n` acknowledged transactions get the wrong response type.
    pub fn swap_next_acks(&self, n: usize) {
        self.state().swap_acks = n;
    }

    /// Leaves every request pending forever.
    pub fn set_stuck(&self, stuck: bool) {
        self.state().stuck = stuck;
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().log.clone()
    }

    /// Successful writes, in order.
    pub fn committed_writes(&self) -> Vec<Transaction> {
        self.state()
            .log
            .iter()
            .filter(|tx| tx.ok && tx.kind != TxKind::Read)
            .copied()
            .collect()
    }

    pub fn attempts(&self, kind: TxKind, addr: u16) -> usize {
        self.state()
            .log
            .iter()
            .filter(|tx| tx.kind == kind && tx.addr == addr)
            .count()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }
}

impl SimState {
    fn phy_read(&mut self, port: u32, lane: u8, addr: u16) -> u8 {
        let latch = self.latches.entry(port).or_default();
        match addr {
            C20_RD_DATA_H => {
                let addr = latch.rd_addr;
                (self.sram.get(&(port, addr)).copied().unwrap_or(0) >> 8) as u8
            }
            C20_RD_DATA_L => {
                let addr = latch.rd_addr;
                self.sram.get(&(port, addr)).copied().unwrap_or(0) as u8
            }
            _ => self.phy.get(&(port, lane, addr)).copied().unwrap_or(0),
        }
    }

    fn phy_write(&mut self, port: u32, lane: u8, addr: u16, data: u8) {
        let latch = self.latches.entry(port).or_default();
        match addr {
            C20_WR_ADDRESS_H => latch.wr_addr = (latch.wr_addr & 0x00FF) | (data as u16) << 8,
            C20_WR_ADDRESS_L => latch.wr_addr = (latch.wr_addr & 0xFF00) | data as u16,
            C20_WR_DATA_H => latch.wr_data_high = data,
            C20_WR_DATA_L => {
                let word = (latch.wr_data_high as u16) << 8 | data as u16;
                let addr = latch.wr_addr;
                self.sram.insert((port, addr), word);
            }
            C20_RD_ADDRESS_H => latch.rd_addr = (latch.rd_addr & 0x00FF) | (data as u16) << 8,
            C20_RD_ADDRESS_L => latch.rd_addr = (latch.rd_addr & 0xFF00) | data as u16,
            _ => {}
        }
        self.phy.insert((port, lane, addr), data);
    }

    fn transact(&mut self, port: u32, lane: u8, ctl: u32) {
        let kind = match (ctl >> 27) & 0xF {
            1 => TxKind::WriteUncommitted,
            2 => TxKind::WriteCommitted,
            3 => TxKind::Read,
            _ => return,
        };
        let addr = (ctl & 0xFFF) as u16;
        let data = ((ctl >> 16) & 0xFF) as u8;
        let status = status_reg(port, lane);

        let fail = self.fail_acks > 0;
        let swap = !fail && kind != TxKind::WriteUncommitted && self.swap_acks > 0;
        if fail {
            self.fail_acks -= 1;
        } else if swap {
            self.swap_acks -= 1;
        }

        let response = match kind {
            _ if fail => READY | ERROR,
            TxKind::Read if swap => READY | WRITE_ACK,
            TxKind::Read => READY | READ_ACK | (self.phy_read(port, lane, addr) as u32) << 16,
            TxKind::WriteCommitted if swap => {
                self.phy_write(port, lane, addr, data);
                READY | READ_ACK
            }
            TxKind::WriteCommitted => {
                self.phy_write(port, lane, addr, data);
                READY | WRITE_ACK
            }
            TxKind::WriteUncommitted => {
                self.phy_write(port, lane, addr, data);
                0
            }
        };

        self.mmio.insert(status, response);
        self.mmio.insert(ctl_reg(port, lane), ctl & !PENDING);
        self.log.push(Transaction {
            port,
            lane,
            kind,
            addr,
            data,
            ok: !fail && !swap,
        });
    }
}

impl RegisterAccess for Cx0Sim {
    fn read32(&self, offset: u32) -> u32 {
        self.state().mmio.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state();
        match Self::decode(offset) {
            Some(Target::Ctl(port, lane)) => {
                if state.stuck {
                    state.mmio.insert(offset, value);
                } else if value & RESET != 0 {
                    state.resets += 1;
                    state.mmio.insert(offset, 0);
                } else if value & PENDING != 0 {
                    state.transact(port, lane, value);
                } else {
                    state.mmio.insert(offset, value);
                }
            }
            Some(Target::Status(..)) => {
                let old = state.mmio.get(&offset).copied().unwrap_or(0);
                state.mmio.insert(offset, old & !value);
            }
            None => {
                state.mmio.insert(offset, value);
            }
        }
    }
}

/// Scheduler whose timers only fire when the test says so.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    armed: Mutex<BTreeMap<TimerId, (u64, TimerPayload)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn armed_map(&self) -> MutexGuard<'_, BTreeMap<TimerId, (u64, TimerPayload)>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pending timers with their durations.
    pub fn armed(&self) -> Vec<(TimerId, u64)> {
        self.armed_map()
            .iter()
            .map(|(id, (ms, _))| (*id, *ms))
            .collect()
    }

    /// Removes a timer as if it had expired, without running it yet.
    pub fn take(&self, id: TimerId) -> Option<TimerPayload> {
        self.armed_map().remove(&id).map(|(_, payload)| payload)
    }

    /// Runs every pending payload. Returns how many ran.
    pub fn fire_all(&self) -> usize {
        let due = core::mem::take(&mut *self.armed_map());
        let count = due.len();
        for (_, (_, payload)) in due {
            payload();
        }
        count
    }
}

impl Scheduler for ManualScheduler {
    fn arm_timer(&self, duration_ms: u64, payload: TimerPayload) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.armed_map().insert(id, (duration_ms, payload));
        id
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        self.armed_map().remove(&id).is_some()
    }
}
