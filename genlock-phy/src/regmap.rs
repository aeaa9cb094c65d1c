use core::{ptr::NonNull, time::Duration};
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use genlock_if::mmio::RegisterAccess;

/// Shared handle to the register aperture.
#[derive(Clone)]
pub struct Regmap(Arc<dyn RegisterAccess>);

impl Regmap {
    pub fn new(access: impl RegisterAccess + 'static) -> Self {
        Self(Arc::new(access))
    }

    pub fn from_arc(access: Arc<dyn RegisterAccess>) -> Self {
        Self(access)
    }

    pub fn read(&self, offset: u32) -> u32 {
        let val = self.0.read32(offset);
        trace!("Read: reg {offset:#x} = {val:#x}");
        val
    }

    pub fn write(&self, offset: u32, val: u32) {
        trace!("Write: reg {offset:#x} <- {val:#x}");
        self.0.write32(offset, val);
    }

    /// Clears `clear`, sets `set`, and returns the previous value.
    pub fn update_bits(&self, offset: u32, clear: u32, set: u32) -> u32 {
        let old = self.read(offset);
        let new = (old & !clear) | set;
        self.write(offset, new);
        old
    }

    /// Polls until `reg & mask == value`.
    ///
    /// Returns the matching value, or the last value read once `timeout` has
    /// elapsed. The register is always sampled at least once.
    pub fn wait_for_register(
        &self,
        offset: u32,
        mask: u32,
        value: u32,
        timeout: Duration,
    ) -> core::result::Result<u32, u32> {
        let start = Instant::now();
        loop {
            let val = self.read(offset);
            if val & mask == value {
                return Ok(val);
            }
            if start.elapsed() >= timeout {
                debug!("Wait: reg {offset:#x} mask {mask:#x} value {value:#x} timed out at {val:#x}");
                return Err(val);
            }
            core::hint::spin_loop();
        }
    }

    pub fn wait_for_clear(
        &self,
        offset: u32,
        mask: u32,
        timeout: Duration,
    ) -> core::result::Result<u32, u32> {
        self.wait_for_register(offset, mask, 0, timeout)
    }
}

impl core::fmt::Debug for Regmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Regmap").finish_non_exhaustive()
    }
}

/// Volatile access to a mapped register BAR.
///
/// Steady-state accesses take no lock. [`MmioRegion::close`] serializes with
/// other closers and marks the region dead; later accesses read zero and drop
/// writes.
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
    live: AtomicBool,
    teardown: Mutex<()>,
}

unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `len` bytes that stays valid
    /// until [`MmioRegion::close`] returns or the region is dropped.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        debug!("MMIO region @{:p}, {len:#x} bytes", base.as_ptr());
        Self {
            base,
            len,
            live: AtomicBool::new(true),
            teardown: Mutex::new(()),
        }
    }

    /// Stops all further hardware access. The caller may unmap afterwards.
    pub fn close(&self) {
        let _guard = self.teardown.lock().unwrap_or_else(PoisonError::into_inner);
        if self.live.swap(false, Ordering::SeqCst) {
            info!("MMIO region @{:p} closed", self.base.as_ptr());
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn reg_ptr(&self, offset: u32) -> Option<*mut u32> {
        let offset = offset as usize;
        if !self.is_live() || offset % 4 != 0 || offset.checked_add(4)? > self.len {
            error!("MMIO access to {offset:#x} outside of live region ({:#x} bytes)", self.len);
            return None;
        }
        Some(unsafe { self.base.as_ptr().add(offset) } as *mut u32)
    }
}

impl RegisterAccess for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        match self.reg_ptr(offset) {
            Some(addr) => unsafe { addr.read_volatile() },
            None => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        if let Some(addr) = self.reg_ptr(offset) {
            unsafe { addr.write_volatile(value) }
        }
    }
}
