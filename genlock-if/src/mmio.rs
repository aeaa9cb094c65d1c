use alloc::sync::Arc;

/// Raw 32-bit access to the display engine register aperture.
///
/// Offsets are absolute MMIO byte offsets. Implementations perform the access
/// immediately; ordering between accesses is the hardware's concern.
pub trait RegisterAccess: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for Arc<T> {
    fn read32(&self, offset: u32) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        (**self).write32(offset, value)
    }
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for &T {
    fn read32(&self, offset: u32) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        (**self).write32(offset, value)
    }
}
