use std::alloc::{self, Layout};
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, Ordering};
use std::{ptr, slice};

/// Alignment that every DMA buffer is carved out at. Controllers are allowed
/// to assume buffers never straddle a cache line boundary mid-element.
pub const DMA_ALIGNMENT: usize = 64;

/// An owned buffer suitable for handing to a bus-mastering device. The memory
/// is allocated at a fixed alignment and never moves for the lifetime of the
/// value, so the address handed out by `physical()` stays valid until drop.
pub struct Dma<T: ?Sized> {
    virt: *mut T,
    layout: Layout,
}

unsafe impl<T: ?Sized + Send> Send for Dma<T> {}
unsafe impl<T: ?Sized + Sync> Sync for Dma<T> {}

fn layout_for<T>() -> Layout {
    Layout::new::<T>()
        .align_to(DMA_ALIGNMENT)
        .expect("invalid DMA layout")
        .pad_to_align()
}

impl<T> Dma<T> {
    pub fn new(value: T) -> Self {
        let layout = layout_for::<T>();
        let virt = unsafe { alloc::alloc(layout) } as *mut T;
        if virt.is_null() {
            alloc::handle_alloc_error(layout);
        }
        unsafe { ptr::write(virt, value) };
        Self { virt, layout }
    }

    pub fn zeroed() -> Dma<MaybeUninit<T>> {
        let layout = layout_for::<T>();
        let virt = unsafe { alloc::alloc_zeroed(layout) } as *mut MaybeUninit<T>;
        if virt.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Dma { virt, layout }
    }

    /// The bus address of the buffer. With no IOMMU translation in the
    /// picture this is simply the linear address of the allocation.
    pub fn physical(&self) -> usize {
        self.virt as *const u8 as usize
    }
}

impl<T> Dma<MaybeUninit<T>> {
    /// # Safety
    /// The contents must have been fully initialized, typically by the device.
    pub unsafe fn assume_init(self) -> Dma<T> {
        let virt = self.virt as *mut T;
        let layout = self.layout;
        mem::forget(self);
        Dma { virt, layout }
    }
}

impl Dma<[u8]> {
    /// Allocates a zero-filled byte buffer of the given length.
    pub fn new_slice(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), DMA_ALIGNMENT)
            .expect("invalid DMA layout")
            .pad_to_align();
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        let virt = unsafe { slice::from_raw_parts_mut(base, len) } as *mut [u8];
        Self { virt, layout }
    }

    pub fn physical(&self) -> usize {
        self.virt as *const u8 as usize
    }
}

impl<T: ?Sized> Dma<T> {
    /// Publishes CPU-side writes to the buffer before the device reads it.
    pub fn sync_for_device(&self) {
        fence(Ordering::Release);
    }

    /// Invalidates CPU-side assumptions after the device wrote the buffer.
    pub fn sync_for_cpu(&self) {
        fence(Ordering::Acquire);
    }
}

impl<T: ?Sized> Deref for Dma<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.virt }
    }
}

impl<T: ?Sized> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.virt }
    }
}

impl<T: ?Sized> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.virt);
            alloc::dealloc(self.virt as *mut u8, self.layout);
        }
    }
}
