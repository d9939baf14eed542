//! util/aligned - буфер с гарантированным выравниванием (для unbuffered/direct IO).
//!
//! Контракт:
//! - адрес начала кратен `alignment` (степень двойки);
//! - размер > 0, память занулена при создании;
//! - освобождение в Drop тем же Layout.
//!
//! Ошибка аллокации - ResourceError, без паники.

use anyhow::Result;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::errors::resource_err;

pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    alignment: usize,
}

impl AlignedBuffer {
    /// Выделить занулённый буфер `size` байт с выравниванием `alignment`.
    pub fn zeroed(alignment: usize, size: usize) -> Result<Self> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(resource_err(format!(
                "bad aligned buffer request: size={}, alignment={}",
                size, alignment
            )));
        }
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|e| resource_err(format!("aligned layout: {}", e)))?;
        // SAFETY: layout имеет ненулевой размер.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            resource_err(format!("failed to allocate {} bytes (align {})", size, alignment))
        })?;
        Ok(Self {
            ptr,
            size,
            alignment,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Занулить весь буфер.
    pub fn clear(&mut self) {
        for b in self.deref_mut() {
            *b = 0;
        }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr валиден на size байт до Drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: &mut self даёт эксклюзивный доступ.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Layout уже проверялся в zeroed().
        if let Ok(layout) = Layout::from_size_align(self.size, self.alignment) {
            // SAFETY: выделено alloc_zeroed с тем же layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// Буфер владеет памятью эксклюзивно.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}
