//! Memory allocator shared by both backends.
//!
//! Released blocks park in per-flavor size-bucketed pools and are handed
//! back on the next matching request; `trim` returns everything to the
//! system (and is invoked once when a GPU module load runs out of memory).
//! All sizes are rounded up so that the vectorized CPU loop may load and
//! store whole packets in its final iteration without leaving the block.

use std::alloc::Layout;
use std::collections::HashMap;

use bytesize::ByteSize;
use parking_lot::Mutex;

use crate::backend::cuda::CudaDevice;
use crate::backend::Result;

/// Flavor of an allocation.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AllocType {
    /// GPU global memory.
    Device,
    /// Plain host memory.
    Host,
    /// Page-locked host memory (GPU transfer staging).
    HostPinned,
    /// Host memory written by the asynchronous CPU queue.
    HostAsync,
    /// Resolved to `Device` or `Host` depending on where the source lives.
    Auto,
}

/// Block granularity. Covers a full packet of `f64` lanes at the widest
/// supported vector width, and keeps the pools dense.
const ROUNDING: usize = 256;

const HOST_ALIGN: usize = 64;

fn round_up(size: usize) -> usize {
    (size.max(1) + ROUNDING - 1) / ROUNDING * ROUNDING
}

#[derive(Default)]
struct Pools {
    free: HashMap<(AllocType, usize), Vec<u64>>,
    used: HashMap<u64, (AllocType, usize)>,
}

#[derive(Default)]
pub struct Malloc {
    pools: Mutex<Pools>,
}

impl Malloc {
    pub fn alloc(&self, cuda: Option<&CudaDevice>, ty: AllocType, bytes: usize) -> Result<u64> {
        let ty = match ty {
            AllocType::Auto => {
                if cuda.is_some() {
                    AllocType::Device
                } else {
                    AllocType::Host
                }
            }
            ty => ty,
        };
        let size = round_up(bytes);

        let mut pools = self.pools.lock();
        if let Some(ptr) = pools.free.get_mut(&(ty, size)).and_then(Vec::pop) {
            pools.used.insert(ptr, (ty, size));
            return Ok(ptr);
        }
        drop(pools);

        let ptr = match ty {
            AllocType::Device => cuda.expect("device allocation without a device").mem_alloc(size)?,
            AllocType::HostPinned => cuda
                .expect("pinned allocation without a device")
                .mem_alloc_host(size)?,
            AllocType::Host | AllocType::HostAsync => unsafe {
                let layout = Layout::from_size_align(size, HOST_ALIGN).unwrap();
                let ptr = std::alloc::alloc(layout);
                assert!(!ptr.is_null(), "host allocation of {size} bytes failed");
                ptr as u64
            },
            AllocType::Auto => unreachable!(),
        };

        log::trace!("alloc {:?} {} -> {ptr:#x}", ty, ByteSize(size as u64));
        self.pools.lock().used.insert(ptr, (ty, size));
        Ok(ptr)
    }

    /// Returns the block to its pool. The memory stays reserved until the
    /// next matching `alloc` or a `trim`.
    pub fn free(&self, ptr: u64) {
        if ptr == 0 {
            return;
        }
        let mut pools = self.pools.lock();
        let (ty, size) = pools
            .used
            .remove(&ptr)
            .unwrap_or_else(|| panic!("free({ptr:#x}): unknown allocation"));
        pools.free.entry((ty, size)).or_default().push(ptr);
    }

    /// Flavor of a live allocation.
    pub fn malloc_type(&self, ptr: u64) -> Option<AllocType> {
        self.pools.lock().used.get(&ptr).map(|(ty, _)| *ty)
    }

    /// Releases all pooled blocks back to the system.
    pub fn trim(&self, cuda: Option<&CudaDevice>) {
        let free = std::mem::take(&mut self.pools.lock().free);
        let mut count = 0usize;
        let mut bytes = 0usize;
        for ((ty, size), ptrs) in free {
            for ptr in ptrs {
                count += 1;
                bytes += size;
                match ty {
                    AllocType::Device => {
                        if let Some(cuda) = cuda {
                            cuda.mem_free(ptr);
                        }
                    }
                    AllocType::HostPinned => {
                        if let Some(cuda) = cuda {
                            cuda.mem_free_host(ptr);
                        }
                    }
                    AllocType::Host | AllocType::HostAsync => unsafe {
                        let layout = Layout::from_size_align(size, HOST_ALIGN).unwrap();
                        std::alloc::dealloc(ptr as *mut u8, layout);
                    },
                    AllocType::Auto => unreachable!(),
                }
            }
        }
        if count > 0 {
            log::debug!("trim(): released {count} blocks ({})", ByteSize(bytes as u64));
        }
    }

    /// Fills `count` elements of `elem_size` bytes with the given pattern.
    pub fn memset_async(
        &self,
        cuda: Option<&CudaDevice>,
        ptr: u64,
        count: usize,
        elem_size: usize,
        value: u64,
    ) -> Result<()> {
        match self.malloc_type(ptr) {
            Some(AllocType::Device) => {
                cuda.unwrap().memset_async(ptr, count, elem_size, value)
            }
            _ => {
                unsafe {
                    let bytes = &value.to_le_bytes()[..elem_size];
                    let dst = std::slice::from_raw_parts_mut(ptr as *mut u8, count * elem_size);
                    for chunk in dst.chunks_exact_mut(elem_size) {
                        chunk.copy_from_slice(bytes);
                    }
                }
                Ok(())
            }
        }
    }

    /// Copies between two allocations of any flavor combination.
    pub fn memcpy_async(
        &self,
        cuda: Option<&CudaDevice>,
        dst: u64,
        src: u64,
        bytes: usize,
    ) -> Result<()> {
        let dst_dev = self.malloc_type(dst) == Some(AllocType::Device);
        let src_dev = self.malloc_type(src) == Some(AllocType::Device);
        match (dst_dev, src_dev) {
            (false, false) => unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes);
                Ok(())
            },
            (true, false) => cuda.unwrap().memcpy_htod(dst, unsafe {
                std::slice::from_raw_parts(src as *const u8, bytes)
            }),
            (false, true) => cuda.unwrap().memcpy_dtoh(
                unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, bytes) },
                src,
            ),
            (true, true) => cuda.unwrap().memcpy_async(dst, src, bytes),
        }
    }

    /// Writes a single element.
    pub fn poke(
        &self,
        cuda: Option<&CudaDevice>,
        ptr: u64,
        value: u64,
        elem_size: usize,
    ) -> Result<()> {
        if self.malloc_type(ptr) == Some(AllocType::Device) {
            cuda.unwrap().memcpy_htod(ptr, &value.to_le_bytes()[..elem_size])
        } else {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    value.to_le_bytes().as_ptr(),
                    ptr as *mut u8,
                    elem_size,
                );
            }
            Ok(())
        }
    }

    /// Moves an allocation to a different flavor; returns the new address.
    pub fn migrate(
        &self,
        cuda: Option<&CudaDevice>,
        ptr: u64,
        target: AllocType,
    ) -> Result<u64> {
        let (ty, size) = *self
            .pools
            .lock()
            .used
            .get(&ptr)
            .unwrap_or_else(|| panic!("migrate({ptr:#x}): unknown allocation"));
        let target = match target {
            AllocType::Auto => ty,
            t => t,
        };
        if target == ty {
            return Ok(ptr);
        }
        let new = self.alloc(cuda, target, size)?;
        self.memcpy_async(cuda, new, ptr, size)?;
        self.free(ptr);
        Ok(new)
    }
}
