//! Dynamically loaded CUDA driver API surface.
//!
//! The driver is resolved at runtime from the system CUDA library; nothing
//! links against it at build time. Only the call surface the JIT consumes is
//! loaded: linker sessions with log buffers, module/function management,
//! streams and events, and the memory operations behind the allocator.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use libloading::Library;

use super::{Error, Result};

pub type CUresult = i32;
pub type CUdevice = i32;
pub type CUcontext = *mut c_void;
pub type CUmodule = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUevent = *mut c_void;
pub type CUlinkState = *mut c_void;
pub type CUdeviceptr = u64;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

const CU_JIT_INFO_LOG_BUFFER: u32 = 3;
const CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES: u32 = 4;
const CU_JIT_ERROR_LOG_BUFFER: u32 = 5;
const CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES: u32 = 6;
const CU_JIT_LOG_VERBOSE: u32 = 12;
const CU_JIT_INPUT_PTX: u32 = 1;

const CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES: i32 = 8;
const CU_FUNC_ATTRIBUTE_PREFERRED_SHARED_MEMORY_CARVEOUT: i32 = 9;
const CU_SHAREDMEM_CARVEOUT_MAX_L1: i32 = 0;

#[cfg(windows)]
const LIBCUDA: &str = "nvcuda.dll";
#[cfg(target_os = "macos")]
const LIBCUDA: &str = "libcuda.dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const LIBCUDA: &str = "libcuda.so.1";

macro_rules! cuda_api {
    ($($name:ident => $sym:literal : fn($($ty:ty),*) -> CUresult;)*) => {
        /// Function table resolved from the driver library.
        pub struct CudaApi {
            _lib: Library,
            $(pub $name: unsafe extern "C" fn($($ty),*) -> CUresult,)*
        }

        impl CudaApi {
            pub fn load() -> Result<Self> {
                unsafe {
                    let lib = Library::new(LIBCUDA).map_err(|e| Error::Loading {
                        library: LIBCUDA,
                        reason: e.to_string(),
                    })?;
                    $(
                        let $name = *lib
                            .get::<unsafe extern "C" fn($($ty),*) -> CUresult>($sym)
                            .map_err(|e| Error::Loading {
                                library: LIBCUDA,
                                reason: format!("{}: {e}", String::from_utf8_lossy($sym)),
                            })?;
                    )*
                    Ok(Self { _lib: lib, $($name,)* })
                }
            }
        }
    };
}

cuda_api! {
    cuInit => b"cuInit\0": fn(u32) -> CUresult;
    cuDriverGetVersion => b"cuDriverGetVersion\0": fn(*mut i32) -> CUresult;
    cuDeviceGetCount => b"cuDeviceGetCount\0": fn(*mut i32) -> CUresult;
    cuDeviceGet => b"cuDeviceGet\0": fn(*mut CUdevice, i32) -> CUresult;
    cuDeviceGetName => b"cuDeviceGetName\0": fn(*mut c_char, i32, CUdevice) -> CUresult;
    cuDevicePrimaryCtxRetain => b"cuDevicePrimaryCtxRetain\0": fn(*mut CUcontext, CUdevice) -> CUresult;
    cuDevicePrimaryCtxRelease => b"cuDevicePrimaryCtxRelease_v2\0": fn(CUdevice) -> CUresult;
    cuCtxPushCurrent => b"cuCtxPushCurrent_v2\0": fn(CUcontext) -> CUresult;
    cuCtxPopCurrent => b"cuCtxPopCurrent_v2\0": fn(*mut CUcontext) -> CUresult;
    cuStreamCreate => b"cuStreamCreate\0": fn(*mut CUstream, u32) -> CUresult;
    cuStreamDestroy => b"cuStreamDestroy_v2\0": fn(CUstream) -> CUresult;
    cuStreamSynchronize => b"cuStreamSynchronize\0": fn(CUstream) -> CUresult;
    cuStreamWaitEvent => b"cuStreamWaitEvent\0": fn(CUstream, CUevent, u32) -> CUresult;
    cuEventCreate => b"cuEventCreate\0": fn(*mut CUevent, u32) -> CUresult;
    cuEventDestroy => b"cuEventDestroy_v2\0": fn(CUevent) -> CUresult;
    cuEventRecord => b"cuEventRecord\0": fn(CUevent, CUstream) -> CUresult;
    cuLinkCreate => b"cuLinkCreate_v2\0": fn(u32, *mut u32, *mut *mut c_void, *mut CUlinkState) -> CUresult;
    cuLinkAddData => b"cuLinkAddData_v2\0": fn(CUlinkState, u32, *mut c_void, usize, *const c_char, u32, *mut u32, *mut *mut c_void) -> CUresult;
    cuLinkComplete => b"cuLinkComplete\0": fn(CUlinkState, *mut *mut c_void, *mut usize) -> CUresult;
    cuLinkDestroy => b"cuLinkDestroy\0": fn(CUlinkState) -> CUresult;
    cuModuleLoadData => b"cuModuleLoadData\0": fn(*mut CUmodule, *const c_void) -> CUresult;
    cuModuleUnload => b"cuModuleUnload\0": fn(CUmodule) -> CUresult;
    cuModuleGetFunction => b"cuModuleGetFunction\0": fn(*mut CUfunction, CUmodule, *const c_char) -> CUresult;
    cuFuncSetAttribute => b"cuFuncSetAttribute\0": fn(CUfunction, i32, i32) -> CUresult;
    cuOccupancyMaxPotentialBlockSize => b"cuOccupancyMaxPotentialBlockSize\0": fn(*mut i32, *mut i32, CUfunction, usize, usize, i32) -> CUresult;
    cuLaunchKernel => b"cuLaunchKernel\0": fn(CUfunction, u32, u32, u32, u32, u32, u32, u32, CUstream, *mut *mut c_void, *mut *mut c_void) -> CUresult;
    cuMemAlloc => b"cuMemAlloc_v2\0": fn(*mut CUdeviceptr, usize) -> CUresult;
    cuMemFree => b"cuMemFree_v2\0": fn(CUdeviceptr) -> CUresult;
    cuMemAllocHost => b"cuMemAllocHost_v2\0": fn(*mut *mut c_void, usize) -> CUresult;
    cuMemFreeHost => b"cuMemFreeHost\0": fn(*mut c_void) -> CUresult;
    cuMemcpyHtoD => b"cuMemcpyHtoD_v2\0": fn(CUdeviceptr, *const c_void, usize) -> CUresult;
    cuMemcpyDtoH => b"cuMemcpyDtoH_v2\0": fn(*mut c_void, CUdeviceptr, usize) -> CUresult;
    cuMemcpyAsync => b"cuMemcpyAsync\0": fn(CUdeviceptr, CUdeviceptr, usize, CUstream) -> CUresult;
    cuMemsetD8Async => b"cuMemsetD8Async\0": fn(CUdeviceptr, u8, usize, CUstream) -> CUresult;
    cuMemsetD16Async => b"cuMemsetD16Async\0": fn(CUdeviceptr, u16, usize, CUstream) -> CUresult;
    cuMemsetD32Async => b"cuMemsetD32Async\0": fn(CUdeviceptr, u32, usize, CUstream) -> CUresult;
}

fn check(status: CUresult, call: &'static str) -> Result<()> {
    match status {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_OUT_OF_MEMORY => Err(Error::OutOfMemory),
        status => Err(Error::Driver { call, status }),
    }
}

/// A device with its primary context, main stream and fence event.
pub struct CudaDevice {
    api: Arc<CudaApi>,
    ctx: CUcontext,
    device: CUdevice,
    stream: CUstream,
    event: CUevent,
    /// Lazily grown sub-streams used by parallel dispatch.
    sub: parking_lot::Mutex<Vec<(CUstream, CUevent)>>,
}

unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

/// Makes the device context current for the lifetime of the guard.
pub struct CtxGuard<'a> {
    api: &'a CudaApi,
}

impl<'a> CtxGuard<'a> {
    fn new(device: &'a CudaDevice) -> Self {
        unsafe { (device.api.cuCtxPushCurrent)(device.ctx) };
        Self { api: &device.api }
    }
}

impl Drop for CtxGuard<'_> {
    fn drop(&mut self) {
        let mut old = std::ptr::null_mut();
        unsafe { (self.api.cuCtxPopCurrent)(&mut old) };
    }
}

impl CudaDevice {
    pub fn create(index: i32) -> Result<Self> {
        let api = Arc::new(CudaApi::load()?);
        unsafe {
            check((api.cuInit)(0), "cuInit")?;

            let mut version = 0;
            check((api.cuDriverGetVersion)(&mut version), "cuDriverGetVersion")?;

            let mut count = 0;
            check((api.cuDeviceGetCount)(&mut count), "cuDeviceGetCount")?;
            if index >= count {
                return Err(Error::NoCudaDevice);
            }

            let mut device = 0;
            check((api.cuDeviceGet)(&mut device, index), "cuDeviceGet")?;

            let mut name = [0u8; 256];
            check(
                (api.cuDeviceGetName)(name.as_mut_ptr() as *mut c_char, name.len() as i32, device),
                "cuDeviceGetName",
            )?;
            let name = CStr::from_bytes_until_nul(&name)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut ctx = std::ptr::null_mut();
            check(
                (api.cuDevicePrimaryCtxRetain)(&mut ctx, device),
                "cuDevicePrimaryCtxRetain",
            )?;
            check((api.cuCtxPushCurrent)(ctx), "cuCtxPushCurrent")?;

            let mut stream = std::ptr::null_mut();
            check((api.cuStreamCreate)(&mut stream, 0), "cuStreamCreate")?;
            let mut event = std::ptr::null_mut();
            check((api.cuEventCreate)(&mut event, 0), "cuEventCreate")?;

            let mut old = std::ptr::null_mut();
            (api.cuCtxPopCurrent)(&mut old);

            log::trace!(
                "found CUDA device {index}: \"{name}\" (driver {}.{})",
                version / 1000,
                (version % 1000) / 10
            );

            Ok(Self {
                api,
                ctx,
                device,
                stream,
                event,
                sub: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    pub fn ctx(&self) -> CtxGuard<'_> {
        CtxGuard::new(self)
    }

    pub fn stream(&self) -> CUstream {
        self.stream
    }

    pub fn event(&self) -> CUevent {
        self.event
    }

    /// Returns the idx-th sub-stream, creating it on first use.
    pub fn sub_stream(&self, idx: usize) -> Result<(CUstream, CUevent)> {
        let mut sub = self.sub.lock();
        let _guard = self.ctx();
        while sub.len() <= idx {
            unsafe {
                let mut stream = std::ptr::null_mut();
                check((self.api.cuStreamCreate)(&mut stream, 0), "cuStreamCreate")?;
                let mut event = std::ptr::null_mut();
                check((self.api.cuEventCreate)(&mut event, 0), "cuEventCreate")?;
                sub.push((stream, event));
            }
        }
        Ok(sub[idx])
    }

    pub fn record_event(&self, event: CUevent, stream: CUstream) -> Result<()> {
        let _guard = self.ctx();
        unsafe { check((self.api.cuEventRecord)(event, stream), "cuEventRecord") }
    }

    pub fn wait_event(&self, stream: CUstream, event: CUevent) -> Result<()> {
        let _guard = self.ctx();
        unsafe {
            check(
                (self.api.cuStreamWaitEvent)(stream, event, 0),
                "cuStreamWaitEvent",
            )
        }
    }

    pub fn sync(&self) -> Result<()> {
        let _guard = self.ctx();
        unsafe {
            check(
                (self.api.cuStreamSynchronize)(self.stream),
                "cuStreamSynchronize",
            )
        }
    }

    pub fn mem_alloc(&self, size: usize) -> Result<u64> {
        let _guard = self.ctx();
        let mut ptr = 0;
        unsafe { check((self.api.cuMemAlloc)(&mut ptr, size), "cuMemAlloc")? };
        Ok(ptr)
    }

    pub fn mem_free(&self, ptr: u64) {
        let _guard = self.ctx();
        unsafe {
            let _ = (self.api.cuMemFree)(ptr);
        }
    }

    pub fn mem_alloc_host(&self, size: usize) -> Result<u64> {
        let _guard = self.ctx();
        let mut ptr = std::ptr::null_mut();
        unsafe { check((self.api.cuMemAllocHost)(&mut ptr, size), "cuMemAllocHost")? };
        Ok(ptr as u64)
    }

    pub fn mem_free_host(&self, ptr: u64) {
        let _guard = self.ctx();
        unsafe {
            let _ = (self.api.cuMemFreeHost)(ptr as *mut c_void);
        }
    }

    pub fn memcpy_htod(&self, dst: u64, src: &[u8]) -> Result<()> {
        let _guard = self.ctx();
        unsafe {
            check(
                (self.api.cuMemcpyHtoD)(dst, src.as_ptr() as *const c_void, src.len()),
                "cuMemcpyHtoD",
            )
        }
    }

    pub fn memcpy_dtoh(&self, dst: &mut [u8], src: u64) -> Result<()> {
        let _guard = self.ctx();
        unsafe {
            check(
                (self.api.cuMemcpyDtoH)(dst.as_mut_ptr() as *mut c_void, src, dst.len()),
                "cuMemcpyDtoH",
            )
        }
    }

    pub fn memcpy_async(&self, dst: u64, src: u64, size: usize) -> Result<()> {
        let _guard = self.ctx();
        unsafe {
            check(
                (self.api.cuMemcpyAsync)(dst, src, size, self.stream),
                "cuMemcpyAsync",
            )
        }
    }

    pub fn memset_async(&self, ptr: u64, count: usize, elem_size: usize, value: u64) -> Result<()> {
        let _guard = self.ctx();
        unsafe {
            match elem_size {
                1 => check(
                    (self.api.cuMemsetD8Async)(ptr, value as u8, count, self.stream),
                    "cuMemsetD8Async",
                ),
                2 => check(
                    (self.api.cuMemsetD16Async)(ptr, value as u16, count, self.stream),
                    "cuMemsetD16Async",
                ),
                4 => check(
                    (self.api.cuMemsetD32Async)(ptr, value as u32, count, self.stream),
                    "cuMemsetD32Async",
                ),
                8 => {
                    // No 64-bit memset in the driver API; interleave two
                    // 32-bit patterns only when both halves agree, otherwise
                    // fall back to an element loop staged through the host.
                    let lo = value as u32;
                    let hi = (value >> 32) as u32;
                    if lo == hi {
                        check(
                            (self.api.cuMemsetD32Async)(ptr, lo, count * 2, self.stream),
                            "cuMemsetD32Async",
                        )
                    } else {
                        let staged = vec![value; count];
                        check(
                            (self.api.cuMemcpyHtoD)(
                                ptr,
                                staged.as_ptr() as *const c_void,
                                count * 8,
                            ),
                            "cuMemcpyHtoD",
                        )
                    }
                }
                n => unreachable!("memset with element size {n}"),
            }
        }
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        unsafe {
            (self.api.cuCtxPushCurrent)(self.ctx);
            let _ = (self.api.cuStreamSynchronize)(self.stream);
            for (stream, event) in self.sub.lock().drain(..) {
                let _ = (self.api.cuStreamDestroy)(stream);
                let _ = (self.api.cuEventDestroy)(event);
            }
            let _ = (self.api.cuEventDestroy)(self.event);
            let _ = (self.api.cuStreamDestroy)(self.stream);
            let mut old = std::ptr::null_mut();
            (self.api.cuCtxPopCurrent)(&mut old);
            let _ = (self.api.cuDevicePrimaryCtxRelease)(self.device);
        }
    }
}

/// A loaded module and its entry function.
pub struct CudaKernel {
    api: Arc<CudaApi>,
    module: CUmodule,
    func: CUfunction,
}

unsafe impl Send for CudaKernel {}
unsafe impl Sync for CudaKernel {}

impl CudaDevice {
    /// Runs a linker session over the PTX text, loads the resulting module
    /// and resolves `entry`. The caller retries once after `trim()` when the
    /// module load reports an out-of-memory condition.
    pub fn compile(&self, ptx: &str, entry: &str) -> Result<CudaKernel> {
        const LOG_SIZE: usize = 8192;
        let mut info_log = vec![0u8; LOG_SIZE];
        let mut error_log = vec![0u8; LOG_SIZE];

        let _guard = self.ctx();
        unsafe {
            let mut options = [
                CU_JIT_INFO_LOG_BUFFER,
                CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
                CU_JIT_ERROR_LOG_BUFFER,
                CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
                CU_JIT_LOG_VERBOSE,
            ];
            let mut values = [
                info_log.as_mut_ptr() as *mut c_void,
                LOG_SIZE as *mut c_void,
                error_log.as_mut_ptr() as *mut c_void,
                LOG_SIZE as *mut c_void,
                1usize as *mut c_void,
            ];

            let mut link = std::ptr::null_mut();
            check(
                (self.api.cuLinkCreate)(
                    options.len() as u32,
                    options.as_mut_ptr(),
                    values.as_mut_ptr(),
                    &mut link,
                ),
                "cuLinkCreate",
            )?;

            let fail = |log: &[u8]| Error::Compile {
                log: CStr::from_bytes_until_nul(log)
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                src: ptx.to_string(),
            };

            let status = (self.api.cuLinkAddData)(
                link,
                CU_JIT_INPUT_PTX,
                ptx.as_ptr() as *mut c_void,
                ptx.len(),
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
            if status != CUDA_SUCCESS {
                let err = fail(&error_log);
                (self.api.cuLinkDestroy)(link);
                return Err(err);
            }

            let mut image = std::ptr::null_mut();
            let mut image_size = 0;
            let status = (self.api.cuLinkComplete)(link, &mut image, &mut image_size);
            if status != CUDA_SUCCESS {
                let err = fail(&error_log);
                (self.api.cuLinkDestroy)(link);
                return Err(err);
            }

            if let Ok(info) = CStr::from_bytes_until_nul(&info_log) {
                log::trace!("detailed linker output:\n{}", info.to_string_lossy());
            }

            let mut module = std::ptr::null_mut();
            let status = (self.api.cuModuleLoadData)(&mut module, image);
            if status != CUDA_SUCCESS {
                (self.api.cuLinkDestroy)(link);
                check(status, "cuModuleLoadData")?;
                unreachable!();
            }
            check((self.api.cuLinkDestroy)(link), "cuLinkDestroy")?;

            let name = CString::new(entry).unwrap();
            let mut func = std::ptr::null_mut();
            let status = (self.api.cuModuleGetFunction)(&mut func, module, name.as_ptr());
            if status != CUDA_SUCCESS {
                let _ = (self.api.cuModuleUnload)(module);
                return Err(Error::MissingEntry(entry.to_string()));
            }

            // The generated kernels never touch shared memory.
            check(
                (self.api.cuFuncSetAttribute)(
                    func,
                    CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                    0,
                ),
                "cuFuncSetAttribute",
            )?;
            check(
                (self.api.cuFuncSetAttribute)(
                    func,
                    CU_FUNC_ATTRIBUTE_PREFERRED_SHARED_MEMORY_CARVEOUT,
                    CU_SHAREDMEM_CARVEOUT_MAX_L1,
                ),
                "cuFuncSetAttribute",
            )?;

            Ok(CudaKernel {
                api: self.api.clone(),
                module,
                func,
            })
        }
    }

    /// Launches with an occupancy-derived block size and a grid covering
    /// `size` elements (the kernel body is a grid-stride loop).
    pub fn launch(
        &self,
        kernel: &CudaKernel,
        stream: CUstream,
        size: u32,
        args: &mut [*mut c_void],
    ) -> Result<()> {
        let _guard = self.ctx();
        unsafe {
            let mut min_grid = 0;
            let mut block_size = 0;
            check(
                (self.api.cuOccupancyMaxPotentialBlockSize)(
                    &mut min_grid,
                    &mut block_size,
                    kernel.func,
                    0,
                    0,
                    0,
                ),
                "cuOccupancyMaxPotentialBlockSize",
            )?;
            let block_size = (block_size as u32).max(1);
            let grid_size = size.div_ceil(block_size).max(1);

            check(
                (self.api.cuLaunchKernel)(
                    kernel.func,
                    grid_size,
                    1,
                    1,
                    block_size,
                    1,
                    1,
                    0,
                    stream,
                    args.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }
}

impl Drop for CudaKernel {
    fn drop(&mut self) {
        unsafe {
            let _ = (self.api.cuModuleUnload)(self.module);
        }
    }
}
