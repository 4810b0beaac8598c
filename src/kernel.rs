//! Kernel cache and launcher.
//!
//! Kernels are memoized by the exact emitted source text (hash already
//! patched into the entry name), so textually identical kernels from
//! different recording sessions share one compiled module. Compilation and
//! launches run outside the context lock.

use std::ffi::c_void;
use std::sync::Arc;

use crate::backend::cuda::{CudaKernel, CUstream};
use crate::backend::llvm::{LlvmJit, LlvmKernel};
use crate::backend::{Backend, Error, Result};
use crate::codegen::Program;
use crate::context::Jit;

pub enum Kernel {
    Cuda(CudaKernel),
    Llvm {
        /// Keeps the JIT library loaded for as long as the code may run.
        _jit: Arc<LlvmJit>,
        kernel: LlvmKernel,
    },
}

/// Looks the program up in the cache, compiling on a miss. A GPU module
/// load that runs out of memory retries once after trimming the allocator.
pub(crate) fn get_or_compile(jit: &Jit, program: &Program) -> Result<Arc<Kernel>> {
    if let Some(kernel) = jit.lock().kernels.get(&program.source) {
        log::debug!("get_or_compile(): cache hit for {}", program.entry);
        return Ok(kernel.clone());
    }

    let start = std::time::Instant::now();
    let kernel = match program.backend {
        Backend::Cuda => {
            let device = jit.inner.cuda().ok_or(Error::NoCudaDevice)?;
            let compiled = match device.compile(&program.source, &program.entry) {
                Err(Error::OutOfMemory) => {
                    jit.inner.alloc.trim(Some(device));
                    device.compile(&program.source, &program.entry)?
                }
                other => other?,
            };
            Kernel::Cuda(compiled)
        }
        Backend::Llvm => {
            let llvm = jit.inner.llvm().ok_or(Error::NoLlvm)?.clone();
            let kernel = llvm.compile(&program.source, &program.entry)?;
            Kernel::Llvm { _jit: llvm, kernel }
        }
    };
    log::debug!(
        "get_or_compile(): cache miss, compiled {} in {:.2?}",
        program.entry,
        start.elapsed()
    );

    let kernel = Arc::new(kernel);
    Ok(jit
        .lock()
        .kernels
        .entry(program.source.clone())
        .or_insert(kernel)
        .clone())
}

/// Launches one group on the given stream (GPU) or inline (CPU).
pub(crate) fn launch(
    jit: &Jit,
    kernel: &Kernel,
    program: &Program,
    stream: Option<CUstream>,
) -> Result<()> {
    match kernel {
        Kernel::Cuda(kernel) => {
            let device = jit.inner.cuda().ok_or(Error::NoCudaDevice)?;
            let stream = stream.unwrap_or(device.stream());
            let mut size = program.size;

            if program.param_direct {
                let mut ptrs = program.params.clone();
                let mut args: Vec<*mut c_void> =
                    Vec::with_capacity(1 + ptrs.len());
                args.push(&mut size as *mut u32 as *mut c_void);
                for p in ptrs.iter_mut() {
                    args.push(p as *mut u64 as *mut c_void);
                }
                device.launch(kernel, stream, program.size, &mut args)?;
            } else {
                // Too many parameters: pass one device pointer to a table.
                let bytes = program.params.len() * 8;
                let table = jit
                    .inner
                    .alloc
                    .alloc(Some(device), crate::malloc::AllocType::Device, bytes)?;
                device.memcpy_htod(table, bytemuck::cast_slice(&program.params))?;
                let mut table_arg = table;
                let mut args: Vec<*mut c_void> = vec![
                    &mut size as *mut u32 as *mut c_void,
                    &mut table_arg as *mut u64 as *mut c_void,
                ];
                let result = device.launch(kernel, stream, program.size, &mut args);
                // The table may not be reused while the kernel reads it.
                device.sync()?;
                jit.inner.alloc.free(table);
                result?;
            }
            Ok(())
        }
        Kernel::Llvm { kernel, .. } => {
            let params: Vec<*mut u8> = program.params.iter().map(|&p| p as *mut u8).collect();
            kernel.launch(program.size, &params);
            Ok(())
        }
    }
}
