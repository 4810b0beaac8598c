//! Dynamically loaded LLVM-C JIT surface.
//!
//! The vector CPU backend hands textual LLVM IR to MCJIT. The shared LLVM
//! library is resolved at runtime; the host CPU name and feature string feed
//! the emitted `attributes #0` block and determine the vector width.

use std::ffi::{c_char, c_void, CStr, CString};

use libloading::Library;

use super::{Error, Result};

type ContextRef = *mut c_void;
type ModuleRef = *mut c_void;
type MemoryBufferRef = *mut c_void;
type ExecutionEngineRef = *mut c_void;

#[repr(C)]
struct MCJITCompilerOptions {
    opt_level: u32,
    code_model: i32,
    no_frame_pointer_elim: i32,
    enable_fast_isel: i32,
    mcjmm: *mut c_void,
}

#[cfg(windows)]
const LIBLLVM: &[&str] = &["LLVM-C.dll"];
#[cfg(target_os = "macos")]
const LIBLLVM: &[&str] = &["libLLVM.dylib"];
#[cfg(all(unix, not(target_os = "macos")))]
const LIBLLVM: &[&str] = &[
    "libLLVM.so",
    "libLLVM-18.so.1",
    "libLLVM-17.so.1",
    "libLLVM-16.so.1",
    "libLLVM-15.so.1",
    "libLLVM-14.so.1",
];

macro_rules! llvm_api {
    ($($name:ident => $sym:literal : fn($($ty:ty),*) $(-> $ret:ty)?;)*) => {
        struct LlvmApi {
            _lib: Library,
            $($name: unsafe extern "C" fn($($ty),*) $(-> $ret)?,)*
        }

        impl LlvmApi {
            fn load(lib: Library) -> Result<Self> {
                unsafe {
                    $(
                        let $name = *lib
                            .get::<unsafe extern "C" fn($($ty),*) $(-> $ret)?>($sym)
                            .map_err(|e| Error::Loading {
                                library: "libLLVM",
                                reason: format!("{}: {e}", String::from_utf8_lossy($sym)),
                            })?;
                    )*
                    Ok(Self { _lib: lib, $($name,)* })
                }
            }
        }
    };
}

llvm_api! {
    link_in_mcjit => b"LLVMLinkInMCJIT\0": fn();
    context_create => b"LLVMContextCreate\0": fn() -> ContextRef;
    context_dispose => b"LLVMContextDispose\0": fn(ContextRef);
    create_buffer => b"LLVMCreateMemoryBufferWithMemoryRangeCopy\0": fn(*const c_char, usize, *const c_char) -> MemoryBufferRef;
    parse_ir => b"LLVMParseIRInContext\0": fn(ContextRef, MemoryBufferRef, *mut ModuleRef, *mut *mut c_char) -> i32;
    dispose_module => b"LLVMDisposeModule\0": fn(ModuleRef);
    dispose_message => b"LLVMDisposeMessage\0": fn(*mut c_char);
    init_mcjit_options => b"LLVMInitializeMCJITCompilerOptions\0": fn(*mut MCJITCompilerOptions, usize);
    create_mcjit => b"LLVMCreateMCJITCompilerForModule\0": fn(*mut ExecutionEngineRef, ModuleRef, *mut MCJITCompilerOptions, usize, *mut *mut c_char) -> i32;
    dispose_engine => b"LLVMDisposeExecutionEngine\0": fn(ExecutionEngineRef);
    function_address => b"LLVMGetFunctionAddress\0": fn(ExecutionEngineRef, *const c_char) -> u64;
    host_cpu_name => b"LLVMGetHostCPUName\0": fn() -> *mut c_char;
    host_cpu_features => b"LLVMGetHostCPUFeatures\0": fn() -> *mut c_char;
}

/// Per-architecture target registration entry points. Only the ones present
/// in the loaded library are invoked.
const TARGET_INITS: &[&[u8]] = &[
    b"LLVMInitializeX86TargetInfo\0",
    b"LLVMInitializeX86Target\0",
    b"LLVMInitializeX86TargetMC\0",
    b"LLVMInitializeX86AsmPrinter\0",
    b"LLVMInitializeX86AsmParser\0",
    b"LLVMInitializeAArch64TargetInfo\0",
    b"LLVMInitializeAArch64Target\0",
    b"LLVMInitializeAArch64TargetMC\0",
    b"LLVMInitializeAArch64AsmPrinter\0",
    b"LLVMInitializeAArch64AsmParser\0",
];

pub struct LlvmJit {
    api: LlvmApi,
    ctx: ContextRef,
    /// Vector width of every emitted kernel (f32 lanes).
    pub width: u32,
    pub target_cpu: String,
    pub target_features: String,
    /// Whether the library expects opaque (`ptr`) pointer syntax.
    pub opaque_pointers: bool,
}

unsafe impl Send for LlvmJit {}
unsafe impl Sync for LlvmJit {}

/// A compiled CPU kernel. The execution engine owns the code; the entry
/// iterates `[start, end)` in vector-width steps over the parameter table.
pub struct LlvmKernel {
    api_dispose: unsafe extern "C" fn(ExecutionEngineRef),
    engine: ExecutionEngineRef,
    entry: unsafe extern "C" fn(u64, u64, *const *mut u8),
}

unsafe impl Send for LlvmKernel {}
unsafe impl Sync for LlvmKernel {}

impl LlvmJit {
    pub fn create() -> Result<Self> {
        let lib = LIBLLVM
            .iter()
            .find_map(|name| unsafe { Library::new(name).ok() })
            .ok_or(Error::NoLlvm)?;
        let api = LlvmApi::load(lib)?;

        unsafe {
            for sym in TARGET_INITS {
                if let Ok(f) = api._lib.get::<unsafe extern "C" fn()>(sym) {
                    f();
                }
            }
            (api.link_in_mcjit)();
        }

        let ctx = unsafe { (api.context_create)() };

        let take_message = |ptr: *mut c_char| unsafe {
            if ptr.is_null() {
                String::new()
            } else {
                let s = CStr::from_ptr(ptr).to_string_lossy().into_owned();
                (api.dispose_message)(ptr);
                s
            }
        };

        let target_cpu = take_message(unsafe { (api.host_cpu_name)() });
        let target_features = take_message(unsafe { (api.host_cpu_features)() });

        let width = if target_features.contains("+avx512f") {
            16
        } else if target_features.contains("+avx") {
            8
        } else {
            4
        };

        let mut jit = Self {
            api,
            ctx,
            width,
            target_cpu,
            target_features,
            opaque_pointers: false,
        };

        // Probe which pointer syntax the library accepts. Typed pointers
        // stopped parsing in recent LLVM versions, so a tiny module with an
        // opaque `ptr` argument decides the emitted flavor.
        jit.opaque_pointers = jit
            .parse("define void @probe(ptr %p) {\nentry:\n    ret void\n}\n")
            .is_ok_and(|m| {
                unsafe { (jit.api.dispose_module)(m) };
                true
            });

        log::trace!(
            "LLVM JIT ready: cpu={}, width={}, opaque_pointers={}",
            jit.target_cpu,
            jit.width,
            jit.opaque_pointers
        );

        Ok(jit)
    }

    fn parse(&self, ir: &str) -> std::result::Result<ModuleRef, String> {
        unsafe {
            let buffer = (self.api.create_buffer)(
                ir.as_ptr() as *const c_char,
                ir.len(),
                b"kernel\0".as_ptr() as *const c_char,
            );
            let mut module = std::ptr::null_mut();
            let mut message = std::ptr::null_mut();
            // Takes ownership of the buffer regardless of the outcome.
            if (self.api.parse_ir)(self.ctx, buffer, &mut module, &mut message) != 0 {
                let log = if message.is_null() {
                    String::new()
                } else {
                    let s = CStr::from_ptr(message).to_string_lossy().into_owned();
                    (self.api.dispose_message)(message);
                    s
                };
                Err(log)
            } else {
                Ok(module)
            }
        }
    }

    /// Parses the IR, builds an MCJIT engine around it and resolves `entry`.
    pub fn compile(&self, ir: &str, entry: &str) -> Result<LlvmKernel> {
        let module = self.parse(ir).map_err(|log| Error::Compile {
            log,
            src: ir.to_string(),
        })?;

        unsafe {
            let mut options = std::mem::zeroed::<MCJITCompilerOptions>();
            (self.api.init_mcjit_options)(
                &mut options,
                std::mem::size_of::<MCJITCompilerOptions>(),
            );
            options.opt_level = 2;

            let mut engine = std::ptr::null_mut();
            let mut message = std::ptr::null_mut();
            if (self.api.create_mcjit)(
                &mut engine,
                module,
                &mut options,
                std::mem::size_of::<MCJITCompilerOptions>(),
                &mut message,
            ) != 0
            {
                let log = if message.is_null() {
                    String::new()
                } else {
                    let s = CStr::from_ptr(message).to_string_lossy().into_owned();
                    (self.api.dispose_message)(message);
                    s
                };
                return Err(Error::Compile {
                    log,
                    src: ir.to_string(),
                });
            }

            let name = CString::new(entry).unwrap();
            let addr = (self.api.function_address)(engine, name.as_ptr());
            if addr == 0 {
                (self.api.dispose_engine)(engine);
                return Err(Error::MissingEntry(entry.to_string()));
            }

            Ok(LlvmKernel {
                api_dispose: self.api.dispose_engine,
                engine,
                entry: std::mem::transmute::<u64, unsafe extern "C" fn(u64, u64, *const *mut u8)>(
                    addr,
                ),
            })
        }
    }
}

impl Drop for LlvmJit {
    fn drop(&mut self) {
        unsafe { (self.api.context_dispose)(self.ctx) };
    }
}

impl LlvmKernel {
    pub fn launch(&self, size: u32, params: &[*mut u8]) {
        unsafe { (self.entry)(0, size as u64, params.as_ptr()) }
    }
}

impl Drop for LlvmKernel {
    fn drop(&mut self) {
        unsafe { (self.api_dispose)(self.engine) };
    }
}
