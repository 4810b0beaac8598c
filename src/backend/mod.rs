pub mod cuda;
pub mod llvm;

use thiserror::Error;

/// Compilation path of a variable. All dependencies of a node must agree.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Backend {
    /// PTX assembled through the CUDA driver.
    Cuda,
    /// LLVM IR compiled through the LLVM JIT.
    #[default]
    Llvm,
}

impl Backend {
    pub fn is_cuda(self) -> bool {
        matches!(self, Backend::Cuda)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not load {library}: {reason}")]
    Loading { library: &'static str, reason: String },

    #[error("{call}() failed with status {status}")]
    Driver { call: &'static str, status: i32 },

    #[error("no CUDA device available")]
    NoCudaDevice,

    #[error("LLVM shared library not available")]
    NoLlvm,

    #[error("kernel compilation failed:\n{log}\nsource:\n{src}")]
    Compile { log: String, src: String },

    #[error("entry point {0:?} not found in compiled module")]
    MissingEntry(String),

    #[error("out of device memory")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, Error>;
