//! A tracing just-in-time compiler for SIMD array programs.
//!
//! Operations over lazy typed arrays are recorded into a reference-counted
//! computation graph with common-subexpression elimination. Forcing a value
//! fuses the reachable graph into one data-parallel kernel per output size,
//! assembled as PTX (CUDA backend) or LLVM IR (vectorized CPU backend),
//! memoized by source text and launched against device-resident buffers.
//!
//! ```no_run
//! use talos_jit::{Backend, Jit};
//!
//! let jit = Jit::new(Backend::Llvm);
//! let a = jit.index(1024);
//! let b = a.mul(&a).fma(&a, &a);
//! b.schedule();
//! jit.eval().unwrap();
//! assert_eq!(b.item::<u32>(7), 7 * 7 * 7 + 7);
//! ```

pub mod backend;
mod codegen;
mod context;
mod eval;
mod kernel;
mod malloc;
mod op;
mod var;
mod vartype;

#[cfg(test)]
mod test;

pub use backend::{Backend, Error, Result};
pub use context::{Jit, VarRef};
pub use malloc::AllocType;
pub use op::{Op, ReduceOp};
pub use var::VarId;
pub use vartype::{AsVarType, VarType};
