//! JIT context and the reference-counted variable handle.
//!
//! A `Jit` owns the traced graph, the kernel cache, the allocator and the
//! lazily loaded backend drivers. All graph mutation runs under one mutex;
//! driver calls, allocator growth and user free-callbacks run outside it.

use std::fmt;
use std::sync::Arc;

use bytemuck::Zeroable;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::cuda::CudaDevice;
use crate::backend::llvm::LlvmJit;
use crate::backend::{Backend, Result};
use crate::eval;
use crate::malloc::{AllocType, Malloc};
use crate::op::{Op, ReduceOp};
use crate::var::{CallData, LoopData, State, VarId, Variable};
use crate::vartype::{AsVarType, VarType};

pub(crate) struct Inner {
    // Field order matters: kernels inside `state` reference driver-owned
    // code and must drop before the drivers below.
    pub state: Mutex<State>,
    pub alloc: Malloc,
    pub cuda: OnceCell<Option<Arc<CudaDevice>>>,
    pub llvm: OnceCell<Option<Arc<LlvmJit>>>,
}

impl Inner {
    pub fn cuda(&self) -> Option<&Arc<CudaDevice>> {
        self.cuda
            .get_or_init(|| match CudaDevice::create(0) {
                Ok(dev) => Some(Arc::new(dev)),
                Err(err) => {
                    log::debug!("CUDA driver unavailable: {err}");
                    None
                }
            })
            .as_ref()
    }

    pub fn llvm(&self) -> Option<&Arc<LlvmJit>> {
        self.llvm
            .get_or_init(|| match LlvmJit::create() {
                Ok(jit) => Some(Arc::new(jit)),
                Err(err) => {
                    log::debug!("LLVM JIT unavailable: {err}");
                    None
                }
            })
            .as_ref()
    }
}

/// A JIT context. Cheap to clone; all clones share one graph.
#[derive(Clone)]
pub struct Jit {
    pub(crate) inner: Arc<Inner>,
    backend: Backend,
}

impl Jit {
    pub fn new(backend: Backend) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                alloc: Malloc::default(),
                cuda: OnceCell::new(),
                llvm: OnceCell::new(),
            }),
            backend,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock()
    }

    /// Releases buffers and runs free callbacks collected while the state
    /// lock was held. Every mutating entry point funnels through this.
    pub(crate) fn finish(&self, mut st: MutexGuard<'_, State>) {
        let dead = std::mem::take(&mut st.dead_data);
        let callbacks = std::mem::take(&mut st.pending_callbacks);
        drop(st);
        for ptr in dead {
            self.inner.alloc.free(ptr);
        }
        for (cb, index) in callbacks {
            cb(index);
        }
    }

    pub fn set_cse(&self, enable: bool) {
        self.lock().enable_cse = enable;
    }

    pub fn set_parallel_dispatch(&self, enable: bool) {
        self.lock().parallel_dispatch = enable;
    }

    /// Overrides the auto-detected CPU vector width.
    pub fn set_vector_width(&self, width: u32) {
        assert!(width.is_power_of_two(), "vector width must be a power of two");
        self.lock().vector_width = Some(width);
    }

    pub fn n_variables(&self) -> usize {
        self.lock().n_variables()
    }

    /// Running count of freshly constructed nodes (CSE hits excluded).
    pub fn nodes_created(&self) -> u64 {
        self.lock().nodes_created
    }

    pub fn n_kernels(&self) -> usize {
        self.lock().kernels.len()
    }

    pub(crate) fn make_ref(&self, index: VarId) -> VarRef {
        VarRef {
            jit: self.clone(),
            index,
        }
    }

    /// Central node constructor: validates operands, applies the broadcast
    /// rule, forces an evaluation pass when a dependency is dirty, and runs
    /// the candidate through the CSE cache. The result carries one external
    /// reference which the returned id transfers to its eventual handle.
    pub(crate) fn new_node(
        &self,
        op: Op,
        ty: VarType,
        explicit_size: Option<u32>,
        deps: &[VarId],
        literal: u64,
    ) -> VarId {
        assert!(deps.len() <= 4);
        loop {
            let mut st = self.lock();

            if !deps.is_empty() {
                if deps.iter().all(|d| *d == 0) {
                    return 0;
                }
                if deps.iter().any(|d| *d == 0) {
                    panic!("new_node({op:?}): arithmetic involving an uninitialized operand");
                }
            }

            if st.symbolic_depth == 0 && deps.iter().any(|d| st.var(*d).pending_scatter) {
                // A dirty operand: evaluate everything first, then retry
                // (the arena may have changed under us).
                drop(st);
                self.eval().expect("evaluation of dirty operands failed");
                continue;
            }

            let mut size = explicit_size.unwrap_or(0);
            let mut tsize = 1u32;
            let mut backend = None;
            for &d in deps {
                let v = st.var(d);
                size = size.max(v.size);
                tsize = tsize.saturating_add(v.tsize);
                match backend {
                    None => backend = Some(v.backend),
                    Some(b) => assert!(
                        b == v.backend,
                        "new_node({op:?}): operands mix backends ({b:?} vs {:?})",
                        v.backend
                    ),
                }
            }
            for &d in deps {
                let dsize = st.var(d).size;
                if dsize != 1 && dsize != size {
                    panic!(
                        "new_node({op:?}): arithmetic involving arrays of \
                         incompatible size ({dsize} and {size})"
                    );
                }
            }

            let mut v = Variable {
                op: op.clone(),
                backend: backend.unwrap_or(self.backend),
                ty,
                size,
                tsize,
                literal,
                symbolic: st.symbolic_depth > 0,
                ..Default::default()
            };
            for (slot, &d) in deps.iter().enumerate() {
                v.dep[slot] = d;
                st.inc_ref_int(d);
            }

            let index = st.new_var(v, false);
            self.finish(st);
            return index;
        }
    }

    /// Creates a scalar constant.
    pub fn literal<T: AsVarType>(&self, value: T) -> VarRef {
        self.sized_literal(value, 1)
    }

    /// Creates a constant of the given size.
    pub fn sized_literal<T: AsVarType>(&self, value: T, size: u32) -> VarRef {
        self.literal_bits(T::var_ty(), value.to_bits(), size)
    }

    pub fn literal_bool(&self, value: bool, size: u32) -> VarRef {
        self.literal_bits(VarType::Bool, value as u64, size)
    }

    /// Creates a constant that is materialized immediately instead of being
    /// folded into a kernel: the buffer is allocated up front and filled
    /// through the asynchronous memset path.
    pub fn evaluated_literal<T: AsVarType>(&self, value: T, size: u32) -> VarRef {
        if size == 0 {
            return self.make_ref(0);
        }
        let ty = T::var_ty();
        let bits = value.to_bits();
        let elem = ty.size();
        let flavor = self.data_alloc_type();
        let cuda = if flavor == AllocType::Device {
            self.inner.cuda().map(|c| c.as_ref())
        } else {
            None
        };
        let ptr = self
            .inner
            .alloc
            .alloc(cuda, flavor, size as usize * elem)
            .expect("allocation failed");
        if size == 1 {
            self.inner
                .alloc
                .poke(cuda, ptr, bits, elem)
                .expect("write failed");
        } else {
            self.inner
                .alloc
                .memset_async(cuda, ptr, size as usize, elem, bits)
                .expect("memset failed");
        }
        self.map_mem(ty, ptr, size, true)
    }

    pub(crate) fn literal_bits(&self, ty: VarType, bits: u64, size: u32) -> VarRef {
        if size == 0 {
            return self.make_ref(0);
        }
        let index = self.new_node(Op::Literal, ty, Some(size), &[], bits);
        let mut st = self.lock();
        let v = st.var_mut(index);
        v.is_literal_zero = bits == 0;
        v.is_literal_one = match ty {
            VarType::F16 => bits == 0x3c00,
            VarType::F32 => bits == 0x3f80_0000,
            VarType::F64 => bits == 0x3ff0_0000_0000_0000,
            _ => bits == 1,
        };
        drop(st);
        self.make_ref(index)
    }

    /// A variable counting `0 .. size-1`.
    pub fn index(&self, size: u32) -> VarRef {
        if size == 0 {
            return self.make_ref(0);
        }
        let index = self.new_node(Op::Counter, VarType::U32, Some(size), &[], 0);
        self.make_ref(index)
    }

    /// `0 .. size-1` converted to the requested type.
    pub fn arange(&self, ty: VarType, size: u32) -> VarRef {
        let counter = self.index(size);
        if ty == VarType::U32 {
            counter
        } else {
            counter.cast(ty)
        }
    }

    /// Registers an existing buffer with the JIT; `free` hands ownership of
    /// the memory to the variable.
    pub fn map_mem(&self, ty: VarType, ptr: u64, size: u32, free: bool) -> VarRef {
        assert!(size != 0 && ptr != 0);
        let mut st = self.lock();
        let mut v = Variable {
            op: Op::Data,
            backend: self.backend,
            ty,
            size,
            tsize: 1,
            data: ptr,
            retain_data: !free,
            ..Default::default()
        };
        if self.backend == Backend::Llvm {
            let width = st.vector_width.unwrap_or(8) as u64;
            let align = 64u64.min(width * ty.size() as u64).max(1);
            v.unaligned = ptr % align != 0;
        }
        let index = st.new_var(v, true);
        self.finish(st);
        self.make_ref(index)
    }

    /// Copies a host slice into backend memory and maps it.
    pub fn array<T: AsVarType>(&self, values: &[T]) -> VarRef {
        assert!(!values.is_empty());
        self.copy_mem(T::var_ty(), bytemuck::cast_slice(values), values.len() as u32)
    }

    fn copy_mem(&self, ty: VarType, bytes: &[u8], size: u32) -> VarRef {
        let flavor = self.data_alloc_type();
        let use_cuda = flavor == AllocType::Device;
        let cuda = if use_cuda {
            self.inner.cuda().map(|c| c.as_ref())
        } else {
            None
        };
        let ptr = self
            .inner
            .alloc
            .alloc(cuda, flavor, bytes.len())
            .expect("allocation failed");
        if use_cuda {
            cuda.unwrap().memcpy_htod(ptr, bytes).expect("upload failed");
        } else {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
            }
        }
        self.map_mem(ty, ptr, size, true)
    }

    pub(crate) fn data_alloc_type(&self) -> AllocType {
        match self.backend {
            Backend::Cuda if self.inner.cuda().is_some() => AllocType::Device,
            Backend::Cuda => AllocType::Host,
            Backend::Llvm => AllocType::HostAsync,
        }
    }

    /// Queues a variable for the next evaluation.
    pub(crate) fn schedule_id(&self, index: VarId) {
        if index == 0 {
            return;
        }
        let mut st = self.lock();
        st.inc_ref_ext(index);
        st.todo.push(index);
    }

    /// Evaluates everything queued on this context.
    pub fn eval(&self) -> Result<()> {
        eval::eval(self)
    }

    /// Blocks until all queued device work completed.
    pub fn sync(&self) -> Result<()> {
        if self.backend == Backend::Cuda {
            if let Some(cuda) = self.inner.cuda() {
                cuda.sync()?;
            }
        }
        Ok(())
    }

    /// Address of the materialized buffer, evaluating first if needed.
    pub(crate) fn var_ptr(&self, index: VarId) -> u64 {
        loop {
            let unevaluated = {
                let st = self.lock();
                let v = st.var(index);
                if v.data != 0 && !v.pending_scatter {
                    return v.data;
                }
                v.data == 0
            };
            if unevaluated {
                self.schedule_id(index);
            }
            // Dirty but materialized: the pending scatter already sits in
            // the queue and the pass below retires it.
            self.eval().expect("evaluation failed");
            assert!(
                !self.lock().var(index).pending_scatter,
                "variable {index} remains dirty after evaluation"
            );
        }
    }

    /// Direct-pointer node over the buffer of `target`, deduplicated by
    /// address. Holds the target through the weak `extra_dep` edge.
    pub(crate) fn pointer_to(&self, target: VarId, _write: bool) -> VarRef {
        let data = self.var_ptr(target);
        let mut st = self.lock();
        if let Some(&hit) = st.variable_from_ptr.get(&data) {
            st.inc_ref_ext(hit);
            return self.make_ref(hit);
        }
        let backend = st.var(target).backend;
        st.inc_ref_ext(target);
        let v = Variable {
            op: Op::Data,
            backend,
            ty: VarType::Pointer,
            size: 1,
            tsize: 1,
            data,
            direct_pointer: true,
            retain_data: true,
            extra_dep: target,
            ..Default::default()
        };
        let index = st.new_var(v, true);
        st.variable_from_ptr.insert(data, index);
        self.finish(st);
        self.make_ref(index)
    }

    /// The implicit lane-in-range mask. Literal true on the GPU path (the
    /// grid-stride loop never oversteps); a `Counter < size` comparison on
    /// the vectorized CPU path, whose loop tail does.
    pub(crate) fn default_mask(&self, size: u32) -> VarRef {
        match self.backend {
            Backend::Cuda => self.literal_bool(true, 1),
            Backend::Llvm => {
                let counter = self.index(size);
                let index =
                    self.new_node(Op::DefaultMask, VarType::Bool, None, &[counter.index], 0);
                self.make_ref(index)
            }
        }
    }

    fn apply_default_mask(&self, backend: Backend, mask: &VarRef, size: u32) -> VarRef {
        match backend {
            Backend::Cuda => mask.clone(),
            Backend::Llvm => mask.and(&self.default_mask(size)),
        }
    }

    /// Marks a freshly built scatter node: side effect, dirty target, queued
    /// for evaluation (the queue owns one external reference).
    fn finish_side_effect(&self, index: VarId, target: VarId) {
        let mut st = self.lock();
        let symbolic = st.symbolic_depth > 0;
        st.inc_ref_ext(target);
        {
            let v = st.var_mut(index);
            v.side_effect = true;
            v.extra_dep = target;
        }
        if !symbolic {
            st.var_mut(target).pending_scatter = true;
            st.inc_ref_ext(index);
            st.todo.push(index);
        }
    }

    fn cuda_for_ptr(&self, ptr: u64) -> Option<&CudaDevice> {
        match self.inner.alloc.malloc_type(ptr) {
            Some(AllocType::Device) | Some(AllocType::HostPinned) => {
                self.inner.cuda().map(|c| c.as_ref())
            }
            _ => None,
        }
    }

    pub(crate) fn read_mem(&self, base: u64, offset: usize, out: &mut [u8]) {
        match self.inner.alloc.malloc_type(base) {
            Some(AllocType::Device) => {
                self.inner
                    .cuda()
                    .expect("device memory without a device")
                    .memcpy_dtoh(out, base + offset as u64)
                    .expect("download failed");
            }
            _ => unsafe {
                std::ptr::copy_nonoverlapping(
                    (base + offset as u64) as *const u8,
                    out.as_mut_ptr(),
                    out.len(),
                );
            },
        }
    }
}

/// Reference-counted handle to a traced variable.
pub struct VarRef {
    jit: Jit,
    pub(crate) index: VarId,
}

impl Clone for VarRef {
    fn clone(&self) -> Self {
        if self.index != 0 {
            self.jit.lock().inc_ref_ext(self.index);
        }
        Self {
            jit: self.jit.clone(),
            index: self.index,
        }
    }
}

impl Drop for VarRef {
    fn drop(&mut self) {
        if self.index != 0 {
            let mut st = self.jit.lock();
            st.dec_ref_ext(self.index);
            self.jit.finish(st);
        }
    }
}

macro_rules! binary_op {
    ($($fn_name:ident => $op:expr;)*) => {
        $(
            pub fn $fn_name(&self, other: &VarRef) -> VarRef {
                let ty = self.ty();
                let index = self.jit.new_node($op, ty, None, &[self.index, other.index], 0);
                self.jit.make_ref(index)
            }
        )*
    };
}

macro_rules! unary_op {
    ($($fn_name:ident => $op:expr;)*) => {
        $(
            pub fn $fn_name(&self) -> VarRef {
                let ty = self.ty();
                let index = self.jit.new_node($op, ty, None, &[self.index], 0);
                self.jit.make_ref(index)
            }
        )*
    };
}

macro_rules! compare_op {
    ($($fn_name:ident => $op:expr;)*) => {
        $(
            pub fn $fn_name(&self, other: &VarRef) -> VarRef {
                let index = self.jit.new_node(
                    $op,
                    VarType::Bool,
                    None,
                    &[self.index, other.index],
                    0,
                );
                self.jit.make_ref(index)
            }
        )*
    };
}

impl VarRef {
    pub fn index(&self) -> VarId {
        self.index
    }

    pub fn is_valid(&self) -> bool {
        self.index != 0
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    pub fn ty(&self) -> VarType {
        self.jit.lock().var(self.index).ty
    }

    pub fn size(&self) -> u32 {
        self.jit.lock().var(self.index).size
    }

    pub fn tsize(&self) -> u32 {
        self.jit.lock().var(self.index).tsize
    }

    pub fn backend(&self) -> Backend {
        self.jit.lock().var(self.index).backend
    }

    pub fn is_evaluated(&self) -> bool {
        self.jit.lock().var(self.index).data != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.jit.lock().var(self.index).pending_scatter
    }

    /// Queues this variable for the next `eval()`.
    pub fn schedule(&self) {
        self.jit.schedule_id(self.index);
    }

    binary_op! {
        add => Op::Add;
        sub => Op::Sub;
        mul => Op::Mul;
        div => Op::Div;
        modulo => Op::Mod;
        mulhi => Op::Mulhi;
        min => Op::Min;
        max => Op::Max;
        and => Op::And;
        or => Op::Or;
        xor => Op::Xor;
        shl => Op::Shl;
        shr => Op::Shr;
    }

    unary_op! {
        neg => Op::Neg;
        not => Op::Not;
        sqrt => Op::Sqrt;
        abs => Op::Abs;
        ceil => Op::Ceil;
        floor => Op::Floor;
        round => Op::Round;
        trunc => Op::Trunc;
        popcount => Op::Popc;
        clz => Op::Clz;
        ctz => Op::Ctz;
    }

    compare_op! {
        eq => Op::Eq;
        neq => Op::Neq;
        lt => Op::Lt;
        le => Op::Le;
        gt => Op::Gt;
        ge => Op::Ge;
    }

    /// `self * b + c` in a single rounding.
    pub fn fma(&self, b: &VarRef, c: &VarRef) -> VarRef {
        let ty = self.ty();
        let index = self
            .jit
            .new_node(Op::Fma, ty, None, &[self.index, b.index, c.index], 0);
        self.jit.make_ref(index)
    }

    /// `self * b - c`.
    pub fn fmsub(&self, b: &VarRef, c: &VarRef) -> VarRef {
        self.fma(b, &c.neg())
    }

    /// `-(self * b) - c`.
    pub fn fnmsub(&self, b: &VarRef, c: &VarRef) -> VarRef {
        self.neg().fma(b, &c.neg())
    }

    pub fn cast(&self, ty: VarType) -> VarRef {
        let index = self.jit.new_node(Op::Cast, ty, None, &[self.index], 0);
        self.jit.make_ref(index)
    }

    pub fn bitcast(&self, ty: VarType) -> VarRef {
        assert_eq!(
            ty.size(),
            self.ty().size(),
            "bitcast between types of different size"
        );
        let index = self.jit.new_node(Op::Bitcast, ty, None, &[self.index], 0);
        self.jit.make_ref(index)
    }

    /// Lane-wise choice; `self` is the boolean condition.
    pub fn select(&self, if_true: &VarRef, if_false: &VarRef) -> VarRef {
        assert!(self.ty().is_bool(), "select(): condition must be boolean");
        let ty = if_true.ty();
        let index = self.jit.new_node(
            Op::Select,
            ty,
            None,
            &[self.index, if_true.index, if_false.index],
            0,
        );
        self.jit.make_ref(index)
    }

    /// Reads `self[index]` for every lane of `index`. The source is
    /// materialized first; inactive lanes yield zero.
    pub fn gather(&self, index: &VarRef, mask: &VarRef) -> VarRef {
        let ty = self.ty();
        let backend = self.backend();
        let ptr = self.jit.pointer_to(self.index, false);
        let mask = self.jit.apply_default_mask(backend, mask, index.size());
        let id = self.jit.new_node(
            Op::Gather,
            ty,
            None,
            &[ptr.index, index.index, mask.index],
            0,
        );
        self.jit.make_ref(id)
    }

    /// Writes `self` into `target[index]`, replacing previous contents.
    pub fn scatter(&self, target: &VarRef, index: &VarRef, mask: &VarRef) -> VarRef {
        self.scatter_reduce(ReduceOp::None, target, index, mask)
    }

    /// Atomic read-modify-write scatter.
    pub fn scatter_reduce(
        &self,
        op: ReduceOp,
        target: &VarRef,
        index: &VarRef,
        mask: &VarRef,
    ) -> VarRef {
        let backend = self.backend();
        let ptr = self.jit.pointer_to(target.index, true);
        let size = self.size().max(index.size()).max(mask.size());
        let mask = self.jit.apply_default_mask(backend, mask, size);
        let id = self.jit.new_node(
            Op::Scatter(op),
            VarType::Void,
            Some(size),
            &[ptr.index, self.index, index.index, mask.index],
            0,
        );
        self.jit.finish_side_effect(id, target.index);
        self.jit.make_ref(id)
    }

    /// Atomically increments `self[index]` and returns the previous value
    /// per active lane.
    pub fn scatter_inc(&self, index: &VarRef, mask: &VarRef) -> VarRef {
        assert_eq!(self.ty(), VarType::U32, "scatter_inc(): target must be u32");
        let backend = self.backend();
        let ptr = self.jit.pointer_to(self.index, true);
        let size = index.size().max(mask.size());
        let mask = self.jit.apply_default_mask(backend, mask, size);
        let id = self.jit.new_node(
            Op::ScatterInc,
            VarType::U32,
            Some(size),
            &[ptr.index, index.index, mask.index],
            0,
        );
        self.jit.finish_side_effect(id, self.index);
        self.jit.make_ref(id)
    }

    /// Duplicates the variable. Evaluated contents are copied; symbolic
    /// nodes get a fresh identity that bypasses the CSE cache.
    pub fn copy(&self) -> VarRef {
        let st = self.jit.lock();
        let v = st.var(self.index);
        if v.direct_pointer {
            drop(st);
            return self.clone();
        }
        if v.data != 0 {
            let ty = v.ty;
            let size = v.size;
            let bytes = size as usize * ty.size();
            let src = v.data;
            drop(st);
            let flavor = self.jit.data_alloc_type();
            let use_cuda = flavor == AllocType::Device;
            let cuda = if use_cuda {
                self.jit.inner.cuda().map(|c| c.as_ref())
            } else {
                None
            };
            let dst = self
                .jit
                .inner
                .alloc
                .alloc(cuda, flavor, bytes)
                .expect("allocation failed");
            self.jit
                .inner
                .alloc
                .memcpy_async(cuda, dst, src, bytes)
                .expect("copy failed");
            self.jit.map_mem(ty, dst, size, true)
        } else {
            let mut clone = v.clone();
            drop(st);
            clone.ref_count_ext = 0;
            clone.ref_count_int = 0;
            clone.has_extra = false;
            clone.side_effect = false;
            clone.pending_scatter = false;
            let mut st = self.jit.lock();
            for dep in clone.dep {
                st.inc_ref_int(dep);
            }
            st.inc_ref_ext(clone.extra_dep);
            let index = st.new_var(clone, true);
            self.jit.finish(st);
            self.jit.make_ref(index)
        }
    }

    /// Returns a variable of the requested size. Only scalars can change
    /// size; a uniquely owned symbolic scalar is resized in place, anything
    /// else goes through a broadcasting no-op node.
    pub fn resize(&self, size: u32) -> VarRef {
        let mut st = self.jit.lock();
        let v = st.var(self.index);
        if v.size == size {
            st.inc_ref_ext(self.index);
            return self.jit.make_ref(self.index);
        }
        assert_eq!(
            v.size, 1,
            "resize(): variable {} must be a scalar",
            self.index
        );
        if !v.is_data() && v.ref_count_int == 0 && v.ref_count_ext == 1 {
            st.cse_drop(self.index);
            st.var_mut(self.index).size = size;
            st.inc_ref_ext(self.index);
            return self.jit.make_ref(self.index);
        }
        if v.is_literal_zero {
            let ty = v.ty;
            drop(st);
            return self.jit.literal_bits(ty, 0, size);
        }
        let ty = v.ty;
        drop(st);
        // Broadcast through an addition with zero, then widen the result.
        let zero = self.jit.literal_bits(ty, 0, 1);
        let moved = self.add(&zero);
        let mut st = self.jit.lock();
        st.cse_drop(moved.index);
        st.var_mut(moved.index).size = size;
        drop(st);
        moved
    }

    /// Reads one element, evaluating the variable first if needed.
    pub fn item<T: AsVarType>(&self, offset: u32) -> T {
        assert_eq!(T::var_ty(), self.ty(), "item(): type mismatch");
        let bits = self.item_bits(offset);
        let mut out = T::zeroed();
        let size = core::mem::size_of::<T>();
        bytemuck::bytes_of_mut(&mut out).copy_from_slice(&bits.to_le_bytes()[..size]);
        out
    }

    pub(crate) fn item_bits(&self, offset: u32) -> u64 {
        let (ty, size) = {
            let st = self.jit.lock();
            let v = st.var(self.index);
            (v.ty, v.size)
        };
        assert!(offset < size, "item(): offset {offset} out of bounds ({size})");
        let data = self.jit.var_ptr(self.index);
        self.jit.sync().expect("sync failed");
        let tsize = ty.size();
        let mut bytes = [0u8; 8];
        self.jit
            .read_mem(data, offset as usize * tsize, &mut bytes[..tsize]);
        u64::from_le_bytes(bytes)
    }

    /// Writes one element. Returns a handle to the written variable, which
    /// is a fresh copy when the storage was shared.
    pub fn write_item<T: AsVarType>(&self, offset: u32, value: T) -> VarRef {
        assert_eq!(T::var_ty(), self.ty(), "write_item(): type mismatch");
        assert!(offset < self.size());
        self.jit.var_ptr(self.index);
        self.jit.sync().expect("sync failed");

        let st = self.jit.lock();
        let v = st.var(self.index);
        let shared = v.ref_count_ext + v.ref_count_int > 1;
        let tsize = v.ty.size();
        drop(st);

        let dst = if shared { self.copy() } else { self.clone() };
        let base = self.jit.var_ptr(dst.index);
        let cuda = self.jit.cuda_for_ptr(base);
        self.jit
            .inner
            .alloc
            .poke(
                cuda,
                base + (offset as usize * tsize) as u64,
                value.to_bits(),
                tsize,
            )
            .expect("write failed");
        dst
    }

    /// Copies the evaluated contents back to the host.
    pub fn to_vec<T: AsVarType>(&self) -> Vec<T> {
        assert_eq!(T::var_ty(), self.ty(), "to_vec(): type mismatch");
        let size = self.size() as usize;
        let data = self.jit.var_ptr(self.index);
        self.jit.sync().expect("sync failed");
        let mut out = vec![T::zeroed(); size];
        self.jit.read_mem(data, 0, bytemuck::cast_slice_mut(&mut out));
        out
    }

    pub fn set_label(&self, label: &str) {
        let mut st = self.jit.lock();
        st.var_mut(self.index).has_extra = true;
        st.extra.entry(self.index).or_default().label = Some(label.to_string());
    }

    pub fn label(&self) -> Option<String> {
        self.jit
            .lock()
            .extra
            .get(&self.index)
            .and_then(|e| e.label.clone())
    }

    /// Registers a callback invoked when the variable is destroyed. The
    /// callback runs outside the context lock.
    pub fn set_free_callback(&self, cb: impl FnOnce(VarId) + Send + 'static) {
        let mut st = self.jit.lock();
        st.var_mut(self.index).has_extra = true;
        let extra = st.extra.entry(self.index).or_default();
        assert!(
            extra.free_callback.is_none(),
            "set_free_callback(): a callback was already registered"
        );
        extra.free_callback = Some(Box::new(cb));
    }
}

impl fmt::Debug for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.jit.lock();
        let v = st.var(self.index);
        f.debug_struct("VarRef")
            .field("index", &self.index)
            .field("op", &v.op)
            .field("ty", &v.ty)
            .field("size", &v.size)
            .finish()
    }
}

/// Renders the evaluated contents; forces an evaluation pass.
impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = self.ty();
        let size = self.size();
        write!(f, "[")?;
        for i in 0..size {
            if i > 0 {
                write!(f, ", ")?;
            }
            let bits = self.item_bits(i);
            match ty {
                VarType::Bool => write!(f, "{}", bits & 1 != 0)?,
                VarType::F16 => write!(f, "{}", half::f16::from_bits(bits as u16))?,
                VarType::F32 => write!(f, "{}", f32::from_bits(bits as u32))?,
                VarType::F64 => write!(f, "{}", f64::from_bits(bits))?,
                t if t.is_sint() => {
                    let shift = 64 - 8 * t.size() as u32;
                    write!(f, "{}", ((bits << shift) as i64) >> shift)?
                }
                _ => write!(f, "{bits}")?,
            }
        }
        write!(f, "]")
    }
}

/// Symbolic loop and call recording (CPU backend).
impl Jit {
    /// Opens a symbolic loop over the given state variables. Returns the
    /// loop anchor and one phi per state slot.
    pub fn loop_start(&self, state_vars: &[&VarRef]) -> (VarRef, Vec<VarRef>) {
        assert!(!state_vars.is_empty());
        let size = state_vars.iter().map(|v| v.size()).max().unwrap();
        let start = self.new_node(Op::LoopStart, VarType::Void, Some(size), &[], 0);
        let mut phis = Vec::with_capacity(state_vars.len());
        for (slot, var) in state_vars.iter().enumerate() {
            let ty = var.ty();
            let phi = self.new_node(
                Op::LoopPhi,
                ty,
                Some(size),
                &[start, var.index],
                slot as u64,
            );
            phis.push(self.make_ref(phi));
        }
        let mut st = self.lock();
        st.loops.insert(
            start,
            LoopData {
                outer_in: state_vars.iter().map(|v| v.index).collect(),
                phis: phis.iter().map(|v| v.index).collect(),
                inner_out: Vec::new(),
            },
        );
        st.symbolic_depth += 1;
        drop(st);
        (self.make_ref(start), phis)
    }

    /// Declares the loop continuation mask.
    pub fn loop_cond(&self, start: &VarRef, mask: &VarRef) -> VarRef {
        assert!(mask.ty().is_bool());
        let index = self.new_node(
            Op::LoopCond,
            VarType::Void,
            Some(start.size()),
            &[start.index, mask.index],
            0,
        );
        self.make_ref(index)
    }

    /// Closes the loop; `inner_out` are the per-slot updated state values.
    /// Returns one output handle per state slot.
    pub fn loop_end(&self, start: &VarRef, cond: &VarRef, inner_out: &[&VarRef]) -> Vec<VarRef> {
        let end = self.new_node(
            Op::LoopEnd,
            VarType::Void,
            Some(start.size()),
            &[start.index, cond.index],
            0,
        );
        let ids: Vec<VarId> = inner_out.iter().map(|v| v.index).collect();
        let mut st = self.lock();
        {
            let data = st.loops.get_mut(&start.index).expect("unknown loop");
            assert_eq!(
                data.outer_in.len(),
                inner_out.len(),
                "loop_end(): state arity mismatch"
            );
            data.inner_out = ids.clone();
        }
        for &id in &ids {
            st.inc_ref_int(id);
        }
        st.symbolic_depth -= 1;
        drop(st);

        let mut outputs = Vec::with_capacity(inner_out.len());
        for (slot, var) in inner_out.iter().enumerate() {
            let ty = var.ty();
            let out = self.new_node(Op::LoopOutput, ty, Some(start.size()), &[end], slot as u64);
            outputs.push(self.make_ref(out));
        }
        // The end node lives on through the outputs' dependency edges.
        drop(self.make_ref(end));
        outputs
    }

    /// Records an indirect call: `self_idx` holds 1-based instance indices
    /// (0 = skip), `callables` are pre-assembled IR functions, one per
    /// instance, each with signature `void(<W x i1> mask, i8* params)` and
    /// entry names matching `entries`.
    pub fn call(
        &self,
        name: &str,
        self_idx: &VarRef,
        mask: &VarRef,
        inputs: &[&VarRef],
        out_tys: &[VarType],
        callables: Vec<String>,
        entries: Vec<String>,
    ) -> Vec<VarRef> {
        assert_eq!(self_idx.ty(), VarType::U32);
        assert_eq!(callables.len(), entries.len());
        let size = self_idx.size();
        let mask = self.apply_default_mask(self_idx.backend(), mask, size);
        let call = self.new_node(
            Op::Call,
            VarType::Void,
            Some(size),
            &[self_idx.index, mask.index],
            callables.len() as u64,
        );
        let mut st = self.lock();
        for v in inputs {
            st.inc_ref_int(v.index);
        }
        st.calls.insert(
            call,
            CallData {
                name: name.to_string(),
                n_inst: callables.len() as u32,
                inputs: inputs.iter().map(|v| v.index).collect(),
                out_tys: out_tys.to_vec(),
                outputs: Vec::new(),
                callables,
                entries,
            },
        );
        drop(st);

        let mut outputs = Vec::with_capacity(out_tys.len());
        for (slot, ty) in out_tys.iter().enumerate() {
            let out = self.new_node(Op::CallOutput, *ty, Some(size), &[call], slot as u64);
            outputs.push(self.make_ref(out));
        }
        let ids: Vec<VarId> = outputs.iter().map(|o| o.index).collect();
        self.lock().calls.get_mut(&call).unwrap().outputs = ids;
        // The call node lives on through the outputs' dependency edges.
        drop(self.make_ref(call));
        outputs
    }
}
