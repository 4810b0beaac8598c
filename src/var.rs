//! Variable arena, reference counting and common-subexpression elimination.
//!
//! Every traced value is a `Variable` stored under a nonzero 32-bit index;
//! index 0 is the "no variable" sentinel. Variables hold up to four operand
//! dependencies and two reference counts: the external count tracks user
//! handles, the internal count tracks in-edges from other live variables.
//! A variable is destroyed the moment both counts reach zero, which
//! decrements the internal count of its dependencies and may cascade.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::kernel::Kernel;
use crate::op::Op;
use crate::vartype::VarType;

pub type VarId = u32;

#[derive(Clone, Debug, Default)]
pub struct Variable {
    pub op: Op,
    pub backend: Backend,
    pub ty: VarType,
    /// Logical element count; 1 denotes a scalar broadcast.
    pub size: u32,
    /// Tree size: 1 plus the sum of the dependencies' tree sizes. Used as a
    /// conservative depth key when ordering children in the scheduler.
    pub tsize: u32,
    pub dep: [VarId; 4],
    /// Weak lifetime edge from a side effect to its target. Holds an
    /// external reference but is invisible to code generation.
    pub extra_dep: VarId,
    /// Payload: literal bits, phi/output slot, call instance count, ...
    pub literal: u64,
    /// Address of the materialized buffer; 0 while unevaluated.
    pub data: u64,
    pub ref_count_ext: u32,
    pub ref_count_int: u32,

    pub direct_pointer: bool,
    pub retain_data: bool,
    pub side_effect: bool,
    /// Some scatter targets this variable; it must be re-evaluated before
    /// any read observes the buffer.
    pub pending_scatter: bool,
    pub is_literal_zero: bool,
    pub is_literal_one: bool,
    pub unaligned: bool,
    pub has_extra: bool,
    /// Recorded inside a symbolic region (loop or call body).
    pub symbolic: bool,
}

impl Variable {
    pub fn is_data(&self) -> bool {
        matches!(self.op, Op::Data)
    }
}

/// Structural identity of a symbolic node, the CSE cache key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VariableKey {
    backend: Backend,
    ty: VarType,
    size: u32,
    op: Op,
    literal: u64,
    dep: [VarId; 4],
}

impl VariableKey {
    fn new(v: &Variable) -> Self {
        Self {
            backend: v.backend,
            ty: v.ty,
            size: v.size,
            op: v.op.clone(),
            literal: v.literal,
            dep: v.dep,
        }
    }
}

/// Ancillary per-variable record: label and free callback.
#[derive(Default)]
pub struct Extra {
    pub label: Option<String>,
    pub free_callback: Option<Box<dyn FnOnce(VarId) + Send>>,
}

/// Shared record of a symbolic loop, owned by its `LoopStart` variable.
/// The record holds an internal reference to each body output so the loop
/// body stays alive until the kernel is assembled.
#[derive(Debug, Default, Clone)]
pub struct LoopData {
    pub outer_in: Vec<VarId>,
    pub phis: Vec<VarId>,
    pub inner_out: Vec<VarId>,
}

/// Shared record of an indirect call, owned by its `Call` variable.
#[derive(Debug, Default, Clone)]
pub struct CallData {
    pub name: String,
    pub n_inst: u32,
    /// Staged through the stack buffer; holds internal references.
    pub inputs: Vec<VarId>,
    pub out_tys: Vec<VarType>,
    pub outputs: Vec<VarId>,
    /// Pre-assembled callable bodies, one per instance, each defining
    /// `void @<entry>(<W x i1> %mask, {i8*} noalias %params)`.
    pub callables: Vec<String>,
    pub entries: Vec<String>,
}

/// Graph state of one JIT context. Guarded by the context mutex; driver
/// calls, allocator growth and user callbacks all happen outside of it.
pub struct State {
    pub variables: HashMap<VarId, Variable>,
    variable_index: VarId,
    /// Reverse map deduplicating direct-pointer nodes by address.
    pub variable_from_ptr: HashMap<u64, VarId>,
    pub cse_cache: HashMap<VariableKey, VarId>,
    pub extra: HashMap<VarId, Extra>,
    pub loops: HashMap<VarId, LoopData>,
    pub calls: HashMap<VarId, CallData>,
    /// Kernels memoized by their full source text.
    pub kernels: HashMap<String, Arc<Kernel>>,
    /// Roots queued for the next evaluation, in user order. The queue owns
    /// one external reference per entry.
    pub todo: Vec<VarId>,
    pub enable_cse: bool,
    pub parallel_dispatch: bool,
    /// Overrides the auto-detected CPU vector width.
    pub vector_width: Option<u32>,
    /// Depth of the symbolic region currently being recorded.
    pub symbolic_depth: u32,
    /// Running count of freshly constructed (non-CSE-hit) nodes.
    pub nodes_created: u64,
    /// Buffers whose owning variables died; released on the next unlock.
    pub dead_data: Vec<u64>,
    /// Free callbacks collected during cascading destruction; invoked after
    /// the state lock is released.
    pub pending_callbacks: Vec<(Box<dyn FnOnce(VarId) + Send>, VarId)>,
    /// Schedule carried from assembly to the post-launch cleanup.
    pub eval_scratch: Option<crate::eval::EvalScratch>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            variables: HashMap::new(),
            variable_index: 1,
            variable_from_ptr: HashMap::new(),
            cse_cache: HashMap::new(),
            extra: HashMap::new(),
            loops: HashMap::new(),
            calls: HashMap::new(),
            kernels: HashMap::new(),
            todo: Vec::new(),
            enable_cse: true,
            parallel_dispatch: true,
            vector_width: None,
            symbolic_depth: 0,
            nodes_created: 0,
            dead_data: Vec::new(),
            pending_callbacks: Vec::new(),
            eval_scratch: None,
        }
    }
}

impl State {
    pub fn var(&self, index: VarId) -> &Variable {
        self.variables
            .get(&index)
            .unwrap_or_else(|| panic!("var({index}): unknown variable"))
    }

    pub fn var_mut(&mut self, index: VarId) -> &mut Variable {
        self.variables
            .get_mut(&index)
            .unwrap_or_else(|| panic!("var({index}): unknown variable"))
    }

    pub fn inc_ref_ext(&mut self, index: VarId) {
        if index == 0 {
            return;
        }
        let v = self.var_mut(index);
        v.ref_count_ext += 1;
        log::trace!("inc_ref_ext({index}): {}", v.ref_count_ext);
    }

    pub fn inc_ref_int(&mut self, index: VarId) {
        if index == 0 {
            return;
        }
        let v = self.var_mut(index);
        v.ref_count_int += 1;
        log::trace!("inc_ref_int({index}): {}", v.ref_count_int);
    }

    pub fn dec_ref_ext(&mut self, index: VarId) {
        if index == 0 {
            return;
        }
        let v = self.var_mut(index);
        assert!(
            v.ref_count_ext != 0,
            "dec_ref_ext(): variable {index} has no external references"
        );
        v.ref_count_ext -= 1;
        log::trace!("dec_ref_ext({index}): {}", v.ref_count_ext);
        if v.ref_count_ext == 0 && v.ref_count_int == 0 {
            self.free_var(index);
        }
    }

    pub fn dec_ref_int(&mut self, index: VarId) {
        if index == 0 {
            return;
        }
        let v = self.var_mut(index);
        assert!(
            v.ref_count_int != 0,
            "dec_ref_int(): variable {index} has no internal references"
        );
        v.ref_count_int -= 1;
        log::trace!("dec_ref_int({index}): {}", v.ref_count_int);
        if v.ref_count_ext == 0 && v.ref_count_int == 0 {
            self.free_var(index);
        }
    }

    /// Destroys a variable whose reference counts both reached zero.
    fn free_var(&mut self, index: VarId) {
        log::trace!("free_var({index})");
        let v = self.variables.remove(&index).unwrap();

        if !v.is_data() {
            self.cse_drop_with(index, &v);
        }

        if v.data != 0 && !v.retain_data && !v.direct_pointer {
            self.dead_data.push(v.data);
        }

        if v.direct_pointer {
            let removed = self.variable_from_ptr.remove(&v.data);
            assert!(
                removed == Some(index),
                "free_var({index}): direct pointer entry not found"
            );
        }

        // Loop and call records own internal references to their body
        // outputs / staged inputs; return them along with the record.
        match v.op {
            Op::LoopStart => {
                if let Some(data) = self.loops.remove(&index) {
                    for out in data.inner_out {
                        self.dec_ref_int(out);
                    }
                }
            }
            Op::Call => {
                if let Some(data) = self.calls.remove(&index) {
                    for input in data.inputs {
                        self.dec_ref_int(input);
                    }
                }
            }
            _ => {}
        }

        for dep in v.dep {
            if dep == 0 {
                break;
            }
            self.dec_ref_int(dep);
        }
        self.dec_ref_ext(v.extra_dep);

        if v.has_extra {
            let extra = self
                .extra
                .remove(&index)
                .expect("free_var(): missing 'extra' record");
            if let Some(cb) = extra.free_callback {
                // Deferred: user code must not run under the state lock.
                self.pending_callbacks.push((cb, index));
            }
        }
    }

    /// Removes the CSE entry of `index` if it is still the canonical node.
    pub fn cse_drop(&mut self, index: VarId) {
        let v = self.var(index).clone();
        self.cse_drop_with(index, &v);
    }

    fn cse_drop_with(&mut self, index: VarId, v: &Variable) {
        if self.cse_cache.is_empty() {
            return;
        }
        let key = VariableKey::new(v);
        if self.cse_cache.get(&key) == Some(&index) {
            self.cse_cache.remove(&key);
        }
    }

    /// Appends a variable to the trace, or returns an equivalent existing
    /// node. Assumes the caller already bumped the internal count of each
    /// dependency; on a CSE hit those references are returned. The result
    /// carries one fresh external reference.
    pub fn new_var(&mut self, v: Variable, disable_cse: bool) -> VarId {
        let is_special = matches!(v.ty, VarType::Void | VarType::Global);
        let disable_cse = v.is_data()
            || v.direct_pointer
            || is_special
            || v.op.is_side_effect()
            || !self.enable_cse
            || disable_cse;

        if !disable_cse {
            let key = VariableKey::new(&v);
            if let Some(&hit) = self.cse_cache.get(&key) {
                // Found a structural match; give back the operand references
                // taken for the candidate.
                for dep in v.dep {
                    self.dec_ref_int(dep);
                }
                self.dec_ref_ext(v.extra_dep);
                self.inc_ref_ext(hit);
                log::trace!("new_var({hit}): {:?} (reused)", self.var(hit).op);
                return hit;
            }
        }

        let index = self.insert(v);
        if !disable_cse {
            let key = VariableKey::new(self.var(index));
            self.cse_cache.insert(key, index);
        }
        self.nodes_created += 1;
        let v = self.var_mut(index);
        v.ref_count_ext = 1;
        log::trace!("new_var({index}): {:?}", self.var(index).op);
        index
    }

    fn insert(&mut self, v: Variable) -> VarId {
        loop {
            let index = self.variable_index;
            self.variable_index = self.variable_index.wrapping_add(1);
            if index == 0 {
                // Overflow skips the sentinel.
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = self.variables.entry(index) {
                slot.insert(v);
                return index;
            }
        }
    }

    /// Number of live variables (diagnostics and tests).
    pub fn n_variables(&self) -> usize {
        self.variables.len()
    }
}
