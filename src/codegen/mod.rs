//! Backend-independent half of kernel assembly: register numbering,
//! input/output classification, parameter marshalling and kernel identity.

pub mod cuda;
pub mod llvm;
pub mod template;

use std::collections::HashMap;

use indexmap::IndexSet;

use crate::backend::Backend;
use crate::op::Op;
use crate::var::{State, VarId};

/// Registers 0..3 of every class are scratch for compound lowerings;
/// variable registers start here.
pub const REGISTER_OFFSET: u32 = 4;

/// Parameters are passed individually below this count, and through a
/// pointer table at or above it.
pub const DIRECT_PARAM_LIMIT: u32 = 128;

/// Knobs of the CPU emitter, mirrored from the loaded LLVM library (or
/// defaults when code is generated without one).
#[derive(Clone, Debug)]
pub struct CodegenOptions {
    pub width: u32,
    pub opaque_pointers: bool,
    pub target_cpu: String,
    pub target_features: String,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            width: 8,
            opaque_pointers: true,
            target_cpu: "generic".to_string(),
            target_features: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Entry {
    pub id: VarId,
    /// Materialized or direct pointer: loaded from a parameter slot.
    pub input: bool,
    /// Stored back to a parameter slot after computation.
    pub output: bool,
}

/// Per-group assembly layout shared by both emitters.
pub(crate) struct Layout {
    pub entries: Vec<Entry>,
    /// Register number per variable (sequential per type-class).
    reg: HashMap<VarId, u32>,
    /// Position in the overall schedule, used for loop/call labels.
    serial: HashMap<VarId, u32>,
    /// Parameter slots in first-use order (inputs and outputs).
    pub params: IndexSet<VarId>,
    pub n_in: u32,
    pub n_out: u32,
    pub outputs: Vec<VarId>,
}

impl Layout {
    pub fn reg(&self, id: VarId) -> u32 {
        self.reg[&id]
    }

    pub fn serial(&self, id: VarId) -> u32 {
        self.serial[&id]
    }

    pub fn has_reg(&self, id: VarId) -> bool {
        self.reg.contains_key(&id)
    }

    pub fn param_slot(&self, id: VarId) -> u32 {
        self.params.get_index_of(&id).expect("missing parameter slot") as u32
    }

    pub fn n_params(&self) -> u32 {
        self.n_in + self.n_out
    }

    pub fn param_direct(&self) -> bool {
        self.n_params() < DIRECT_PARAM_LIMIT
    }
}

/// Classifies one scheduled group and assigns registers.
///
/// Register numbers are handed out per type-class in schedule order,
/// starting at `REGISTER_OFFSET`. Loop outputs alias the register of their
/// phi so no copy is needed when the loop closes.
pub(crate) fn layout(st: &State, backend: Backend, size: u32, group: &[VarId]) -> Layout {
    let mut layout = Layout {
        entries: Vec::with_capacity(group.len()),
        reg: HashMap::new(),
        serial: HashMap::new(),
        params: IndexSet::new(),
        n_in: 0,
        n_out: 0,
        outputs: Vec::new(),
    };
    let mut counters: HashMap<&'static str, u32> = HashMap::new();

    for (i, &id) in group.iter().enumerate() {
        let v = st.var(id);
        assert!(
            v.size == 1 || v.size == size,
            "group of size {size} contains variable {id} of size {}",
            v.size
        );

        let input = v.data != 0;
        let output = !input
            && !v.side_effect
            && v.ref_count_ext > 0
            && v.size == size
            && v.ty.size() > 0
            && !matches!(v.op, Op::LoopPhi);

        layout.serial.insert(id, i as u32);

        let reg = match &v.op {
            Op::LoopOutput => {
                // dep[0] is the loop end; its dep[0] the loop start.
                let start = st.var(v.dep[0]).dep[0];
                let phi = st.loops[&start].phis[v.literal as usize];
                layout.reg[&phi]
            }
            _ => {
                let class = match backend {
                    Backend::Cuda => v.ty.prefix_ptx(),
                    Backend::Llvm => v.ty.prefix_llvm(),
                };
                let counter = counters.entry(class).or_insert(REGISTER_OFFSET);
                let reg = *counter;
                *counter += 1;
                reg
            }
        };
        layout.reg.insert(id, reg);

        if input {
            layout.params.insert(id);
            layout.n_in += 1;
        } else if output {
            layout.params.insert(id);
            layout.n_out += 1;
            layout.outputs.push(id);
        }

        layout.entries.push(Entry { id, input, output });
    }

    layout
}

/// Eight-character placeholder patched with the CRC32 of the emitted body.
/// The hash is computed while the placeholder is still in place so that
/// textually identical kernels share identity regardless of their name.
pub(crate) fn patch_kernel_name(source: &mut String, placeholder: char) -> String {
    let hash = crc32fast::hash(source.as_bytes());
    let hex = format!("{hash:08x}");
    let needle: String = std::iter::repeat(placeholder).take(8).collect();
    let pos = source
        .find(&needle)
        .expect("kernel name placeholder not found");
    source.replace_range(pos..pos + 8, &hex);
    hex
}

/// A kernel ready to compile and launch.
pub(crate) struct Program {
    pub backend: Backend,
    pub size: u32,
    pub source: String,
    pub entry: String,
    /// Buffer addresses in parameter-slot order.
    pub params: Vec<u64>,
    pub param_direct: bool,
}
