//! Scheduler and evaluation driver.
//!
//! Evaluation drains the context's queue, partitions the reachable graph
//! into size-homogeneous groups, assembles one kernel per group (largest
//! first, to maximize device occupancy), runs them through the kernel cache
//! and finally drops the internal edges of everything that was computed —
//! which cascades reference-count collection of intermediate values.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::backend::{Backend, Result};
use crate::codegen::{self, CodegenOptions, Program};
use crate::context::Jit;
use crate::kernel;
use crate::op::Op;
use crate::var::{State, VarId};

/// Recursive traversal collecting the nodes a root needs, keyed by the
/// root's size. Children are visited in order of descending tree size so
/// that heavy subexpressions are emitted first and release their registers
/// sooner, mirroring what register-pressure analysis would pick. A fourth
/// dependency (always a scatter mask) follows the sorted three.
fn traverse(
    st: &State,
    visited: &mut HashSet<(u32, VarId)>,
    schedule: &mut HashMap<u32, Vec<VarId>>,
    size: u32,
    index: VarId,
) {
    if index == 0 || !visited.insert((size, index)) {
        return;
    }

    let v = st.var(index);
    let dep = v.dep;

    let tsize = |id: VarId| if id == 0 { 0 } else { st.var(id).tsize };
    let mut ch = [
        (dep[0], tsize(dep[0])),
        (dep[1], tsize(dep[1])),
        (dep[2], tsize(dep[2])),
    ];

    // Three-element sorting network, largest first.
    if ch[1].1 < ch[2].1 {
        ch.swap(1, 2);
    }
    if ch[0].1 < ch[2].1 {
        ch.swap(0, 2);
    }
    if ch[0].1 < ch[1].1 {
        ch.swap(0, 1);
    }

    match &v.op {
        Op::LoopStart => {
            // The loop record reaches its state inputs and phis outside the
            // dependency slots; phis must directly follow the loop anchor so
            // they open the condition block.
            let data = st.loops[&index].clone();
            for outer in &data.outer_in {
                traverse(st, visited, schedule, size, *outer);
            }
            schedule.entry(size).or_default().push(index);
            for phi in &data.phis {
                traverse(st, visited, schedule, size, *phi);
            }
            return;
        }
        Op::LoopEnd => {
            for (id, _) in ch {
                traverse(st, visited, schedule, size, id);
            }
            let data = st.loops[&st.var(index).dep[0]].clone();
            for inner in &data.inner_out {
                traverse(st, visited, schedule, size, *inner);
            }
        }
        Op::Call => {
            for (id, _) in ch {
                traverse(st, visited, schedule, size, id);
            }
            let data = st.calls[&index].clone();
            for input in &data.inputs {
                traverse(st, visited, schedule, size, *input);
            }
        }
        _ => {
            for (id, _) in ch {
                traverse(st, visited, schedule, size, id);
            }
            traverse(st, visited, schedule, size, dep[3]);
        }
    }

    schedule.entry(size).or_default().push(index);
}

/// Resolves the CPU emitter options from the loaded library, the width
/// override, or defaults when neither exists.
fn llvm_options(jit: &Jit, width_override: Option<u32>) -> CodegenOptions {
    let mut opts = match jit.inner.llvm() {
        Some(llvm) => CodegenOptions {
            width: llvm.width,
            opaque_pointers: llvm.opaque_pointers,
            target_cpu: llvm.target_cpu.clone(),
            target_features: llvm.target_features.clone(),
        },
        None => CodegenOptions::default(),
    };
    if let Some(width) = width_override {
        opts.width = width;
    }
    opts
}

/// Builds the schedule for everything queued and assembles one program per
/// size group, allocating output buffers along the way. Shared between
/// `eval` and the compilation tests.
pub(crate) fn assemble(jit: &Jit) -> Result<Vec<Program>> {
    let width_override = jit.lock().vector_width;
    let opts = llvm_options(jit, width_override);

    let mut st = jit.lock();
    let todo = std::mem::take(&mut st.todo);
    if todo.is_empty() {
        return Ok(Vec::new());
    }

    let mut visited = HashSet::new();
    let mut schedule: HashMap<u32, Vec<VarId>> = HashMap::new();
    for &root in &todo {
        let size = st.var(root).size;
        traverse(&st, &mut visited, &mut schedule, size, root);
    }

    // Unique sizes, largest batch first.
    let sizes: Vec<u32> = todo
        .iter()
        .map(|&root| st.var(root).size)
        .sorted_unstable_by(|a, b| b.cmp(a))
        .dedup()
        .collect();

    log::debug!(
        "eval(): {} group(s), {} variable(s) queued",
        sizes.len(),
        todo.len()
    );

    let mut programs = Vec::with_capacity(sizes.len());
    let mut layouts = Vec::with_capacity(sizes.len());
    let mut pending: Vec<(VarId, usize)> = Vec::new();
    for &size in &sizes {
        let group = &schedule[&size];
        let backend = st.var(group[group.len() - 1]).backend;
        let layout = codegen::layout(&st, backend, size, group);

        let (source, entry) = match backend {
            Backend::Cuda => codegen::cuda::emit(&st, &layout, size),
            Backend::Llvm => codegen::llvm::emit(&st, &layout, size, &opts),
        };

        for &out in &layout.outputs {
            let v = st.var(out);
            pending.push((out, v.size as usize * v.ty.size()));
        }

        log::trace!(
            "assembled {entry} (n={size}, in={}, out={}, ops={})",
            layout.n_in,
            layout.n_out,
            layout.entries.len()
        );

        programs.push(Program {
            backend,
            size,
            source,
            entry,
            params: Vec::new(),
            param_direct: layout.param_direct(),
        });
        layouts.push(layout);
    }
    drop(st);

    // Materialize the outputs; allocation may call into the driver and runs
    // outside the state lock.
    let flavor = jit.data_alloc_type();
    let cuda = if flavor == crate::malloc::AllocType::Device {
        jit.inner.cuda().map(|c| c.as_ref())
    } else {
        None
    };
    let mut buffers = Vec::with_capacity(pending.len());
    for &(out, bytes) in &pending {
        buffers.push((out, jit.inner.alloc.alloc(cuda, flavor, bytes)?));
    }

    let mut st = jit.lock();
    for (out, ptr) in buffers {
        st.var_mut(out).data = ptr;
    }
    for (program, layout) in programs.iter_mut().zip(&layouts) {
        program.params = layout.params.iter().map(|&id| st.var(id).data).collect();
    }

    // The cleanup pass needs the schedule and the queue ownership.
    st.eval_scratch = Some(EvalScratch {
        todo,
        sizes,
        schedule,
    });
    drop(st);
    Ok(programs)
}

/// Carried from assembly to the post-launch cleanup.
pub(crate) struct EvalScratch {
    pub todo: Vec<VarId>,
    pub sizes: Vec<u32>,
    pub schedule: HashMap<u32, Vec<VarId>>,
}

pub(crate) fn eval(jit: &Jit) -> Result<()> {
    let programs = assemble(jit)?;
    if programs.is_empty() {
        return Ok(());
    }

    let parallel = {
        let st = jit.lock();
        st.parallel_dispatch && programs.len() > 1 && programs[0].backend.is_cuda()
    };

    if parallel {
        // Fan the groups out over sub-streams fenced by events: each group
        // waits for prior work on the main stream, the main stream waits
        // for every group. Device-side concurrency only; the host stays
        // serial.
        let device = jit.inner.cuda().expect("parallel dispatch without a device");
        device.record_event(device.event(), device.stream())?;
        for (i, program) in programs.iter().enumerate() {
            let (stream, event) = device.sub_stream(i)?;
            device.wait_event(stream, device.event())?;
            let kernel = kernel::get_or_compile(jit, program)?;
            kernel::launch(jit, &kernel, program, Some(stream))?;
            device.record_event(event, stream)?;
            device.wait_event(device.stream(), event)?;
        }
    } else {
        for program in &programs {
            let kernel = kernel::get_or_compile(jit, program)?;
            kernel::launch(jit, &kernel, program, None)?;
        }
    }

    cleanup(jit);
    Ok(())
}

/// Post-evaluation pass: clears side-effect and dirty flags, then removes
/// the internal edges of everything that now owns a buffer. The removed
/// references cascade and collect intermediate variables.
pub(crate) fn cleanup(jit: &Jit) {
    let mut st = jit.lock();
    let Some(scratch) = st.eval_scratch.take() else {
        return;
    };

    for size in &scratch.sizes {
        for &index in &scratch.schedule[size] {
            if !st.variables.contains_key(&index) {
                continue;
            }

            let (side_effect, extra_dep) = {
                let v = st.var_mut(index);
                let se = v.side_effect;
                v.side_effect = false;
                v.pending_scatter = false;
                (se, v.extra_dep)
            };
            if side_effect && extra_dep != 0 {
                // The weak edge names the scatter target; its buffer is
                // up to date now.
                if let Some(target) = st.variables.get_mut(&extra_dep) {
                    target.pending_scatter = false;
                }
            }

            let evaluated = {
                let v = st.var(index);
                v.data != 0 && !v.is_data()
            };
            if evaluated {
                // The structural key is about to change; retire the CSE
                // entry before the edges disappear.
                st.cse_drop(index);
                let v = st.var_mut(index);
                let deps = std::mem::take(&mut v.dep);
                let extra = std::mem::take(&mut v.extra_dep);
                for dep in deps {
                    st.dec_ref_int(dep);
                }
                st.dec_ref_ext(extra);
            }
        }
    }

    // The queue's references, taken by `schedule()`.
    for index in scratch.todo {
        st.dec_ref_ext(index);
    }

    jit.finish(st);
}
