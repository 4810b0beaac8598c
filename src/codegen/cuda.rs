//! PTX emitter.
//!
//! Emits one kernel per scheduled group: a grid-stride loop whose body
//! loads inputs, expands each symbolic node into PTX instructions and
//! stores outputs. Special registers:
//!
//!   %size / %index / %step / %done   loop bookkeeping
//!   %arg                             pointer table base (indirect params)
//!   %rd0, %rd1                       address scratch
//!   %b3, %w3, %r3, %f2, %f3, %d3, %p2, %p3   compound-statement scratch
//!
//! Variable registers are numbered per class starting at 4.

use std::fmt::Write;

use crate::op::{Op, ReduceOp};
use crate::var::{State, VarId, Variable};
use crate::vartype::VarType;

use super::{patch_kernel_name, template, Layout, REGISTER_OFFSET};

/// Emits the kernel for one group; returns `(source, entry_name)`.
pub(crate) fn emit(st: &State, layout: &Layout, _size: u32) -> (String, String) {
    let mut s = String::new();
    let direct = layout.param_direct();
    let n_inout = layout.n_params();

    s.push_str(".version 6.3\n");
    s.push_str(".target sm_61\n");
    s.push_str(".address_size 64\n\n");

    if direct {
        if n_inout == 0 {
            s.push_str(".visible .entry enoki_@@@@@@@@(.param .u32 size) {\n");
        } else {
            s.push_str(".visible .entry enoki_@@@@@@@@(.param .u32 size,\n");
            for k in 0..n_inout {
                let sep = if k + 1 < n_inout { "," } else { ") {" };
                writeln!(s, "                               .param .u64 arg{k}{sep}").unwrap();
            }
        }
    } else {
        s.push_str(".visible .entry enoki_@@@@@@@@(.param .u32 size,\n");
        s.push_str("                               .param .u64 arg) {\n");
    }

    // One declaration count covers every class; it satisfies the
    // max(3, n) floor because numbering starts at the scratch offset.
    let n_decl = layout.entries.len() as u32 + REGISTER_OFFSET;
    writeln!(s, "    .reg.b8 %b<{n_decl}>;").unwrap();
    writeln!(s, "    .reg.b16 %w<{n_decl}>;").unwrap();
    writeln!(s, "    .reg.b32 %r<{n_decl}>, %size, %index, %step;").unwrap();
    writeln!(s, "    .reg.b64 %rd<{n_decl}>, %arg;").unwrap();
    writeln!(s, "    .reg.f32 %f<{n_decl}>;").unwrap();
    writeln!(s, "    .reg.f64 %d<{n_decl}>;").unwrap();
    writeln!(s, "    .reg.pred %p<{n_decl}>, %done;\n").unwrap();

    s.push_str("    // Grid-stride loop setup\n");
    s.push_str("    ld.param.u32 %size, [size];\n");
    if !direct {
        s.push_str("    ld.param.u64 %arg, [arg];\n");
    }
    s.push_str("    mov.u32 %r0, %ctaid.x;\n");
    s.push_str("    mov.u32 %r1, %ntid.x;\n");
    s.push_str("    mov.u32 %r2, %tid.x;\n");
    s.push_str("    mad.lo.u32 %index, %r0, %r1, %r2;\n");
    s.push_str("    setp.ge.u32 %done, %index, %size;\n");
    s.push_str("    @%done bra L0;\n");
    s.push_str("\n");
    s.push_str("    mov.u32 %r0, %nctaid.x;\n");
    s.push_str("    mul.lo.u32 %step, %r1, %r0;\n");
    s.push_str("\n");
    s.push_str("L1:\n");
    s.push_str("    // Loop body\n");

    let mut gen = Gen {
        st,
        layout,
        direct,
        s,
    };
    for entry in &layout.entries {
        let v = st.var(entry.id);
        if entry.input {
            gen.load(entry.id, v);
        } else {
            gen.render(entry.id, v);
        }
        if entry.output {
            gen.store(entry.id, v);
        }
    }
    let mut s = gen.s;

    s.push_str("\n");
    s.push_str("    add.u32     %index, %index, %step;\n");
    s.push_str("    setp.ge.u32 %done, %index, %size;\n");
    s.push_str("    @!%done bra L1;\n");
    s.push_str("\n");
    s.push_str("L0:\n");
    s.push_str("    ret;\n");
    s.push_str("}\n");

    let hash = patch_kernel_name(&mut s, '@');
    (s, format!("enoki_{hash}"))
}

struct Gen<'a> {
    st: &'a State,
    layout: &'a Layout,
    direct: bool,
    s: String,
}

impl<'a> Gen<'a> {
    fn reg(&self, id: VarId) -> String {
        let v = self.st.var(id);
        format!("{}{}", v.ty.prefix_ptx(), self.layout.reg(id))
    }

    /// Loads the parameter slot address into the `%rd0` scratch register.
    fn param_addr(&mut self, id: VarId, indexed: bool, elem_size: usize) {
        let slot = self.layout.param_slot(id);
        let off = slot * 8;
        if self.direct {
            writeln!(self.s, "    ld.param.u64 %rd0, [arg{slot}];").unwrap();
        } else {
            writeln!(self.s, "    ld.global.u64 %rd0, [%arg+{off}];").unwrap();
        }
        if indexed {
            writeln!(self.s, "    mul.wide.u32 %rd1, %index, {elem_size};").unwrap();
            self.s.push_str("    add.u64 %rd0, %rd0, %rd1;\n");
        }
    }

    fn load(&mut self, id: VarId, v: &Variable) {
        let reg = self.reg(id);
        writeln!(self.s, "\n    // Load register {reg}").unwrap();
        let slot = self.layout.param_slot(id);
        let off = slot * 8;

        if v.direct_pointer {
            if self.direct {
                writeln!(self.s, "    ld.param.u64 {reg}, [arg{slot}];").unwrap();
            } else {
                writeln!(self.s, "    ldu.global.u64 {reg}, [%arg+{off}];").unwrap();
            }
            return;
        }

        let scalar = v.size == 1;
        self.param_addr(id, !scalar, v.ty.size());
        let ld = if scalar { "ldu" } else { "ld" };
        let t = v.ty.name_ptx();
        if v.ty.is_bool() {
            writeln!(self.s, "    {ld}.global.u8 %w3, [%rd0];").unwrap();
            writeln!(self.s, "    setp.ne.u16 {reg}, %w3, 0;").unwrap();
        } else {
            writeln!(self.s, "    {ld}.global.{t} {reg}, [%rd0];").unwrap();
        }
    }

    fn store(&mut self, id: VarId, v: &Variable) {
        let reg = self.reg(id);
        writeln!(self.s, "\n    // Store register {reg}").unwrap();
        self.param_addr(id, true, v.ty.size().max(1));
        let t = v.ty.name_ptx();
        if v.ty.is_bool() {
            writeln!(self.s, "    selp.u16 %w3, 1, 0, {reg};").unwrap();
            self.s.push_str("    st.global.u8 [%rd0], %w3;\n");
        } else {
            writeln!(self.s, "    st.global.{t} [%rd0], {reg};").unwrap();
        }
    }

    fn render(&mut self, id: VarId, v: &Variable) {
        let d = self.reg(id);
        let dep: Vec<String> = v
            .dep
            .iter()
            .map(|&i| if i == 0 { String::new() } else { self.reg(i) })
            .collect();
        let dep_ty: Vec<VarType> = v
            .dep
            .iter()
            .map(|&i| {
                if i == 0 {
                    VarType::Void
                } else {
                    self.st.var(i).ty
                }
            })
            .collect();
        let ty = v.ty;
        let t = ty.name_ptx();
        let bin = ty.name_ptx_bin();

        match &v.op {
            Op::Data => unreachable!("materialized node {id} reached the compute path"),

            Op::Literal => match ty {
                VarType::Bool => {
                    writeln!(self.s, "    mov.u32 %r3, {};", v.literal & 1).unwrap();
                    writeln!(self.s, "    setp.ne.u32 {d}, %r3, 0;").unwrap();
                }
                VarType::I8 | VarType::U8 => {
                    writeln!(self.s, "    mov.b16 %w3, {:#x};", v.literal).unwrap();
                    writeln!(self.s, "    cvt.u8.u16 {d}, %w3;").unwrap();
                }
                _ => writeln!(self.s, "    mov.{bin} {d}, {:#x};", v.literal).unwrap(),
            },

            Op::Counter => writeln!(self.s, "    mov.u32 {d}, %index;").unwrap(),

            // The grid-stride loop exits before any out-of-range lane, so
            // this only appears through graphs shared with the CPU path.
            Op::DefaultMask => {
                writeln!(self.s, "    setp.lt.u32 {d}, {}, %size;", dep[0]).unwrap()
            }

            Op::Neg => {
                if ty.is_uint() {
                    writeln!(self.s, "    sub.{t} {d}, 0, {};", dep[0]).unwrap()
                } else {
                    writeln!(self.s, "    neg.{t} {d}, {};", dep[0]).unwrap()
                }
            }

            Op::Not => {
                if ty.is_bool() {
                    writeln!(self.s, "    not.pred {d}, {};", dep[0]).unwrap()
                } else {
                    writeln!(self.s, "    not.{bin} {d}, {};", dep[0]).unwrap()
                }
            }

            Op::Sqrt => {
                if ty == VarType::F16 {
                    writeln!(self.s, "    cvt.f32.f16 %f3, {};", dep[0]).unwrap();
                    self.s.push_str("    sqrt.rn.f32 %f3, %f3;\n");
                    writeln!(self.s, "    cvt.rn.f16.f32 {d}, %f3;").unwrap();
                } else {
                    writeln!(self.s, "    sqrt.rn.{t} {d}, {};", dep[0]).unwrap();
                }
            }

            Op::Abs => {
                if ty.is_uint() {
                    writeln!(self.s, "    mov.{bin} {d}, {};", dep[0]).unwrap()
                } else {
                    writeln!(self.s, "    abs.{t} {d}, {};", dep[0]).unwrap()
                }
            }

            Op::Ceil => self.round_to_int(&d, &dep[0], ty, "rpi"),
            Op::Floor => self.round_to_int(&d, &dep[0], ty, "rmi"),
            Op::Round => self.round_to_int(&d, &dep[0], ty, "rni"),
            Op::Trunc => self.round_to_int(&d, &dep[0], ty, "rzi"),

            Op::Popc => {
                let (bt, wide) = bitop_ty(ty);
                if wide {
                    writeln!(self.s, "    popc.{bt} %r3, {};", dep[0]).unwrap();
                    writeln!(self.s, "    cvt.u64.u32 {d}, %r3;").unwrap();
                } else {
                    writeln!(self.s, "    popc.{bt} {d}, {};", dep[0]).unwrap();
                }
            }

            Op::Clz => {
                let (bt, wide) = bitop_ty(ty);
                if wide {
                    writeln!(self.s, "    clz.{bt} %r3, {};", dep[0]).unwrap();
                    writeln!(self.s, "    cvt.u64.u32 {d}, %r3;").unwrap();
                } else {
                    writeln!(self.s, "    clz.{bt} {d}, {};", dep[0]).unwrap();
                }
            }

            Op::Ctz => {
                let (bt, wide) = bitop_ty(ty);
                if wide {
                    writeln!(self.s, "    brev.{bt} %rd1, {};", dep[0]).unwrap();
                    writeln!(self.s, "    clz.{bt} %r3, %rd1;").unwrap();
                    writeln!(self.s, "    cvt.u64.u32 {d}, %r3;").unwrap();
                } else {
                    writeln!(self.s, "    brev.{bt} %r3, {};", dep[0]).unwrap();
                    writeln!(self.s, "    clz.{bt} {d}, %r3;").unwrap();
                }
            }

            Op::Add => self.arith2(&d, &dep, v, "add.{t} $d, $0, $1;"),
            Op::Sub => self.arith2(&d, &dep, v, "sub.{t} $d, $0, $1;"),
            Op::Mul => {
                if ty.is_float() {
                    self.arith2(&d, &dep, v, "mul.{t} $d, $0, $1;")
                } else {
                    writeln!(self.s, "    mul.lo.{t} {d}, {}, {};", dep[0], dep[1]).unwrap()
                }
            }
            Op::Div => {
                if ty.is_float() {
                    self.arith2(&d, &dep, v, "div.rn.{t} $d, $0, $1;")
                } else {
                    writeln!(self.s, "    div.{t} {d}, {}, {};", dep[0], dep[1]).unwrap()
                }
            }

            Op::Mod => {
                if ty.is_float() {
                    let f = scratch_f(ty);
                    writeln!(self.s, "    div.rn.{t} {f}, {}, {};", dep[0], dep[1]).unwrap();
                    writeln!(self.s, "    cvt.rzi.{t}.{t} {f}, {f};").unwrap();
                    writeln!(self.s, "    neg.{t} {f}, {f};").unwrap();
                    writeln!(self.s, "    fma.rn.{t} {d}, {f}, {}, {};", dep[1], dep[0]).unwrap();
                } else {
                    writeln!(self.s, "    rem.{t} {d}, {}, {};", dep[0], dep[1]).unwrap();
                }
            }

            Op::Mulhi => {
                writeln!(self.s, "    mul.hi.{t} {d}, {}, {};", dep[0], dep[1]).unwrap()
            }

            Op::Min => self.arith2(&d, &dep, v, "min.{t} $d, $0, $1;"),
            Op::Max => self.arith2(&d, &dep, v, "max.{t} $d, $0, $1;"),

            Op::Fma => {
                if ty == VarType::F16 {
                    writeln!(
                        self.s,
                        "    fma.rn.f16 {d}, {}, {}, {};",
                        dep[0], dep[1], dep[2]
                    )
                    .unwrap()
                } else if ty.is_float() {
                    writeln!(
                        self.s,
                        "    fma.rn.{t} {d}, {}, {}, {};",
                        dep[0], dep[1], dep[2]
                    )
                    .unwrap()
                } else {
                    writeln!(
                        self.s,
                        "    mad.lo.{t} {d}, {}, {}, {};",
                        dep[0], dep[1], dep[2]
                    )
                    .unwrap()
                }
            }

            Op::Eq | Op::Neq | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                if dep_ty[0].is_bool() {
                    match v.op {
                        Op::Eq => {
                            writeln!(self.s, "    xor.pred {d}, {}, {};", dep[0], dep[1]).unwrap();
                            writeln!(self.s, "    not.pred {d}, {d};").unwrap();
                        }
                        Op::Neq => {
                            writeln!(self.s, "    xor.pred {d}, {}, {};", dep[0], dep[1]).unwrap()
                        }
                        _ => panic!("ordered comparison of boolean operands"),
                    }
                } else {
                    let cmp = match v.op {
                        Op::Eq => "eq",
                        Op::Neq => "ne",
                        Op::Lt => "lt",
                        Op::Le => "le",
                        Op::Gt => "gt",
                        _ => "ge",
                    };
                    let ot = dep_ty[0].name_ptx();
                    writeln!(self.s, "    setp.{cmp}.{ot} {d}, {}, {};", dep[0], dep[1]).unwrap();
                }
            }

            Op::And | Op::Or | Op::Xor => {
                let name = match v.op {
                    Op::And => "and",
                    Op::Or => "or",
                    _ => "xor",
                };
                if ty.is_bool() {
                    writeln!(self.s, "    {name}.pred {d}, {}, {};", dep[0], dep[1]).unwrap();
                } else if dep_ty[1].is_bool() {
                    // Value combined with a mask.
                    assert!(
                        matches!(v.op, Op::And),
                        "mask operand requires a conjunction"
                    );
                    writeln!(self.s, "    selp.{bin} {d}, {}, 0, {};", dep[0], dep[1]).unwrap();
                } else {
                    writeln!(self.s, "    {name}.{bin} {d}, {}, {};", dep[0], dep[1]).unwrap();
                }
            }

            Op::Shl | Op::Shr => {
                let amt = if dep_ty[1].size() == 8 {
                    writeln!(self.s, "    cvt.u32.u64 %r3, {};", dep[1]).unwrap();
                    "%r3".to_string()
                } else {
                    dep[1].clone()
                };
                if matches!(v.op, Op::Shl) {
                    writeln!(self.s, "    shl.{bin} {d}, {}, {amt};", dep[0]).unwrap();
                } else {
                    writeln!(self.s, "    shr.{t} {d}, {}, {amt};", dep[0]).unwrap();
                }
            }

            Op::Cast => self.cast(&d, &dep[0], ty, dep_ty[0]),

            Op::Bitcast => {
                assert!(!ty.is_bool() && !dep_ty[0].is_bool());
                writeln!(self.s, "    mov.{bin} {d}, {};", dep[0]).unwrap();
            }

            Op::Select => {
                if ty.is_bool() {
                    writeln!(self.s, "    not.pred %p3, {};", dep[0]).unwrap();
                    writeln!(self.s, "    and.pred %p2, {}, {};", dep[0], dep[1]).unwrap();
                    writeln!(self.s, "    and.pred %p3, %p3, {};", dep[2]).unwrap();
                    writeln!(self.s, "    or.pred {d}, %p2, %p3;").unwrap();
                } else {
                    writeln!(
                        self.s,
                        "    selp.{bin} {d}, {}, {}, {};",
                        dep[1], dep[2], dep[0]
                    )
                    .unwrap();
                }
            }

            Op::Gather => {
                assert_eq!(dep_ty[1], VarType::U32, "gather indices must be u32");
                let m = &dep[2];
                writeln!(
                    self.s,
                    "    mad.wide.u32 %rd0, {}, {}, {};",
                    dep[1],
                    ty.size(),
                    dep[0]
                )
                .unwrap();
                if ty.is_bool() {
                    writeln!(self.s, "    @{m} ld.global.u8 %w3, [%rd0];").unwrap();
                    writeln!(self.s, "    @!{m} mov.u16 %w3, 0;").unwrap();
                    writeln!(self.s, "    setp.ne.u16 {d}, %w3, 0;").unwrap();
                } else {
                    writeln!(self.s, "    @{m} ld.global.{t} {d}, [%rd0];").unwrap();
                    writeln!(self.s, "    @!{m} mov.{bin} {d}, 0;").unwrap();
                }
            }

            Op::Scatter(op) => {
                let vt = dep_ty[1];
                let vts = vt.name_ptx();
                writeln!(
                    self.s,
                    "    mad.wide.u32 %rd0, {}, {}, {};",
                    dep[2],
                    vt.size(),
                    dep[0]
                )
                .unwrap();
                let (val, m) = (&dep[1], &dep[3]);
                match op {
                    ReduceOp::None => {
                        if vt.is_bool() {
                            writeln!(self.s, "    selp.u16 %w3, 1, 0, {val};").unwrap();
                            writeln!(self.s, "    @{m} st.global.u8 [%rd0], %w3;").unwrap();
                        } else {
                            writeln!(self.s, "    @{m} st.global.{vts} [%rd0], {val};").unwrap();
                        }
                    }
                    ReduceOp::Add => {
                        assert!(vt != VarType::F16, "atomic scatter-add does not support f16");
                        writeln!(self.s, "    @{m} red.global.add.{vts} [%rd0], {val};").unwrap();
                    }
                    ReduceOp::Min | ReduceOp::Max => {
                        assert!(vt.is_int(), "atomic scatter-min/max requires integers");
                        let name = if matches!(op, ReduceOp::Min) { "min" } else { "max" };
                        writeln!(self.s, "    @{m} red.global.{name}.{vts} [%rd0], {val};")
                            .unwrap();
                    }
                    ReduceOp::And | ReduceOp::Or => {
                        assert!(vt.is_int());
                        let name = if matches!(op, ReduceOp::And) { "and" } else { "or" };
                        let vbin = vt.name_ptx_bin();
                        writeln!(self.s, "    @{m} red.global.{name}.{vbin} [%rd0], {val};")
                            .unwrap();
                    }
                    ReduceOp::Mul => panic!("atomic scatter-multiply is not supported"),
                }
            }

            Op::ScatterInc => {
                let m = &dep[2];
                writeln!(self.s, "    mad.wide.u32 %rd0, {}, 4, {};", dep[1], dep[0]).unwrap();
                writeln!(self.s, "    @{m} atom.global.add.u32 {d}, [%rd0], 1;").unwrap();
                writeln!(self.s, "    @!{m} mov.u32 {d}, 0;").unwrap();
            }

            Op::LoopStart
            | Op::LoopCond
            | Op::LoopPhi
            | Op::LoopEnd
            | Op::LoopOutput
            | Op::Call
            | Op::CallOutput => {
                panic!("symbolic loops and calls are not lowered on the PTX path")
            }

            Op::Custom(stmt) => {
                let expanded =
                    template::expand(stmt, &template::Ctx::ptx(self.st, self.layout, id));
                for line in expanded.lines() {
                    writeln!(self.s, "    {line}").unwrap();
                }
            }
        }
    }

    /// Emits a simple two-operand arithmetic instruction, routing f16
    /// operands through the f32 scratch registers when the operation has no
    /// native half encoding.
    fn arith2(&mut self, d: &str, dep: &[String], v: &Variable, pattern: &str) {
        let native_f16 = matches!(v.op, Op::Add | Op::Sub | Op::Mul | Op::Fma);
        if v.ty == VarType::F16 && !native_f16 {
            writeln!(self.s, "    cvt.f32.f16 %f2, {};", dep[0]).unwrap();
            writeln!(self.s, "    cvt.f32.f16 %f3, {};", dep[1]).unwrap();
            let inst = pattern
                .replace("{t}", "f32")
                .replace("$d", "%f2")
                .replace("$0", "%f2")
                .replace("$1", "%f3");
            writeln!(self.s, "    {inst}").unwrap();
            writeln!(self.s, "    cvt.rn.f16.f32 {d}, %f2;").unwrap();
        } else {
            let inst = pattern
                .replace("{t}", v.ty.name_ptx())
                .replace("$d", d)
                .replace("$0", &dep[0])
                .replace("$1", &dep[1]);
            writeln!(self.s, "    {inst}").unwrap();
        }
    }

    fn round_to_int(&mut self, d: &str, a0: &str, ty: VarType, mode: &str) {
        assert!(ty.is_float());
        if ty == VarType::F16 {
            writeln!(self.s, "    cvt.f32.f16 %f3, {a0};").unwrap();
            writeln!(self.s, "    cvt.{mode}.f32.f32 %f3, %f3;").unwrap();
            writeln!(self.s, "    cvt.rn.f16.f32 {d}, %f3;").unwrap();
        } else {
            let t = ty.name_ptx();
            writeln!(self.s, "    cvt.{mode}.{t}.{t} {d}, {a0};").unwrap();
        }
    }

    fn cast(&mut self, d: &str, a0: &str, dst: VarType, src: VarType) {
        let (dt, st) = (dst.name_ptx(), src.name_ptx());

        if dst == src {
            writeln!(self.s, "    mov.{} {d}, {a0};", dst.name_ptx_bin()).unwrap();
        } else if dst.is_bool() {
            if src.is_float() {
                let zero = match src {
                    VarType::F64 => "0d0000000000000000",
                    VarType::F16 => "0x0000",
                    _ => "0f00000000",
                };
                writeln!(self.s, "    setp.ne.{st} {d}, {a0}, {zero};").unwrap();
            } else {
                writeln!(self.s, "    setp.ne.{st} {d}, {a0}, 0;").unwrap();
            }
        } else if src.is_bool() {
            match dst {
                VarType::F16 => {
                    writeln!(self.s, "    selp.b16 {d}, 0x3c00, 0x0000, {a0};").unwrap()
                }
                VarType::F32 => {
                    writeln!(self.s, "    selp.f32 {d}, 0f3F800000, 0f00000000, {a0};").unwrap()
                }
                VarType::F64 => writeln!(
                    self.s,
                    "    selp.f64 {d}, 0d3FF0000000000000, 0d0000000000000000, {a0};"
                )
                .unwrap(),
                _ => {
                    writeln!(self.s, "    selp.{} {d}, 1, 0, {a0};", dst.name_ptx_bin()).unwrap()
                }
            }
        } else if (dst, src) == (VarType::F16, VarType::F64) {
            // No direct conversion; route through f32.
            writeln!(self.s, "    cvt.rn.f32.f64 %f3, {a0};").unwrap();
            writeln!(self.s, "    cvt.rn.f16.f32 {d}, %f3;").unwrap();
        } else if (dst, src) == (VarType::F64, VarType::F16) {
            writeln!(self.s, "    cvt.f32.f16 %f3, {a0};").unwrap();
            writeln!(self.s, "    cvt.f64.f32 {d}, %f3;").unwrap();
        } else if dst.is_float() && src.is_float() {
            if dst.size() > src.size() {
                writeln!(self.s, "    cvt.{dt}.{st} {d}, {a0};").unwrap();
            } else {
                writeln!(self.s, "    cvt.rn.{dt}.{st} {d}, {a0};").unwrap();
            }
        } else if dst.is_float() {
            writeln!(self.s, "    cvt.rn.{dt}.{st} {d}, {a0};").unwrap();
        } else if src.is_float() {
            writeln!(self.s, "    cvt.rzi.{dt}.{st} {d}, {a0};").unwrap();
        } else {
            writeln!(self.s, "    cvt.{dt}.{st} {d}, {a0};").unwrap();
        }
    }
}

fn scratch_f(ty: VarType) -> &'static str {
    match ty {
        VarType::F64 => "%d3",
        _ => "%f3",
    }
}

fn bitop_ty(ty: VarType) -> (&'static str, bool) {
    match ty.size() {
        4 => ("b32", false),
        8 => ("b64", true),
        n => panic!("bit-count operation on a {n}-byte operand"),
    }
}
