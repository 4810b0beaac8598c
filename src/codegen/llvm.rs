//! LLVM IR emitter for the vectorized CPU backend.
//!
//! Each group becomes `define void @drjit_<hash>(i64 %start, i64 %end,
//! i8** noalias %params)` whose body advances `%index` by the vector width
//! until `%end`. Parameter traffic is annotated with the `!alias.scope` /
//! `!noalias` / `!nontemporal` metadata emitted at the module trailer.
//! Intrinsic declarations and helper subroutines are collected into an
//! ordered global set and emitted after the kernel.
//!
//! Both pointer syntaxes are supported; the loaded LLVM library decides
//! which one is emitted (typed pointers parse only in older versions).

use std::collections::HashSet;
use std::fmt::Write;

use indexmap::IndexSet;

use crate::op::{Op, ReduceOp};
use crate::var::{CallData, State, VarId, Variable};
use crate::vartype::VarType;

use super::{patch_kernel_name, template, CodegenOptions, Layout};

pub(crate) fn emit(
    st: &State,
    layout: &Layout,
    _size: u32,
    opts: &CodegenOptions,
) -> (String, String) {
    let mut gen = Gen {
        st,
        layout,
        opts,
        s: String::new(),
        globals: IndexSet::new(),
        f32_cast: HashSet::new(),
        f32_view: HashSet::new(),
    };

    // Indirect calls stage arguments through a stack buffer whose size must
    // be known up front.
    let mut alloca_bytes = 0u32;
    let mut alloca_align = 1u32;
    for entry in &layout.entries {
        let v = st.var(entry.id);
        if matches!(v.op, Op::Call) {
            let (_, _, bytes, align) = gen.call_layout(&st.calls[&entry.id]);
            alloca_bytes = alloca_bytes.max(bytes);
            alloca_align = alloca_align.max(align);
        }
    }

    let pp = gen.pt("i8*");
    writeln!(
        gen.s,
        "define void @drjit_^^^^^^^^(i64 %start, i64 %end, {pp} noalias %params) #0 {{"
    )
    .unwrap();
    gen.s.push_str("entry:\n");
    if alloca_bytes > 0 {
        writeln!(gen.s, "    %buffer = alloca i8, i32 {alloca_bytes}, align {alloca_align}")
            .unwrap();
    }
    gen.s.push_str("    br label %body\n\n");
    gen.s.push_str("body:\n");
    gen.s
        .push_str("    %index = phi i64 [ %index_next, %suffix ], [ %start, %entry ]\n");

    for entry in &layout.entries {
        let v = st.var(entry.id);
        gen.param_address(entry.id, v, entry.input, entry.output);
        if entry.input {
            gen.load(entry.id, v);
        } else {
            gen.render(entry.id, v);
        }
        if entry.output {
            gen.store(entry.id, v);
        }
    }

    gen.s.push_str("    br label %suffix\n\n");
    gen.s.push_str("suffix:\n");
    writeln!(gen.s, "    %index_next = add i64 %index, {}", opts.width).unwrap();
    gen.s.push_str("    %cond = icmp uge i64 %index_next, %end\n");
    gen.s
        .push_str("    br i1 %cond, label %done, label %body, !llvm.loop !4\n\n");
    gen.s.push_str("done:\n");
    gen.s.push_str("    ret void\n");
    gen.s.push_str("}\n");

    let mut s = gen.s;
    for global in &gen.globals {
        s.push('\n');
        s.push_str(global);
        s.push('\n');
    }

    s.push_str("\n!0 = !{!0}\n");
    s.push_str("!1 = !{!1, !0}\n");
    s.push_str("!2 = !{!1}\n");
    s.push_str("!3 = !{i32 1}\n");
    s.push_str("!4 = !{!\"llvm.loop.unroll.disable\", !\"llvm.loop.vectorize.enable\", i1 0}\n\n");

    write!(
        s,
        "attributes #0 = {{ norecurse nounwind \"frame-pointer\"=\"none\" \
         \"no-builtins\" \"no-stack-arg-probe\" \"target-cpu\"=\"{}\"",
        opts.target_cpu
    )
    .unwrap();
    let mut features = String::new();
    if cfg!(target_arch = "x86_64") {
        features.push_str("-vzeroupper");
    }
    if !opts.target_features.is_empty() {
        if !features.is_empty() {
            features.push(',');
        }
        features.push_str(&opts.target_features);
    }
    if !features.is_empty() {
        write!(s, " \"target-features\"=\"{features}\"").unwrap();
    }
    s.push_str(" }\n");

    let hash = patch_kernel_name(&mut s, '^');
    (s, format!("drjit_{hash}"))
}

struct Gen<'a> {
    st: &'a State,
    layout: &'a Layout,
    opts: &'a CodegenOptions,
    s: String,
    globals: IndexSet<String>,
    /// Dependencies that already have an f32 shadow register.
    f32_cast: HashSet<VarId>,
    /// Variables currently viewed as f32 by the half-upcast wrapper.
    f32_view: HashSet<VarId>,
}

impl<'a> Gen<'a> {
    fn w(&self) -> u32 {
        self.opts.width
    }

    fn ty_of(&self, id: VarId) -> VarType {
        if self.f32_view.contains(&id) {
            VarType::F32
        } else {
            self.st.var(id).ty
        }
    }

    /// Register name, e.g. `%f5`. Variables temporarily widened by the
    /// half-upcast wrapper live in `_f`-suffixed shadows of their own
    /// number so they cannot collide with real f32 registers.
    fn reg(&self, id: VarId) -> String {
        if self.f32_view.contains(&id) {
            format!("%h{}_f", self.layout.reg(id))
        } else {
            format!("{}{}", self.ty_of(id).prefix_llvm(), self.layout.reg(id))
        }
    }

    /// Scalar type name, with the pointer type resolved per syntax flavor.
    fn t(&self, id: VarId) -> String {
        self.scalar(self.ty_of(id))
    }

    fn scalar(&self, ty: VarType) -> String {
        if ty == VarType::Pointer {
            self.pt("i8*")
        } else {
            ty.name_llvm().to_string()
        }
    }

    /// Vector type, e.g. `<8 x float>`.
    fn tv(&self, id: VarId) -> String {
        self.vec(self.ty_of(id))
    }

    fn vec(&self, ty: VarType) -> String {
        format!("<{} x {}>", self.w(), self.scalar(ty))
    }

    /// Type-qualified register, e.g. `<8 x float> %f5`.
    fn qv(&self, id: VarId) -> String {
        format!("{} {}", self.tv(id), self.reg(id))
    }

    /// Pointer type: `x*` or the opaque `ptr`.
    fn pt(&self, scalar: &str) -> String {
        if self.opts.opaque_pointers {
            "ptr".to_string()
        } else {
            scalar.to_string()
        }
    }

    fn ptr_to(&self, scalar: &str) -> String {
        if self.opts.opaque_pointers {
            "ptr".to_string()
        } else {
            format!("{scalar}*")
        }
    }

    /// Memory scalar type (`i1` widens to `i8`).
    fn mt(&self, ty: VarType) -> String {
        if ty == VarType::Pointer {
            self.pt("i8*")
        } else {
            ty.name_llvm_mem().to_string()
        }
    }

    fn mtv(&self, ty: VarType) -> String {
        format!("<{} x {}>", self.w(), self.mt(ty))
    }

    fn align(&self, ty: VarType) -> usize {
        ty.size().max(1)
    }

    fn valign(&self, v: &Variable) -> usize {
        if v.unaligned {
            self.align(v.ty)
        } else {
            self.align(v.ty) * self.w() as usize
        }
    }

    /// Splat constant, e.g. `<i32 -1, i32 -1, ...>`.
    fn splat(&self, scalar: &str, value: &str) -> String {
        let mut s = String::from("<");
        for i in 0..self.w() {
            if i > 0 {
                s.push_str(", ");
            }
            write!(s, "{scalar} {value}").unwrap();
        }
        s.push('>');
        s
    }

    fn decl(&mut self, text: String) {
        self.globals.insert(text);
    }

    /// Mangled suffix of a masked gather/scatter intrinsic.
    fn masked_mangle(&self, ty: VarType) -> String {
        let h = if ty.is_bool() { "i8" } else { ty.name_llvm_abbrev() };
        if self.opts.opaque_pointers {
            format!("v{}{h}.v{}p0", self.w(), self.w())
        } else {
            format!("v{}{h}.v{}p0{h}", self.w(), self.w())
        }
    }

    /// Emits the parameter-slot addressing sequence shared by loads and
    /// stores: `_p3` points at the slot base, `_p5` at the current packet.
    fn param_address(&mut self, id: VarId, v: &Variable, input: bool, output: bool) {
        if !input && !output {
            return;
        }
        let slot = self.layout.param_slot(id);
        let reg = self.reg(id);
        let pp = self.pt("i8*");
        let ppp = self.ptr_to(&self.pt("i8*"));

        if input && v.size == 1 && v.ty == VarType::Pointer {
            // A pointer argument: the value itself comes from the table.
            writeln!(
                self.s,
                "    {reg}_p1 = getelementptr inbounds {pp}, {ppp} %params, i32 {slot}"
            )
            .unwrap();
            writeln!(
                self.s,
                "    {reg} = load {pp}, {ppp} {reg}_p1, align 8, !alias.scope !2"
            )
            .unwrap();
            return;
        }

        let m = self.mt(v.ty);
        let mp = self.ptr_to(&m);
        writeln!(
            self.s,
            "    {reg}_p1 = getelementptr inbounds {pp}, {ppp} %params, i32 {slot}"
        )
        .unwrap();
        if self.opts.opaque_pointers {
            writeln!(
                self.s,
                "    {reg}_p3 = load ptr, ptr {reg}_p1, align 8, !alias.scope !2"
            )
            .unwrap();
        } else {
            writeln!(
                self.s,
                "    {reg}_p2 = load i8*, i8** {reg}_p1, align 8, !alias.scope !2"
            )
            .unwrap();
            writeln!(self.s, "    {reg}_p3 = bitcast i8* {reg}_p2 to {m}*").unwrap();
        }

        if output || v.size != 1 {
            if self.opts.opaque_pointers {
                writeln!(
                    self.s,
                    "    {reg}_p5 = getelementptr inbounds {m}, ptr {reg}_p3, i64 %index"
                )
                .unwrap();
            } else {
                let mv = self.mtv(v.ty);
                writeln!(
                    self.s,
                    "    {reg}_p4 = getelementptr inbounds {m}, {mp} {reg}_p3, i64 %index"
                )
                .unwrap();
                writeln!(self.s, "    {reg}_p5 = bitcast {m}* {reg}_p4 to {mv}*").unwrap();
            }
        }
    }

    fn load(&mut self, id: VarId, v: &Variable) {
        if v.ty == VarType::Pointer && v.size == 1 {
            return; // loaded by param_address
        }
        let reg = self.reg(id);
        let a = self.align(v.ty);
        let va = self.valign(v);
        let t = self.t(id);
        let tv = self.tv(id);
        let m = self.mt(v.ty);
        let mv = self.mtv(v.ty);
        let mvp = self.ptr_to(&mv);
        let mp = self.ptr_to(&m);

        if v.size != 1 {
            // Load a whole packet.
            let dst = if v.ty.is_bool() {
                format!("{reg}_0")
            } else {
                reg.clone()
            };
            writeln!(
                self.s,
                "    {dst} = load {mv}, {mvp} {reg}_p5, align {va}, !alias.scope !2, !nontemporal !3"
            )
            .unwrap();
            if v.ty.is_bool() {
                writeln!(self.s, "    {reg} = trunc {mv} {reg}_0 to {tv}").unwrap();
            }
        } else {
            // Load a scalar and broadcast it.
            writeln!(
                self.s,
                "    {reg}_0 = load {m}, {mp} {reg}_p3, align {a}, !alias.scope !2"
            )
            .unwrap();
            let (src, dst) = if v.ty.is_bool() {
                writeln!(self.s, "    {reg}_1 = trunc i8 {reg}_0 to i1").unwrap();
                (1, 2)
            } else {
                (0, 1)
            };
            writeln!(
                self.s,
                "    {reg}_{dst} = insertelement {tv} undef, {t} {reg}_{src}, i32 0"
            )
            .unwrap();
            writeln!(
                self.s,
                "    {reg} = shufflevector {tv} {reg}_{dst}, {tv} undef, <{} x i32> zeroinitializer",
                self.w()
            )
            .unwrap();
        }
    }

    fn store(&mut self, id: VarId, v: &Variable) {
        let reg = self.reg(id);
        let va = self.valign(v);
        let mv = self.mtv(v.ty);
        let mvp = self.ptr_to(&mv);
        if v.ty.is_bool() {
            let tv = self.tv(id);
            writeln!(self.s, "    {reg}_e = zext {tv} {reg} to {mv}").unwrap();
            writeln!(
                self.s,
                "    store {mv} {reg}_e, {mvp} {reg}_p5, align {va}, !noalias !2, !nontemporal !3"
            )
            .unwrap();
        } else {
            let tv = self.tv(id);
            writeln!(
                self.s,
                "    store {tv} {reg}, {mvp} {reg}_p5, align {va}, !noalias !2, !nontemporal !3"
            )
            .unwrap();
        }
    }

    fn render(&mut self, id: VarId, v: &Variable) {
        // 16-bit float kinds without native support run on widened f32
        // shadows and truncate back afterwards.
        let upcast = v.ty == VarType::F16 && !v.op.fp16_supported_llvm();
        if upcast {
            let num = self.layout.reg(id);
            for &d in v.dep.iter().filter(|&&d| d != 0) {
                if self.st.var(d).ty == VarType::F16 {
                    if !self.f32_cast.contains(&d) {
                        let dn = self.layout.reg(d);
                        writeln!(
                            self.s,
                            "    %h{dn}_f = fpext <{} x half> %h{dn} to <{} x float>",
                            self.w(),
                            self.w()
                        )
                        .unwrap();
                        self.f32_cast.insert(d);
                    }
                    self.f32_view.insert(d);
                }
            }
            self.f32_view.insert(id);
            self.render_kind(id, v);
            self.f32_view.remove(&id);
            for &d in v.dep.iter().filter(|&&d| d != 0) {
                self.f32_view.remove(&d);
            }
            writeln!(
                self.s,
                "    %h{num} = fptrunc <{} x float> %h{num}_f to <{} x half>",
                self.w(),
                self.w()
            )
            .unwrap();
        } else {
            self.render_kind(id, v);
        }
    }

    fn render_kind(&mut self, id: VarId, v: &Variable) {
        let w = self.w();
        let d = self.reg(id);
        let ty = self.ty_of(id);
        let t = self.t(id);
        let tv = self.tv(id);
        let dep: Vec<String> = v
            .dep
            .iter()
            .map(|&i| if i == 0 { String::new() } else { self.reg(i) })
            .collect();
        let qdep: Vec<String> = v
            .dep
            .iter()
            .map(|&i| if i == 0 { String::new() } else { self.qv(i) })
            .collect();
        let dep_ty: Vec<VarType> = v
            .dep
            .iter()
            .map(|&i| if i == 0 { VarType::Void } else { self.ty_of(i) })
            .collect();
        let h = ty.name_llvm_abbrev();

        match &v.op {
            Op::Data => unreachable!("materialized node {id} reached the compute path"),

            Op::Literal => {
                let lit = literal_str(ty, v.literal);
                writeln!(self.s, "    {d}_1 = insertelement {tv} undef, {t} {lit}, i32 0")
                    .unwrap();
                writeln!(
                    self.s,
                    "    {d} = shufflevector {tv} {d}_1, {tv} undef, <{w} x i32> zeroinitializer"
                )
                .unwrap();
            }

            Op::Counter => {
                writeln!(self.s, "    {d}_0 = trunc i64 %index to i32").unwrap();
                writeln!(
                    self.s,
                    "    {d}_1 = insertelement <{w} x i32> undef, i32 {d}_0, i32 0"
                )
                .unwrap();
                writeln!(
                    self.s,
                    "    {d}_2 = shufflevector <{w} x i32> {d}_1, <{w} x i32> undef, <{w} x i32> zeroinitializer"
                )
                .unwrap();
                let mut lanes = String::from("<");
                for i in 0..w {
                    if i > 0 {
                        lanes.push_str(", ");
                    }
                    write!(lanes, "i32 {i}").unwrap();
                }
                lanes.push('>');
                writeln!(self.s, "    {d} = add <{w} x i32> {d}_2, {lanes}").unwrap();
            }

            Op::DefaultMask => {
                writeln!(self.s, "    {d}_0 = trunc i64 %end to i32").unwrap();
                writeln!(
                    self.s,
                    "    {d}_1 = insertelement <{w} x i32> undef, i32 {d}_0, i32 0"
                )
                .unwrap();
                writeln!(
                    self.s,
                    "    {d}_2 = shufflevector <{w} x i32> {d}_1, <{w} x i32> undef, <{w} x i32> zeroinitializer"
                )
                .unwrap();
                writeln!(self.s, "    {d} = icmp ult {}, {d}_2", qdep[0]).unwrap();
            }

            Op::Neg => {
                if ty.is_float() {
                    writeln!(self.s, "    {d} = fneg {}", qdep[0]).unwrap();
                } else {
                    writeln!(self.s, "    {d} = sub {tv} zeroinitializer, {}", dep[0]).unwrap();
                }
            }

            Op::Not => {
                let ones = if ty.is_bool() {
                    self.splat("i1", "true")
                } else {
                    self.splat(&t, "-1")
                };
                writeln!(self.s, "    {d} = xor {}, {ones}", qdep[0]).unwrap();
            }

            Op::Sqrt => {
                self.decl(format!("declare {tv} @llvm.sqrt.v{w}{h}({tv})"));
                writeln!(self.s, "    {d} = call {tv} @llvm.sqrt.v{w}{h}({})", qdep[0]).unwrap();
            }

            Op::Abs => {
                if ty.is_float() {
                    self.decl(format!("declare {tv} @llvm.fabs.v{w}{h}({tv})"));
                    writeln!(self.s, "    {d} = call {tv} @llvm.fabs.v{w}{h}({})", qdep[0])
                        .unwrap();
                } else {
                    writeln!(self.s, "    {d}_0 = icmp slt {}, zeroinitializer", qdep[0]).unwrap();
                    writeln!(self.s, "    {d}_1 = sub nsw {tv} zeroinitializer, {}", dep[0])
                        .unwrap();
                    writeln!(
                        self.s,
                        "    {d} = select <{w} x i1> {d}_0, {tv} {d}_1, {}",
                        qdep[0]
                    )
                    .unwrap();
                }
            }

            Op::Ceil => self.float_intrinsic(&d, &tv, "ceil", h, &qdep[0]),
            Op::Floor => self.float_intrinsic(&d, &tv, "floor", h, &qdep[0]),
            Op::Round => self.float_intrinsic(&d, &tv, "nearbyint", h, &qdep[0]),
            Op::Trunc => self.float_intrinsic(&d, &tv, "trunc", h, &qdep[0]),

            Op::Popc => {
                self.decl(format!("declare {tv} @llvm.ctpop.v{w}{h}({tv})"));
                writeln!(self.s, "    {d} = call {tv} @llvm.ctpop.v{w}{h}({})", qdep[0]).unwrap();
            }
            Op::Clz => {
                self.decl(format!("declare {tv} @llvm.ctlz.v{w}{h}({tv}, i1)"));
                writeln!(
                    self.s,
                    "    {d} = call {tv} @llvm.ctlz.v{w}{h}({}, i1 0)",
                    qdep[0]
                )
                .unwrap();
            }
            Op::Ctz => {
                self.decl(format!("declare {tv} @llvm.cttz.v{w}{h}({tv}, i1)"));
                writeln!(
                    self.s,
                    "    {d} = call {tv} @llvm.cttz.v{w}{h}({}, i1 0)",
                    qdep[0]
                )
                .unwrap();
            }

            Op::Add => {
                let op = if ty.is_float() { "fadd" } else { "add" };
                writeln!(self.s, "    {d} = {op} {}, {}", qdep[0], dep[1]).unwrap();
            }
            Op::Sub => {
                let op = if ty.is_float() { "fsub" } else { "sub" };
                writeln!(self.s, "    {d} = {op} {}, {}", qdep[0], dep[1]).unwrap();
            }
            Op::Mul => {
                let op = if ty.is_float() { "fmul" } else { "mul" };
                writeln!(self.s, "    {d} = {op} {}, {}", qdep[0], dep[1]).unwrap();
            }
            Op::Div => {
                let op = if ty.is_float() {
                    "fdiv"
                } else if ty.is_uint() {
                    "udiv"
                } else {
                    "sdiv"
                };
                writeln!(self.s, "    {d} = {op} {}, {}", qdep[0], dep[1]).unwrap();
            }
            Op::Mod => {
                let op = if ty.is_float() {
                    "frem"
                } else if ty.is_uint() {
                    "urem"
                } else {
                    "srem"
                };
                writeln!(self.s, "    {d} = {op} {}, {}", qdep[0], dep[1]).unwrap();
            }

            Op::Mulhi => {
                let ext = if ty.is_uint() { "zext" } else { "sext" };
                let big = ty.name_llvm_big();
                let bv = format!("<{w} x {big}>");
                let bits = ty.size() * 8;
                writeln!(self.s, "    {d}_0 = {ext} {} to {bv}", qdep[0]).unwrap();
                writeln!(self.s, "    {d}_1 = {ext} {} to {bv}", qdep[1]).unwrap();
                writeln!(
                    self.s,
                    "    {d}_3 = insertelement {bv} undef, {big} {bits}, i32 0"
                )
                .unwrap();
                writeln!(
                    self.s,
                    "    {d}_4 = shufflevector {bv} {d}_3, {bv} undef, <{w} x i32> zeroinitializer"
                )
                .unwrap();
                writeln!(self.s, "    {d}_5 = mul {bv} {d}_0, {d}_1").unwrap();
                writeln!(self.s, "    {d}_6 = lshr {bv} {d}_5, {d}_4").unwrap();
                writeln!(self.s, "    {d} = trunc {bv} {d}_6 to {tv}").unwrap();
            }

            Op::Fma => {
                if ty.is_float() {
                    self.decl(format!("declare {tv} @llvm.fma.v{w}{h}({tv}, {tv}, {tv})"));
                    writeln!(
                        self.s,
                        "    {d} = call {tv} @llvm.fma.v{w}{h}({}, {}, {})",
                        qdep[0], qdep[1], qdep[2]
                    )
                    .unwrap();
                } else {
                    writeln!(self.s, "    {d}_0 = mul {}, {}", qdep[0], dep[1]).unwrap();
                    writeln!(self.s, "    {d} = add {tv} {d}_0, {}", dep[2]).unwrap();
                }
            }

            Op::Min | Op::Max => {
                let name = match (matches!(v.op, Op::Min), ty.is_float(), ty.is_uint()) {
                    (true, true, _) => "minnum",
                    (true, false, true) => "umin",
                    (true, false, false) => "smin",
                    (false, true, _) => "maxnum",
                    (false, false, true) => "umax",
                    (false, false, false) => "smax",
                };
                self.decl(format!("declare {tv} @llvm.{name}.v{w}{h}({tv}, {tv})"));
                writeln!(
                    self.s,
                    "    {d} = call {tv} @llvm.{name}.v{w}{h}({}, {})",
                    qdep[0], qdep[1]
                )
                .unwrap();
            }

            Op::Eq | Op::Neq | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let sty = dep_ty[0];
                let (kind, cmp) = if sty.is_float() {
                    let cmp = match v.op {
                        Op::Eq => "oeq",
                        Op::Neq => "one",
                        Op::Lt => "olt",
                        Op::Le => "ole",
                        Op::Gt => "ogt",
                        _ => "oge",
                    };
                    ("fcmp", cmp)
                } else {
                    let cmp = match v.op {
                        Op::Eq => "eq",
                        Op::Neq => "ne",
                        Op::Lt if sty.is_uint() => "ult",
                        Op::Lt => "slt",
                        Op::Le if sty.is_uint() => "ule",
                        Op::Le => "sle",
                        Op::Gt if sty.is_uint() => "ugt",
                        Op::Gt => "sgt",
                        _ if sty.is_uint() => "uge",
                        _ => "sge",
                    };
                    ("icmp", cmp)
                };
                writeln!(self.s, "    {d} = {kind} {cmp} {}, {}", qdep[0], dep[1]).unwrap();
            }

            Op::And | Op::Or | Op::Xor => {
                let name = match v.op {
                    Op::And => "and",
                    Op::Or => "or",
                    _ => "xor",
                };
                if dep_ty[0] != dep_ty[1] {
                    // A value combined with a mask.
                    let (val, mask) = if dep_ty[1].is_bool() { (0, 1) } else { (1, 0) };
                    match v.op {
                        Op::And => writeln!(
                            self.s,
                            "    {d} = select {}, {}, {} zeroinitializer",
                            qdep[mask], qdep[val], tv
                        )
                        .unwrap(),
                        Op::Or => {
                            let bv = format!("<{w} x {}>", ty.name_llvm_bin());
                            writeln!(self.s, "    {d}_0 = bitcast {} to {bv}", qdep[val]).unwrap();
                            writeln!(self.s, "    {d}_1 = sext {} to {bv}", qdep[mask]).unwrap();
                            writeln!(self.s, "    {d}_2 = or {bv} {d}_0, {d}_1").unwrap();
                            writeln!(self.s, "    {d} = bitcast {bv} {d}_2 to {tv}").unwrap();
                        }
                        _ => panic!("xor between a value and a mask"),
                    }
                } else if ty.is_float() {
                    let bv = format!("<{w} x {}>", ty.name_llvm_bin());
                    writeln!(self.s, "    {d}_0 = bitcast {} to {bv}", qdep[0]).unwrap();
                    writeln!(self.s, "    {d}_1 = bitcast {} to {bv}", qdep[1]).unwrap();
                    writeln!(self.s, "    {d}_2 = {name} {bv} {d}_0, {d}_1").unwrap();
                    writeln!(self.s, "    {d} = bitcast {bv} {d}_2 to {tv}").unwrap();
                } else {
                    writeln!(self.s, "    {d} = {name} {}, {}", qdep[0], dep[1]).unwrap();
                }
            }

            Op::Shl => writeln!(self.s, "    {d} = shl {}, {}", qdep[0], dep[1]).unwrap(),
            Op::Shr => {
                let op = if ty.is_uint() { "lshr" } else { "ashr" };
                writeln!(self.s, "    {d} = {op} {}, {}", qdep[0], dep[1]).unwrap();
            }

            Op::Cast => self.cast(id, v, &d, &qdep[0], dep_ty[0]),

            Op::Bitcast => {
                writeln!(self.s, "    {d} = bitcast {} to {tv}", qdep[0]).unwrap();
            }

            Op::Select => {
                writeln!(
                    self.s,
                    "    {d} = select {}, {}, {}",
                    qdep[0], qdep[1], qdep[2]
                )
                .unwrap();
            }

            Op::Gather => {
                let is_bool = ty.is_bool();
                let lt = if is_bool { "i8".to_string() } else { t.clone() };
                let lv = format!("<{w} x {lt}>");
                let ltp = self.ptr_to(&lt);
                let pv = format!("<{w} x {ltp}>");
                let mangle = self.masked_mangle(ty);
                let a = self.align(ty);
                self.decl(format!(
                    "declare {lv} @llvm.masked.gather.{mangle}({pv}, i32, <{w} x i1>, {lv})"
                ));
                if self.opts.opaque_pointers {
                    writeln!(
                        self.s,
                        "    {d}_1 = getelementptr {lt}, ptr {}, {}",
                        dep[0], qdep[1]
                    )
                    .unwrap();
                } else {
                    writeln!(self.s, "    {d}_0 = bitcast i8* {} to {lt}*", dep[0]).unwrap();
                    writeln!(
                        self.s,
                        "    {d}_1 = getelementptr {lt}, {lt}* {d}_0, {}",
                        qdep[1]
                    )
                    .unwrap();
                }
                let dst = if is_bool { format!("{d}_2") } else { d.clone() };
                writeln!(
                    self.s,
                    "    {dst} = call {lv} @llvm.masked.gather.{mangle}({pv} {d}_1, i32 {a}, {}, {lv} zeroinitializer)",
                    qdep[2]
                )
                .unwrap();
                if is_bool {
                    writeln!(self.s, "    {d} = trunc <{w} x i8> {d}_2 to <{w} x i1>").unwrap();
                }
            }

            Op::Scatter(op) => self.scatter(id, v, *op),

            Op::ScatterInc => self.scatter_inc(id, v),

            Op::LoopStart => {
                let u = self.layout.serial(id);
                writeln!(self.s, "    br label %l_{u}_before\n").unwrap();
                writeln!(self.s, "l_{u}_before:").unwrap();
                writeln!(self.s, "    br label %l_{u}_cond\n").unwrap();
                writeln!(self.s, "l_{u}_cond:").unwrap();
            }

            Op::LoopPhi => {
                let start = v.dep[0];
                let u = self.layout.serial(start);
                let data = &self.st.loops[&start];
                let slot = v.literal as usize;
                let outer = self.reg(data.outer_in[slot]);
                let inner = self.reg(data.inner_out[slot]);
                writeln!(
                    self.s,
                    "    {d} = phi {tv} [ {outer}, %l_{u}_before ], [ {inner}, %l_{u}_end ]"
                )
                .unwrap();
            }

            Op::LoopCond => {
                let u = self.layout.serial(v.dep[0]);
                self.decl(format!(
                    "declare i1 @llvm.vector.reduce.or.v{w}i1(<{w} x i1>)"
                ));
                writeln!(
                    self.s,
                    "    {d}_red = call i1 @llvm.vector.reduce.or.v{w}i1({})",
                    qdep[1]
                )
                .unwrap();
                writeln!(
                    self.s,
                    "    br i1 {d}_red, label %l_{u}_body, label %l_{u}_done\n"
                )
                .unwrap();
                writeln!(self.s, "l_{u}_body:").unwrap();
            }

            Op::LoopEnd => {
                let u = self.layout.serial(v.dep[0]);
                writeln!(self.s, "    br label %l_{u}_end\n").unwrap();
                writeln!(self.s, "l_{u}_end:").unwrap();
                writeln!(self.s, "    br label %l_{u}_cond\n").unwrap();
                writeln!(self.s, "l_{u}_done:").unwrap();
            }

            // The output aliases its phi register; nothing to emit.
            Op::LoopOutput => {}

            Op::Call => self.call(id, v),

            // Loaded from the staging buffer by the call lowering.
            Op::CallOutput => {}

            Op::Custom(stmt) => {
                let expanded =
                    template::expand(stmt, &template::Ctx::llvm(self.st, self.layout, id, self.opts));
                for line in expanded.lines() {
                    writeln!(self.s, "    {line}").unwrap();
                }
            }
        }
    }

    fn float_intrinsic(&mut self, d: &str, tv: &str, name: &str, h: &str, a0: &str) {
        let w = self.w();
        self.decl(format!("declare {tv} @llvm.{name}.v{w}{h}({tv})"));
        writeln!(self.s, "    {d} = call {tv} @llvm.{name}.v{w}{h}({a0})").unwrap();
    }

    fn cast(&mut self, id: VarId, _v: &Variable, d: &str, q0: &str, src: VarType) {
        let dst = self.ty_of(id);
        let tv = self.tv(id);
        let t = self.t(id);
        let w = self.w();

        if dst.is_bool() {
            let op = if src.is_float() { "fcmp one" } else { "icmp ne" };
            writeln!(self.s, "    {d} = {op} {q0}, zeroinitializer").unwrap();
        } else if src.is_bool() {
            let one = if dst.is_float() { "1.0" } else { "1" };
            writeln!(self.s, "    {d}_1 = insertelement {tv} undef, {t} {one}, i32 0").unwrap();
            writeln!(
                self.s,
                "    {d}_2 = shufflevector {tv} {d}_1, {tv} undef, <{w} x i32> zeroinitializer"
            )
            .unwrap();
            writeln!(
                self.s,
                "    {d} = select {q0}, {tv} {d}_2, {tv} zeroinitializer"
            )
            .unwrap();
        } else if dst.is_float() && !src.is_float() {
            let op = if src.is_uint() { "uitofp" } else { "sitofp" };
            writeln!(self.s, "    {d} = {op} {q0} to {tv}").unwrap();
        } else if !dst.is_float() && src.is_float() {
            let op = if dst.is_uint() { "fptoui" } else { "fptosi" };
            writeln!(self.s, "    {d} = {op} {q0} to {tv}").unwrap();
        } else if dst.is_float() && src.is_float() {
            let widen = dst.size() > src.size();
            let through_f32 = (dst == VarType::F64 && src == VarType::F16)
                || (dst == VarType::F16 && src == VarType::F64);
            if through_f32 {
                // Direct half/double conversion has no cheap lowering on
                // common targets; hop through float.
                let op = if widen { "fpext" } else { "fptrunc" };
                writeln!(self.s, "    {d}_c0 = {op} {q0} to <{w} x float>").unwrap();
                writeln!(self.s, "    {d} = {op} <{w} x float> {d}_c0 to {tv}").unwrap();
            } else if widen {
                writeln!(self.s, "    {d} = fpext {q0} to {tv}").unwrap();
            } else {
                writeln!(self.s, "    {d} = fptrunc {q0} to {tv}").unwrap();
            }
        } else if dst.size() < src.size() {
            writeln!(self.s, "    {d} = trunc {q0} to {tv}").unwrap();
        } else if dst.size() > src.size() {
            let op = if src.is_uint() { "zext" } else { "sext" };
            writeln!(self.s, "    {d} = {op} {q0} to {tv}").unwrap();
        } else {
            writeln!(self.s, "    {d} = bitcast {q0} to {tv}").unwrap();
        }
    }

    fn scatter(&mut self, id: VarId, v: &Variable, op: ReduceOp) {
        let w = self.w();
        let d = self.reg(id);
        let value = v.dep[1];
        let vt = self.ty_of(value);
        let is_bool = vt.is_bool();
        let lt = if is_bool { "i8".to_string() } else { self.t(value) };
        let lv = format!("<{w} x {lt}>");
        let ltp = self.ptr_to(&lt);
        let pv = format!("<{w} x {ltp}>");
        let a = self.align(vt);
        let qi = self.qv(v.dep[2]);
        let qm = self.qv(v.dep[3]);
        let qval = self.qv(value);
        let ptr = self.reg(v.dep[0]);
        let val = self.reg(value);

        if self.opts.opaque_pointers {
            writeln!(self.s, "    {d}_1 = getelementptr {lt}, ptr {ptr}, {qi}").unwrap();
        } else {
            writeln!(self.s, "    {d}_0 = bitcast i8* {ptr} to {lt}*").unwrap();
            writeln!(self.s, "    {d}_1 = getelementptr {lt}, {lt}* {d}_0, {qi}").unwrap();
        }

        if matches!(op, ReduceOp::None) {
            let mangle = self.masked_mangle(vt);
            self.decl(format!(
                "declare void @llvm.masked.scatter.{mangle}({lv}, {pv}, i32, <{w} x i1>)"
            ));
            let stored = if is_bool {
                writeln!(self.s, "    {d}_z = zext {qval} to {lv}").unwrap();
                format!("{d}_z")
            } else {
                val
            };
            writeln!(
                self.s,
                "    call void @llvm.masked.scatter.{mangle}({lv} {stored}, {pv} {d}_1, i32 {a}, {qm})"
            )
            .unwrap();
            return;
        }

        assert!(!is_bool, "atomic scatter reduction over booleans");
        let h = vt.name_llvm_abbrev();
        let tvv = self.vec(vt);
        let (iname, aname, identity) = match (op, vt.is_float(), vt.is_uint()) {
            (ReduceOp::Add, true, _) => ("fadd", "fadd", "-0.0".to_string()),
            (ReduceOp::Add, false, _) => ("add", "add", "0".to_string()),
            (ReduceOp::Min, true, _) => ("fmin", "fmin", float_inf(vt, false)),
            (ReduceOp::Min, false, true) => ("umin", "umin", "-1".to_string()),
            (ReduceOp::Min, false, false) => ("smin", "min", int_max(vt)),
            (ReduceOp::Max, true, _) => ("fmax", "fmax", float_inf(vt, true)),
            (ReduceOp::Max, false, true) => ("umax", "umax", "0".to_string()),
            (ReduceOp::Max, false, false) => ("smax", "max", int_min(vt)),
            (ReduceOp::And, _, _) => ("and", "and", "-1".to_string()),
            (ReduceOp::Or, _, _) => ("or", "or", "0".to_string()),
            (ReduceOp::Mul, _, _) => panic!("atomic scatter-multiply is not supported"),
            (ReduceOp::None, _, _) => unreachable!(),
        };
        let identity_splat = self.splat(&lt, &identity);

        self.decl(format!(
            "declare i1 @llvm.vector.reduce.or.v{w}i1(<{w} x i1>)"
        ));
        let (reduce_decl, reduce_call) = if matches!(op, ReduceOp::Add) && vt.is_float() {
            (
                format!("declare {lt} @llvm.vector.reduce.fadd.v{w}{h}({lt}, {tvv})"),
                format!(
                    "call reassoc {lt} @llvm.vector.reduce.fadd.v{w}{h}({lt} -0.0, {tvv} %value_cur)"
                ),
            )
        } else {
            (
                format!("declare {lt} @llvm.vector.reduce.{iname}.v{w}{h}({tvv})"),
                format!("call {lt} @llvm.vector.reduce.{iname}.v{w}{h}({tvv} %value_cur)"),
            )
        };
        self.decl(reduce_decl);

        // One atomic per unique target address per packet: pick a lane,
        // combine every active lane aiming at the same address, write once.
        self.decl(format!(
            "define internal void @reduce_{iname}_{h}({pv} %ptr, {tvv} %value, <{w} x i1> %active_in) #0 {{\n\
             L0:\n\
             \x20   br label %L1\n\n\
             L1:\n\
             \x20   %index = phi i32 [ 0, %L0 ], [ %index_next, %L3 ]\n\
             \x20   %active = phi <{w} x i1> [ %active_in, %L0 ], [ %active_next_2, %L3 ]\n\
             \x20   %active_i = extractelement <{w} x i1> %active, i32 %index\n\
             \x20   br i1 %active_i, label %L2, label %L3\n\n\
             L2:\n\
             \x20   %ptr_0 = extractelement {pv} %ptr, i32 %index\n\
             \x20   %ptr_1 = insertelement {pv} undef, {ltp} %ptr_0, i32 0\n\
             \x20   %ptr_2 = shufflevector {pv} %ptr_1, {pv} undef, <{w} x i32> zeroinitializer\n\
             \x20   %ptr_eq = icmp eq {pv} %ptr, %ptr_2\n\
             \x20   %active_cur = and <{w} x i1> %ptr_eq, %active\n\
             \x20   %value_cur = select <{w} x i1> %active_cur, {tvv} %value, {tvv} {identity_splat}\n\
             \x20   %reduced = {reduce_call}\n\
             \x20   atomicrmw {aname} {ltp} %ptr_0, {lt} %reduced monotonic\n\
             \x20   %active_next = xor <{w} x i1> %active, %active_cur\n\
             \x20   %active_red = call i1 @llvm.vector.reduce.or.v{w}i1(<{w} x i1> %active_next)\n\
             \x20   br i1 %active_red, label %L3, label %L4\n\n\
             L3:\n\
             \x20   %active_next_2 = phi <{w} x i1> [ %active, %L1 ], [ %active_next, %L2 ]\n\
             \x20   %index_next = add nuw nsw i32 %index, 1\n\
             \x20   %cond_2 = icmp eq i32 %index_next, {w}\n\
             \x20   br i1 %cond_2, label %L4, label %L1\n\n\
             L4:\n\
             \x20   ret void\n\
             }}"
        ));

        writeln!(
            self.s,
            "    call void @reduce_{iname}_{h}({pv} {d}_1, {qval}, {qm})"
        )
        .unwrap();
    }

    fn scatter_inc(&mut self, id: VarId, v: &Variable) {
        let w = self.w();
        let d = self.reg(id);
        let ptr = self.reg(v.dep[0]);
        let qi = self.qv(v.dep[1]);
        let qm = self.qv(v.dep[2]);
        let ip = self.ptr_to("i32");
        let ipv = format!("<{w} x {ip}>");

        if self.opts.opaque_pointers {
            writeln!(self.s, "    {d}_1 = getelementptr i32, ptr {ptr}, {qi}").unwrap();
        } else {
            writeln!(self.s, "    {d}_0 = bitcast i8* {ptr} to i32*").unwrap();
            writeln!(self.s, "    {d}_1 = getelementptr i32, i32* {d}_0, {qi}").unwrap();
        }
        writeln!(
            self.s,
            "    {d} = call <{w} x i32> @reduce_inc_u32({ipv} {d}_1, {qm})"
        )
        .unwrap();

        self.decl("declare i32 @llvm.cttz.i32(i32, i1)".to_string());
        self.decl(format!(
            "declare i64 @llvm.vector.reduce.umax.v{w}i64(<{w} x i64>)"
        ));

        // Per packet: pick the highest live address, count its lanes, issue
        // one atomic add, then hand each lane its offset into the range the
        // atomic reserved.
        self.decl(format!(
            "define internal <{w} x i32> @reduce_inc_u32({ipv} %ptrs_in, <{w} x i1> %active_in) #0 {{\n\
             L0:\n\
             \x20   %ptrs_start_0 = select <{w} x i1> %active_in, {ipv} %ptrs_in, {ipv} zeroinitializer\n\
             \x20   %ptrs_start_1 = ptrtoint {ipv} %ptrs_start_0 to <{w} x i64>\n\
             \x20   br label %L1\n\n\
             L1:\n\
             \x20   %ptrs = phi <{w} x i64> [ %ptrs_start_1, %L0 ], [ %ptrs_next, %L4 ]\n\
             \x20   %out = phi <{w} x i32> [ zeroinitializer, %L0 ], [ %out_next, %L4 ]\n\
             \x20   %ptr = call i64 @llvm.vector.reduce.umax.v{w}i64(<{w} x i64> %ptrs)\n\
             \x20   %done = icmp eq i64 %ptr, 0\n\
             \x20   br i1 %done, label %L5, label %L2\n\n\
             L2:\n\
             \x20   %ptr_b0 = insertelement <{w} x i64> undef, i64 %ptr, i32 0\n\
             \x20   %ptr_b1 = shufflevector <{w} x i64> %ptr_b0, <{w} x i64> undef, <{w} x i32> zeroinitializer\n\
             \x20   %active_v = icmp eq <{w} x i64> %ptr_b1, %ptrs\n\
             \x20   %active_i0 = bitcast <{w} x i1> %active_v to i{w}\n\
             \x20   %active_i1 = zext i{w} %active_i0 to i32\n\
             \x20   %ptrs_next = select <{w} x i1> %active_v, <{w} x i64> zeroinitializer, <{w} x i64> %ptrs\n\
             \x20   br label %L3\n\n\
             L3:\n\
             \x20   %active = phi i32 [ %active_i1, %L2 ], [ %active_next, %L3 ]\n\
             \x20   %accum = phi i32 [ 0, %L2 ], [ %accum_next, %L3 ]\n\
             \x20   %out_2 = phi <{w} x i32> [ %out, %L2 ], [ %out_2_next, %L3 ]\n\
             \x20   %lane = call i32 @llvm.cttz.i32(i32 %active, i1 1)\n\
             \x20   %lane_bit = shl nuw nsw i32 1, %lane\n\
             \x20   %active_next = xor i32 %active, %lane_bit\n\
             \x20   %accum_next = add nuw nsw i32 %accum, 1\n\
             \x20   %out_2_next = insertelement <{w} x i32> %out_2, i32 %accum, i32 %lane\n\
             \x20   %done_2 = icmp eq i32 %active_next, 0\n\
             \x20   br i1 %done_2, label %L4, label %L3\n\n\
             L4:\n\
             \x20   %ptr_p = inttoptr i64 %ptr to {ip}\n\
             \x20   %prev = atomicrmw add {ip} %ptr_p, i32 %accum_next monotonic\n\
             \x20   %prev_b0 = insertelement <{w} x i32> undef, i32 %prev, i32 0\n\
             \x20   %prev_b1 = shufflevector <{w} x i32> %prev_b0, <{w} x i32> undef, <{w} x i32> zeroinitializer\n\
             \x20   %sum = add <{w} x i32> %prev_b1, %out_2_next\n\
             \x20   %out_next = select <{w} x i1> %active_v, <{w} x i32> %sum, <{w} x i32> %out\n\
             \x20   br label %L1\n\n\
             L5:\n\
             \x20   ret <{w} x i32> %out\n\
             }}"
        ));
    }

    /// Buffer layout of an indirect call: per-slot byte offsets (scaled by
    /// the vector width at the use site), total bytes and alignment.
    fn call_layout(&self, data: &CallData) -> (Vec<u32>, Vec<u32>, u32, u32) {
        let w = self.w();
        let mut off = 0u32;
        let mut align = 1u32;
        let mut in_offsets = Vec::with_capacity(data.inputs.len());
        for &input in &data.inputs {
            let elem = self.st.var(input).ty.size().max(1) as u32;
            off = off.div_ceil(elem) * elem;
            in_offsets.push(off);
            off += elem;
            align = align.max(elem * w);
        }
        let mut out_offsets = Vec::with_capacity(data.out_tys.len());
        for ty in &data.out_tys {
            let elem = ty.size().max(1) as u32;
            off = off.div_ceil(elem) * elem;
            out_offsets.push(off);
            off += elem;
            align = align.max(elem * w);
        }
        (in_offsets, out_offsets, off * w, align)
    }

    fn call(&mut self, id: VarId, v: &Variable) {
        let w = self.w();
        let u = self.layout.serial(id);
        let data = self.st.calls[&id].clone();
        let (in_offsets, out_offsets, _, _) = self.call_layout(&data);
        let qself = self.qv(v.dep[0]);
        let pp = self.pt("i8*");
        let sentinel = self.splat("i32", "-1");

        // Callable function pointer table.
        let fnty = format!("void (<{w} x i1>, {pp})");
        let slot_ty = if self.opts.opaque_pointers {
            "ptr".to_string()
        } else {
            format!("{fnty}*")
        };
        let table_ty = format!("[{} x {slot_ty}]", data.n_inst);
        {
            let mut table = format!("@callables_{u} = internal constant {table_ty} [");
            for (i, entry) in data.entries.iter().enumerate() {
                if i > 0 {
                    table.push_str(", ");
                }
                write!(table, "{slot_ty} @{entry}").unwrap();
            }
            table.push(']');
            self.decl(table);
        }
        for body in &data.callables {
            self.decl(body.clone());
        }
        self.decl(format!(
            "declare i32 @llvm.vector.reduce.umin.v{w}i32(<{w} x i32>)"
        ));

        writeln!(self.s, "    br label %l{u}_start\n").unwrap();
        writeln!(self.s, "l{u}_start:").unwrap();
        writeln!(self.s, "    ; Call: {}", data.name).unwrap();

        // Stage the inputs.
        for (i, &input) in data.inputs.iter().enumerate() {
            let ity = self.st.var(input).ty;
            let mv = self.mtv(ity);
            let mvp = self.ptr_to(&mv);
            let a = self.align(ity) * w as usize;
            let byte_off = in_offsets[i] * w;
            writeln!(
                self.s,
                "    %u{u}_in{i}_0 = getelementptr inbounds i8, {pp} %buffer, i32 {byte_off}"
            )
            .unwrap();
            if !self.opts.opaque_pointers {
                writeln!(
                    self.s,
                    "    %u{u}_in{i}_1 = bitcast i8* %u{u}_in{i}_0 to {mv}*"
                )
                .unwrap();
            }
            let slot = if self.opts.opaque_pointers {
                format!("%u{u}_in{i}_0")
            } else {
                format!("%u{u}_in{i}_1")
            };
            let qin = self.qv(input);
            if ity.is_bool() {
                writeln!(self.s, "    %u{u}_in{i}_z = zext {qin} to {mv}").unwrap();
                writeln!(
                    self.s,
                    "    store {mv} %u{u}_in{i}_z, {mvp} {slot}, align {a}"
                )
                .unwrap();
            } else {
                writeln!(self.s, "    store {qin}, {mvp} {slot}, align {a}").unwrap();
            }
        }

        // Clear the output slots so inactive lanes read zeros.
        for (i, ty) in data.out_tys.iter().enumerate() {
            let mv = self.mtv(*ty);
            let mvp = self.ptr_to(&mv);
            let a = self.align(*ty) * w as usize;
            let byte_off = out_offsets[i] * w;
            writeln!(
                self.s,
                "    %u{u}_tmp{i}_0 = getelementptr inbounds i8, {pp} %buffer, i32 {byte_off}"
            )
            .unwrap();
            if !self.opts.opaque_pointers {
                writeln!(
                    self.s,
                    "    %u{u}_tmp{i}_1 = bitcast i8* %u{u}_tmp{i}_0 to {mv}*"
                )
                .unwrap();
            }
            let slot = if self.opts.opaque_pointers {
                format!("%u{u}_tmp{i}_0")
            } else {
                format!("%u{u}_tmp{i}_1")
            };
            writeln!(
                self.s,
                "    store {mv} zeroinitializer, {mvp} {slot}, align {a}"
            )
            .unwrap();
        }

        // Inactive and null-instance lanes park at the sentinel so the
        // reduction below always picks the lowest live instance.
        let mask_reg = self.reg(v.dep[1]);
        writeln!(self.s, "    %u{u}_nz = icmp ne {qself}, zeroinitializer").unwrap();
        writeln!(self.s, "    %u{u}_act = and <{w} x i1> {mask_reg}, %u{u}_nz").unwrap();
        writeln!(
            self.s,
            "    %u{u}_self_initial = select <{w} x i1> %u{u}_act, {qself}, <{w} x i32> {sentinel}"
        )
        .unwrap();

        writeln!(self.s, "    br label %l{u}_check\n").unwrap();
        writeln!(self.s, "l{u}_check:").unwrap();
        writeln!(
            self.s,
            "    %u{u}_self = phi <{w} x i32> [ %u{u}_self_initial, %l{u}_start ], [ %u{u}_self_next, %l{u}_call ]"
        )
        .unwrap();
        writeln!(
            self.s,
            "    %u{u}_next = call i32 @llvm.vector.reduce.umin.v{w}i32(<{w} x i32> %u{u}_self)"
        )
        .unwrap();
        writeln!(self.s, "    %u{u}_valid = icmp ne i32 %u{u}_next, -1").unwrap();
        writeln!(
            self.s,
            "    br i1 %u{u}_valid, label %l{u}_call, label %l{u}_end\n"
        )
        .unwrap();

        writeln!(self.s, "l{u}_call:").unwrap();
        writeln!(
            self.s,
            "    %u{u}_bcast_0 = insertelement <{w} x i32> undef, i32 %u{u}_next, i32 0"
        )
        .unwrap();
        writeln!(
            self.s,
            "    %u{u}_bcast = shufflevector <{w} x i32> %u{u}_bcast_0, <{w} x i32> undef, <{w} x i32> zeroinitializer"
        )
        .unwrap();
        writeln!(
            self.s,
            "    %u{u}_active = icmp eq <{w} x i32> %u{u}_self, %u{u}_bcast"
        )
        .unwrap();
        writeln!(self.s, "    %u{u}_inst = sub i32 %u{u}_next, 1").unwrap();
        if self.opts.opaque_pointers {
            writeln!(
                self.s,
                "    %u{u}_func_0 = getelementptr inbounds {table_ty}, ptr @callables_{u}, i32 0, i32 %u{u}_inst"
            )
            .unwrap();
            writeln!(self.s, "    %u{u}_func = load ptr, ptr %u{u}_func_0").unwrap();
        } else {
            writeln!(
                self.s,
                "    %u{u}_func_0 = getelementptr inbounds {table_ty}, {table_ty}* @callables_{u}, i32 0, i32 %u{u}_inst"
            )
            .unwrap();
            writeln!(
                self.s,
                "    %u{u}_func = load {fnty}*, {fnty}** %u{u}_func_0"
            )
            .unwrap();
        }
        writeln!(
            self.s,
            "    call void %u{u}_func(<{w} x i1> %u{u}_active, {pp} %buffer)"
        )
        .unwrap();
        writeln!(
            self.s,
            "    %u{u}_self_next = select <{w} x i1> %u{u}_active, <{w} x i32> {sentinel}, <{w} x i32> %u{u}_self"
        )
        .unwrap();
        writeln!(self.s, "    br label %l{u}_check\n").unwrap();

        writeln!(self.s, "l{u}_end:").unwrap();

        // Read the outputs back into the registers of their output nodes.
        for (i, &out) in data.outputs.iter().enumerate() {
            if !self.layout.has_reg(out) {
                continue;
            }
            let oty = self.st.var(out).ty;
            let reg = self.reg(out);
            let mv = self.mtv(oty);
            let mvp = self.ptr_to(&mv);
            let a = self.align(oty) * w as usize;
            let byte_off = out_offsets[i] * w;
            writeln!(
                self.s,
                "    %u{u}_o{i}_0 = getelementptr inbounds i8, {pp} %buffer, i32 {byte_off}"
            )
            .unwrap();
            if !self.opts.opaque_pointers {
                writeln!(self.s, "    %u{u}_o{i}_1 = bitcast i8* %u{u}_o{i}_0 to {mv}*").unwrap();
            }
            let slot = if self.opts.opaque_pointers {
                format!("%u{u}_o{i}_0")
            } else {
                format!("%u{u}_o{i}_1")
            };
            if oty.is_bool() {
                writeln!(self.s, "    {reg}_z = load {mv}, {mvp} {slot}, align {a}").unwrap();
                writeln!(
                    self.s,
                    "    {reg} = trunc {mv} {reg}_z to <{w} x i1>"
                )
                .unwrap();
            } else {
                writeln!(self.s, "    {reg} = load {mv}, {mvp} {slot}, align {a}").unwrap();
            }
        }
    }
}

/// Literal rendering. Float constants print as extended hex (single
/// precision widened to double bits, as the IR grammar requires).
fn literal_str(ty: VarType, bits: u64) -> String {
    match ty {
        VarType::Bool => if bits & 1 != 0 { "1" } else { "0" }.to_string(),
        VarType::F16 => format!("0xH{:04X}", bits as u16),
        VarType::F32 => {
            let value = f32::from_bits(bits as u32) as f64;
            format!("0x{:016X}", value.to_bits())
        }
        VarType::F64 => format!("0x{bits:016X}"),
        t if t.is_sint() => {
            let shift = 64 - 8 * t.size() as u32;
            format!("{}", ((bits << shift) as i64) >> shift)
        }
        _ => format!("{bits}"),
    }
}

/// Infinity literal of the given float type; `negative` selects the sign.
/// The reduction identity of fmin is +inf, of fmax -inf.
fn float_inf(ty: VarType, negative: bool) -> String {
    match (ty, negative) {
        (VarType::F16, false) => "0xH7C00".to_string(),
        (VarType::F16, true) => "0xHFC00".to_string(),
        (_, false) => "0x7FF0000000000000".to_string(),
        (_, true) => "0xFFF0000000000000".to_string(),
    }
}

fn int_max(ty: VarType) -> String {
    match ty {
        VarType::I8 => i8::MAX.to_string(),
        VarType::I16 => i16::MAX.to_string(),
        VarType::I32 => i32::MAX.to_string(),
        _ => i64::MAX.to_string(),
    }
}

fn int_min(ty: VarType) -> String {
    match ty {
        VarType::I8 => i8::MIN.to_string(),
        VarType::I16 => i16::MIN.to_string(),
        VarType::I32 => i32::MIN.to_string(),
        _ => i64::MIN.to_string(),
    }
}
