//! `$`-escape template expansion for `Custom` nodes.
//!
//! Raw statement templates use `$` escapes (the `%` sign is taken by
//! register names) expanded against the node and its operands. An escape
//! letter may be followed by an operand digit: `0` (or no digit) refers to
//! the node itself, `1`..`4` to its dependencies.
//!
//!  Escape  Example result     Description
//! --------------------------------------------------------------------
//!  $t $T   `float` `<8 x float>`   scalar / vector type
//!  $b $B   `i32` `<8 x i32>`       integer view of the same width
//!  $d $D   `i64` `<8 x i64>`       double-width integer type
//!  $m $M   `i8` `<8 x i8>`         memory type (masks widen to i8)
//!  $h      `f32`                   intrinsic mangling abbreviation
//!  $v $V   `%f5` `<8 x float> %f5` register / qualified register
//!  $a $A   `4` `32`                scalar / vector alignment
//!  $o      `3`                     parameter slot of the variable
//!  $l      `1065353216`            literal payload
//!  $w      `8`                     vector width
//!  $z      `zeroinitializer`       zero constant
//!  $n      newline
//!  $$      literal dollar
//! --------------------------------------------------------------------
//!
//! `{a|b}` renders `a` under typed pointers and `b` under opaque pointers;
//! the one-armed form `{i8*}` renders its content or `ptr` respectively.
//! `$<x$>` renders `x` at the kernel's top level and `<W x x>` inside a
//! callable subroutine. Expansion is byte-exact: kernel cache identity
//! depends on it.

use crate::backend::Backend;
use crate::var::{State, VarId};
use crate::vartype::VarType;

use super::{CodegenOptions, Layout};

pub(crate) struct Ctx<'a> {
    st: &'a State,
    layout: &'a Layout,
    node: VarId,
    backend: Backend,
    width: u32,
    opaque: bool,
    pub in_subroutine: bool,
}

impl<'a> Ctx<'a> {
    pub fn ptx(st: &'a State, layout: &'a Layout, node: VarId) -> Self {
        Self {
            st,
            layout,
            node,
            backend: Backend::Cuda,
            width: 1,
            opaque: false,
            in_subroutine: false,
        }
    }

    pub fn llvm(st: &'a State, layout: &'a Layout, node: VarId, opts: &CodegenOptions) -> Self {
        Self {
            st,
            layout,
            node,
            backend: Backend::Llvm,
            width: opts.width,
            opaque: opts.opaque_pointers,
            in_subroutine: false,
        }
    }

    fn operand(&self, digit: Option<u32>) -> VarId {
        match digit {
            None | Some(0) => self.node,
            Some(i) => {
                let dep = self.st.var(self.node).dep[(i - 1) as usize];
                assert!(dep != 0, "template refers to an absent operand ${i}");
                dep
            }
        }
    }

    fn ty(&self, id: VarId) -> VarType {
        self.st.var(id).ty
    }

    fn scalar(&self, ty: VarType) -> String {
        match self.backend {
            Backend::Cuda => ty.name_ptx().to_string(),
            Backend::Llvm => {
                if ty == VarType::Pointer && self.opaque {
                    "ptr".to_string()
                } else {
                    ty.name_llvm().to_string()
                }
            }
        }
    }

    fn vector(&self, scalar: &str) -> String {
        match self.backend {
            Backend::Cuda => scalar.to_string(),
            Backend::Llvm => format!("<{} x {scalar}>", self.width),
        }
    }

    fn reg(&self, id: VarId) -> String {
        let prefix = match self.backend {
            Backend::Cuda => self.ty(id).prefix_ptx(),
            Backend::Llvm => self.ty(id).prefix_llvm(),
        };
        format!("{prefix}{}", self.layout.reg(id))
    }
}

/// Expands a statement template; see the module header for the escapes.
pub(crate) fn expand(template: &str, ctx: &Ctx) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '$' => {
                let escape = chars.next().expect("dangling '$' in template");
                if escape == '$' {
                    out.push('$');
                    continue;
                }
                if escape == '<' {
                    // $<x$> region: vectorized inside subroutines.
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some('$') => match chars.next() {
                                Some('>') => break,
                                Some(c2) => {
                                    inner.push('$');
                                    inner.push(c2);
                                }
                                None => panic!("unterminated '$<' in template"),
                            },
                            Some(c2) => inner.push(c2),
                            None => panic!("unterminated '$<' in template"),
                        }
                    }
                    let expanded = expand(&inner, ctx);
                    if ctx.in_subroutine {
                        out.push_str(&format!("<{} x {expanded}>", ctx.width));
                    } else {
                        out.push_str(&expanded);
                    }
                    continue;
                }

                let digit = match chars.peek().and_then(|c| c.to_digit(10)) {
                    Some(d) => {
                        chars.next();
                        Some(d)
                    }
                    None => None,
                };
                expand_escape(&mut out, escape, digit, ctx);
            }
            '{' => {
                // Pointer braces, optionally with a typed|opaque alternative.
                let mut body = String::new();
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        break;
                    }
                    body.push(c2);
                }
                let (typed, opaque) = match body.split_once('|') {
                    Some((a, b)) => (a.to_string(), b.to_string()),
                    None => (body.clone(), "ptr".to_string()),
                };
                let chosen = if ctx.opaque { opaque } else { typed };
                out.push_str(&expand(&chosen, ctx));
            }
            c => out.push(c),
        }
    }
    out
}

fn expand_escape(out: &mut String, escape: char, digit: Option<u32>, ctx: &Ctx) {
    use std::fmt::Write;

    match escape {
        'w' => write!(out, "{}", ctx.width).unwrap(),
        'z' => out.push_str(match ctx.backend {
            Backend::Cuda => "0",
            Backend::Llvm => "zeroinitializer",
        }),
        'n' => out.push('\n'),
        _ => {
            let id = ctx.operand(digit);
            let ty = ctx.ty(id);
            match escape {
                't' => out.push_str(&ctx.scalar(ty)),
                'T' => {
                    let s = ctx.scalar(ty);
                    out.push_str(&ctx.vector(&s));
                }
                'b' => out.push_str(match ctx.backend {
                    Backend::Cuda => ty.name_ptx_bin(),
                    Backend::Llvm => ty.name_llvm_bin(),
                }),
                'B' => {
                    let s = match ctx.backend {
                        Backend::Cuda => ty.name_ptx_bin(),
                        Backend::Llvm => ty.name_llvm_bin(),
                    };
                    out.push_str(&ctx.vector(s));
                }
                'd' => out.push_str(ty.name_llvm_big()),
                'D' => out.push_str(&ctx.vector(ty.name_llvm_big())),
                'm' => out.push_str(ty.name_llvm_mem()),
                'M' => out.push_str(&ctx.vector(ty.name_llvm_mem())),
                'h' => out.push_str(ty.name_llvm_abbrev()),
                'v' => out.push_str(&ctx.reg(id)),
                'V' => {
                    let s = ctx.scalar(ty);
                    write!(out, "{} {}", ctx.vector(&s), ctx.reg(id)).unwrap();
                }
                'a' => write!(out, "{}", ty.size().max(1)).unwrap(),
                'A' => write!(out, "{}", ty.size().max(1) * ctx.width as usize).unwrap(),
                'o' => write!(out, "{}", ctx.layout.param_slot(id)).unwrap(),
                'l' => write!(out, "{}", ctx.st.var(id).literal).unwrap(),
                other => panic!("unknown template escape '${other}'"),
            }
        }
    }
}
