use half::f16;

/// Scalar type of a traced variable.
///
/// `Pointer` is the type of direct-pointer nodes (buffer addresses passed
/// through the parameter table), `Void` the type of pure side effects, and
/// `Global` the type of module-level text fragments (intrinsic declarations,
/// helper subroutines) that take part in scheduling but produce no value.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum VarType {
    #[default]
    Void,
    Global,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    F32,
    F64,
    Pointer,
}

impl VarType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        use VarType::*;
        match self {
            Void | Global => 0,
            Bool | I8 | U8 => 1,
            I16 | U16 | F16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 | Pointer => 8,
        }
    }

    pub fn is_int(self) -> bool {
        use VarType::*;
        matches!(self, I8 | U8 | I16 | U16 | I32 | U32 | I64 | U64)
    }

    pub fn is_sint(self) -> bool {
        use VarType::*;
        matches!(self, I8 | I16 | I32 | I64)
    }

    pub fn is_uint(self) -> bool {
        use VarType::*;
        matches!(self, U8 | U16 | U32 | U64 | Pointer)
    }

    pub fn is_float(self) -> bool {
        use VarType::*;
        matches!(self, F16 | F32 | F64)
    }

    pub fn is_bool(self) -> bool {
        matches!(self, VarType::Bool)
    }

    /// PTX register prefix. 16-bit floats share the `%w` (b16) register file.
    pub fn prefix_ptx(self) -> &'static str {
        use VarType::*;
        match self {
            Void | Global => "%u",
            Bool => "%p",
            I8 | U8 => "%b",
            I16 | U16 | F16 => "%w",
            I32 | U32 => "%r",
            I64 | U64 | Pointer => "%rd",
            F32 => "%f",
            F64 => "%d",
        }
    }

    /// LLVM register prefix.
    pub fn prefix_llvm(self) -> &'static str {
        use VarType::*;
        match self {
            Void | Global => "%u",
            Bool => "%p",
            I8 | U8 => "%b",
            I16 | U16 => "%w",
            I32 | U32 => "%r",
            I64 | U64 | Pointer => "%rd",
            F16 => "%h",
            F32 => "%f",
            F64 => "%d",
        }
    }

    /// PTX value type name (`add.s32`, `ld.global.f32`, ...).
    pub fn name_ptx(self) -> &'static str {
        use VarType::*;
        match self {
            Void | Global => "???",
            Bool => "pred",
            I8 => "s8",
            U8 => "u8",
            I16 => "s16",
            U16 => "u16",
            I32 => "s32",
            U32 => "u32",
            I64 => "s64",
            U64 | Pointer => "u64",
            F16 => "f16",
            F32 => "f32",
            F64 => "f64",
        }
    }

    /// PTX binary (typeless) view, used by `mov`/bitwise instructions.
    pub fn name_ptx_bin(self) -> &'static str {
        use VarType::*;
        match self {
            Void | Global => "???",
            Bool => "pred",
            I8 | U8 => "b8",
            I16 | U16 | F16 => "b16",
            I32 | U32 | F32 => "b32",
            I64 | U64 | F64 | Pointer => "b64",
        }
    }

    /// LLVM IR scalar type name.
    pub fn name_llvm(self) -> &'static str {
        use VarType::*;
        match self {
            Void | Global => "???",
            Bool => "i1",
            I8 | U8 => "i8",
            I16 | U16 => "i16",
            I32 | U32 => "i32",
            I64 | U64 => "i64",
            F16 => "half",
            F32 => "float",
            F64 => "double",
            Pointer => "i8*",
        }
    }

    /// LLVM IR integer view of the same width (bitcast target).
    pub fn name_llvm_bin(self) -> &'static str {
        use VarType::*;
        match self {
            Void | Global => "???",
            Bool => "i1",
            I8 | U8 => "i8",
            I16 | U16 | F16 => "i16",
            I32 | U32 | F32 => "i32",
            I64 | U64 | F64 | Pointer => "i64",
        }
    }

    /// LLVM IR integer type of twice the width, for `mulhi` widening.
    pub fn name_llvm_big(self) -> &'static str {
        use VarType::*;
        match self {
            I8 | U8 => "i16",
            I16 | U16 => "i32",
            I32 | U32 => "i64",
            I64 | U64 => "i128",
            _ => "???",
        }
    }

    /// Abbreviated name used in intrinsic mangling (`@llvm.sqrt.v8f32`).
    pub fn name_llvm_abbrev(self) -> &'static str {
        use VarType::*;
        match self {
            Void | Global => "???",
            Bool => "i1",
            I8 | U8 => "i8",
            I16 | U16 => "i16",
            I32 | U32 => "i32",
            I64 | U64 => "i64",
            F16 => "f16",
            F32 => "f32",
            F64 => "f64",
            Pointer => "i8*",
        }
    }

    /// Mask-widened scalar type: `i1` promotes to `i8` for memory traffic.
    pub fn name_llvm_mem(self) -> &'static str {
        if self.is_bool() {
            "i8"
        } else {
            self.name_llvm()
        }
    }
}

/// Conversion from Rust scalars to traced types and literal payloads.
pub trait AsVarType: Copy + bytemuck::Pod {
    fn var_ty() -> VarType;

    /// Bit pattern of the value, widened to the 64-bit literal payload.
    fn to_bits(self) -> u64;
}

macro_rules! as_var_type {
    {$($src:ty => $dst:ident;)*} => {
        $(
            impl AsVarType for $src {
                fn var_ty() -> VarType {
                    VarType::$dst
                }
                fn to_bits(self) -> u64 {
                    let mut bits = 0u64;
                    bytemuck::bytes_of_mut(&mut bits)[..core::mem::size_of::<$src>()]
                        .copy_from_slice(bytemuck::bytes_of(&self));
                    bits
                }
            }
        )*
    };
}

as_var_type! {
    i8 => I8;
    u8 => U8;
    i16 => I16;
    u16 => U16;
    i32 => I32;
    u32 => U32;
    i64 => I64;
    u64 => U64;
    f16 => F16;
    f32 => F32;
    f64 => F64;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(VarType::Bool.size(), 1);
        assert_eq!(VarType::F16.size(), 2);
        assert_eq!(VarType::U32.size(), 4);
        assert_eq!(VarType::Pointer.size(), 8);
        assert_eq!(VarType::Void.size(), 0);
    }

    #[test]
    fn register_prefixes() {
        // f16 lives in the 16-bit register file on the PTX side but has its
        // own prefix in LLVM IR.
        assert_eq!(VarType::F16.prefix_ptx(), "%w");
        assert_eq!(VarType::F16.prefix_llvm(), "%h");
        assert_eq!(VarType::Bool.prefix_ptx(), "%p");
        assert_eq!(VarType::U64.prefix_ptx(), "%rd");
    }

    #[test]
    fn literal_payloads() {
        assert_eq!(1.0f32.to_bits_payload(), 0x3f80_0000);
        assert_eq!((-1i16).to_bits_payload(), 0xffff);
        assert_eq!(half::f16::from_f32(1.0).to_bits_payload(), 0x3c00);
    }

    trait Payload {
        fn to_bits_payload(self) -> u64;
    }
    impl<T: AsVarType> Payload for T {
        fn to_bits_payload(self) -> u64 {
            self.to_bits()
        }
    }
}
