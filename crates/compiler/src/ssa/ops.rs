//! SSA operations.
//!
//! One flat enum: generic ops produced by the builder and rewritten by
//! the pass suite, then the sized `Wasm*` ops produced by lower_wasm.
//! Payloads live in the owning value's `aux` / `aux_int`.

/// Operation discriminant for an SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Freed slot awaiting reuse.
    Invalid,

    // Structural
    /// Formal parameter; `aux_int` is the Wasm argument slot.
    Arg,
    Phi,
    Copy,
    /// Unresolved variable read; `aux_int` is the local index.
    FwdRef,
    /// Extract result `aux_int` from a multi-result call.
    SelectN,

    // Constants
    /// Integer constant in `aux_int` (also carries BOOL values).
    ConstI64,
    /// Float constant in `aux` (F64).
    ConstF64,
    /// A whole string literal; `aux_int` indexes the module string table.
    ConstString,
    /// Pointer to a string literal's bytes; resolved to a data offset at
    /// codegen. `aux_int` indexes the module string table.
    ConstStringPtr,

    // Pair construction / extraction
    StringMake,
    SliceMake,
    StringPtr,
    StringLen,
    SlicePtr,
    SliceLen,
    StringConcat,

    // Generic arithmetic, typed by the value's TypeIndex
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Conversions; `aux_int` carries the relevant bit width
    SignExt,
    ZeroExt,
    Trunc,
    IToF,
    FToI,

    // Memory
    Load,
    Store,
    /// Byte copy; `aux_int` is the byte count. args: [dst, src]
    Move,
    /// Frame slot address; `aux_int` is the frame offset.
    LocalAddr,
    /// Module-level variable address; `aux` names it.
    GlobalAddr,
    /// Type metadata record address; `aux` names the type. Resolved at
    /// link time.
    MetadataAddr,
    /// args: [ptr]; `aux_int` is a constant byte offset.
    AddPtr,
    /// args: [ptr, index]; `aux_int` is the element size.
    OffPtr,

    /// Direct call; `aux` names the callee.
    StaticCall,

    // Sized Wasm ops
    WasmI64Add,
    WasmI64Sub,
    WasmI64Mul,
    WasmI64DivS,
    WasmI64DivU,
    WasmI64RemS,
    WasmI64RemU,
    WasmI64And,
    WasmI64Or,
    WasmI64Xor,
    WasmI64Shl,
    WasmI64ShrS,
    WasmI64ShrU,
    WasmI64Eq,
    WasmI64Ne,
    WasmI64LtS,
    WasmI64LtU,
    WasmI64LeS,
    WasmI64LeU,
    WasmI64GtS,
    WasmI64GtU,
    WasmI64GeS,
    WasmI64GeU,
    WasmI64Eqz,
    WasmI64Extend8S,
    WasmI64Extend16S,
    WasmI64Extend32S,
    WasmF64Add,
    WasmF64Sub,
    WasmF64Mul,
    WasmF64Div,
    WasmF64Neg,
    WasmF64Eq,
    WasmF64Ne,
    WasmF64Lt,
    WasmF64Le,
    WasmF64Gt,
    WasmF64Ge,
    WasmF64ConvertI64S,
    WasmI64TruncF64S,
    WasmI64Load,
    WasmI64Load8S,
    WasmI64Load8U,
    WasmI64Load16S,
    WasmI64Load16U,
    WasmI64Load32S,
    WasmI64Load32U,
    WasmF64Load,
    WasmI64Store,
    WasmI64Store8,
    WasmI64Store16,
    WasmI64Store32,
    WasmF64Store,
}

impl Op {
    pub fn is_phi(self) -> bool {
        self == Op::Phi
    }

    pub fn is_const(self) -> bool {
        matches!(
            self,
            Op::ConstI64 | Op::ConstF64 | Op::ConstString | Op::ConstStringPtr
        )
    }

    /// Ops that read memory.
    pub fn is_load(self) -> bool {
        matches!(
            self,
            Op::Load
                | Op::WasmI64Load
                | Op::WasmI64Load8S
                | Op::WasmI64Load8U
                | Op::WasmI64Load16S
                | Op::WasmI64Load16U
                | Op::WasmI64Load32S
                | Op::WasmI64Load32U
                | Op::WasmF64Load
        )
    }

    /// Ops that write memory or have side effects; they act as barriers
    /// in the scheduler's memory ordering.
    pub fn is_barrier(self) -> bool {
        matches!(
            self,
            Op::Store
                | Op::Move
                | Op::StaticCall
                | Op::WasmI64Store
                | Op::WasmI64Store8
                | Op::WasmI64Store16
                | Op::WasmI64Store32
                | Op::WasmF64Store
        )
    }

    pub fn is_mem_op(self) -> bool {
        self.is_load() || self.is_barrier()
    }

    pub fn is_store(self) -> bool {
        matches!(
            self,
            Op::Store
                | Op::WasmI64Store
                | Op::WasmI64Store8
                | Op::WasmI64Store16
                | Op::WasmI64Store32
                | Op::WasmF64Store
        )
    }

    /// Pair-producing make ops. Decomposition accepts either spelling at
    /// every extraction point because STRING is internally a slice.
    pub fn is_make(self) -> bool {
        matches!(self, Op::StringMake | Op::SliceMake)
    }

    /// Comparison ops that leave an i32 on the Wasm stack.
    pub fn pushes_i32(self) -> bool {
        matches!(
            self,
            Op::WasmI64Eq
                | Op::WasmI64Ne
                | Op::WasmI64LtS
                | Op::WasmI64LtU
                | Op::WasmI64LeS
                | Op::WasmI64LeU
                | Op::WasmI64GtS
                | Op::WasmI64GtU
                | Op::WasmI64GeS
                | Op::WasmI64GeU
                | Op::WasmI64Eqz
                | Op::WasmF64Eq
                | Op::WasmF64Ne
                | Op::WasmF64Lt
                | Op::WasmF64Le
                | Op::WasmF64Gt
                | Op::WasmF64Ge
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_ops() {
        assert!(Op::StringMake.is_make());
        assert!(Op::SliceMake.is_make());
        assert!(!Op::StringConcat.is_make());
    }

    #[test]
    fn test_barriers() {
        assert!(Op::Store.is_barrier());
        assert!(Op::StaticCall.is_barrier());
        assert!(Op::Move.is_barrier());
        assert!(!Op::Load.is_barrier());
        assert!(Op::Load.is_mem_op());
    }

    #[test]
    fn test_comparisons_push_i32() {
        assert!(Op::WasmI64Eq.pushes_i32());
        assert!(!Op::WasmI64Add.pushes_i32());
    }
}
