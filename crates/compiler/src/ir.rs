//! Pre-SSA intermediate representation.
//!
//! One IR graph per function: NodeIndex-addressed nodes, blocks holding
//! ordered node lists plus a terminator, and indexed locals. The lowerer
//! populates a [`FuncBuilder`] per function; the SSA builder consumes the
//! finished [`IrFunc`]. Every node keeps its source span for diagnostics.

use crate::ast::{BinOp, UnOp};
use crate::diag::Span;
use crate::types::TypeIndex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrBlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub u32);

/// IR operations. Constants, arithmetic, loads/stores, address
/// computation, calls, string/slice primitives, and the symbolic
/// `TypeMetadata` reference resolved at link time.
#[derive(Debug, Clone, PartialEq)]
pub enum IrOp {
    ConstInt(i64),
    ConstFloat(f64),
    ConstBool(bool),
    /// Index into the module string table.
    ConstString(u32),
    Binary(BinOp),
    Unary(UnOp),
    /// Read the i-th formal parameter.
    Param(u32),
    LoadLocal(LocalId),
    /// args: [value]
    StoreLocal(LocalId),
    /// Load through a field of a local without materializing the address.
    LoadLocalField { local: LocalId, offset: u32 },
    /// args: [value]
    StoreLocalField { local: LocalId, offset: u32 },
    LocalAddr(LocalId),
    GlobalAddr(String),
    /// args: [ptr]; loads `ty` from ptr+offset
    PtrLoad { offset: u32 },
    /// args: [ptr, value]
    PtrStore { offset: u32 },
    /// args: [base, index]; produces base + index * elem_size
    IndexAddr { elem_size: u32 },
    /// args: call arguments in order
    Call { name: String },
    /// Symbolic reference to a type's metadata record; resolved to a data
    /// section offset in the backend.
    TypeMetadata { type_name: String },
    /// args: [a, b]; produces a STRING
    StringConcat,
    /// args: [string]
    StringPtr,
    /// args: [string]
    StringLen,
    /// args: [slice]
    SliceLen,
    /// Build a two-component pair value (error union, wide optional).
    /// args: [first, second]
    PairMake,
    /// args: [pair]; component at offset 0 (error tag, optional flag)
    PairFirst,
    /// args: [pair]; component at offset 8 (payload)
    PairSecond,
    /// Byte copy between two addresses. args: [dst, src]
    MemCopy { bytes: u32 },
    /// Numeric conversion from the argument's type to the node's type.
    Cast,
}

/// Block terminators.
#[derive(Debug, Clone, PartialEq)]
pub enum IrTerm {
    Return(Option<NodeIndex>),
    Jump(IrBlockId),
    Branch {
        cond: NodeIndex,
        then_blk: IrBlockId,
        else_blk: IrBlockId,
    },
    /// An unconditional runtime trap (`@panic`, bounds failure).
    Trap,
}

#[derive(Debug, Clone)]
pub struct IrNode {
    pub op: IrOp,
    pub ty: TypeIndex,
    pub args: Vec<NodeIndex>,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct IrBlock {
    pub nodes: Vec<NodeIndex>,
    pub term: Option<IrTerm>,
}

#[derive(Debug, Clone)]
pub struct IrLocal {
    pub name: String,
    pub ty: TypeIndex,
    pub size: u32,
    /// Set when the local's address escapes (`LocalAddr`); such locals
    /// stay in the stack frame instead of becoming SSA variables.
    pub addr_taken: bool,
}

#[derive(Debug)]
pub struct IrFunc {
    pub name: String,
    /// The first `param_count` locals are the formal parameters.
    pub param_count: u32,
    pub ret: TypeIndex,
    pub locals: Vec<IrLocal>,
    pub nodes: Vec<IrNode>,
    pub blocks: Vec<IrBlock>,
    pub entry: IrBlockId,
    pub exported: bool,
}

impl IrFunc {
    pub fn node(&self, idx: NodeIndex) -> &IrNode {
        &self.nodes[idx.0 as usize]
    }

    pub fn block(&self, idx: IrBlockId) -> &IrBlock {
        &self.blocks[idx.0 as usize]
    }

    pub fn local(&self, idx: LocalId) -> &IrLocal {
        &self.locals[idx.0 as usize]
    }
}

#[derive(Debug, Clone)]
pub struct IrGlobal {
    pub name: String,
    pub ty: TypeIndex,
    pub size: u32,
    /// Constant initial value; larger aggregates zero-initialize.
    pub init: i64,
}

#[derive(Debug, Clone)]
pub struct TestEntry {
    pub fn_name: String,
    pub display: String,
}

/// The lowered module handed to the SSA builder and backend.
#[derive(Debug, Default)]
pub struct IrModule {
    pub funcs: Vec<IrFunc>,
    pub globals: Vec<IrGlobal>,
    /// Interned string literals, addressed by index.
    pub strings: Vec<String>,
    string_map: HashMap<String, u32>,
    /// Type names that need a metadata record, in first-use order.
    pub metadata_types: Vec<String>,
    metadata_map: HashMap<String, u32>,
    pub tests: Vec<TestEntry>,
    pub benches: Vec<TestEntry>,
}

impl IrModule {
    pub fn new() -> IrModule {
        IrModule::default()
    }

    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_map.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_map.insert(s.to_string(), idx);
        idx
    }

    pub fn string_len(&self, idx: u32) -> u32 {
        self.strings[idx as usize].len() as u32
    }

    /// Register a type name for the metadata table; returns its id.
    pub fn register_metadata(&mut self, type_name: &str) -> u32 {
        if let Some(&idx) = self.metadata_map.get(type_name) {
            return idx;
        }
        let idx = self.metadata_types.len() as u32;
        self.metadata_types.push(type_name.to_string());
        self.metadata_map.insert(type_name.to_string(), idx);
        idx
    }

    pub fn find_func(&self, name: &str) -> Option<&IrFunc> {
        self.funcs.iter().find(|f| f.name == name)
    }
}

/// Per-function IR builder. Tracks the current block; `emit_*` helpers
/// append a node to it and return its index.
pub struct FuncBuilder {
    name: String,
    param_count: u32,
    ret: TypeIndex,
    locals: Vec<IrLocal>,
    nodes: Vec<IrNode>,
    blocks: Vec<IrBlock>,
    cur: IrBlockId,
    exported: bool,
}

impl FuncBuilder {
    pub fn new(name: &str, ret: TypeIndex, exported: bool) -> FuncBuilder {
        FuncBuilder {
            name: name.to_string(),
            param_count: 0,
            ret,
            locals: Vec::new(),
            nodes: Vec::new(),
            blocks: vec![IrBlock::default()],
            cur: IrBlockId(0),
            exported,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ret_type(&self) -> TypeIndex {
        self.ret
    }

    /// Declare a formal parameter. Must precede any other local.
    pub fn add_param(&mut self, name: &str, ty: TypeIndex, size: u32) -> LocalId {
        debug_assert_eq!(self.param_count as usize, self.locals.len());
        self.param_count += 1;
        self.push_local(name, ty, size)
    }

    pub fn add_local(&mut self, name: &str, ty: TypeIndex, size: u32) -> LocalId {
        self.push_local(name, ty, size)
    }

    fn push_local(&mut self, name: &str, ty: TypeIndex, size: u32) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(IrLocal {
            name: name.to_string(),
            ty,
            size,
            addr_taken: false,
        });
        id
    }

    pub fn local_type(&self, id: LocalId) -> TypeIndex {
        self.locals[id.0 as usize].ty
    }

    pub fn new_block(&mut self) -> IrBlockId {
        let id = IrBlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock::default());
        id
    }

    pub fn switch_to(&mut self, block: IrBlockId) {
        self.cur = block;
    }

    pub fn current(&self) -> IrBlockId {
        self.cur
    }

    /// True once the current block has a terminator; further statements in
    /// the source block are unreachable and skipped.
    pub fn is_terminated(&self) -> bool {
        self.blocks[self.cur.0 as usize].term.is_some()
    }

    pub fn set_term(&mut self, term: IrTerm) {
        let blk = &mut self.blocks[self.cur.0 as usize];
        if blk.term.is_none() {
            blk.term = Some(term);
        }
    }

    pub fn emit(&mut self, op: IrOp, args: Vec<NodeIndex>, ty: TypeIndex, span: Span) -> NodeIndex {
        if let IrOp::LocalAddr(local) = op {
            self.locals[local.0 as usize].addr_taken = true;
        }
        let idx = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(IrNode { op, ty, args, span });
        self.blocks[self.cur.0 as usize].nodes.push(idx);
        idx
    }

    // Convenience emitters for the common shapes.

    pub fn emit_const_int(&mut self, v: i64, ty: TypeIndex, span: Span) -> NodeIndex {
        self.emit(IrOp::ConstInt(v), vec![], ty, span)
    }

    pub fn emit_const_bool(&mut self, v: bool, span: Span) -> NodeIndex {
        self.emit(IrOp::ConstBool(v), vec![], TypeIndex::BOOL, span)
    }

    pub fn emit_load_local(&mut self, local: LocalId, span: Span) -> NodeIndex {
        let ty = self.local_type(local);
        self.emit(IrOp::LoadLocal(local), vec![], ty, span)
    }

    pub fn emit_store_local(&mut self, local: LocalId, value: NodeIndex, span: Span) -> NodeIndex {
        self.emit(IrOp::StoreLocal(local), vec![value], TypeIndex::VOID, span)
    }

    pub fn emit_local_addr(&mut self, local: LocalId, span: Span) -> NodeIndex {
        self.emit(IrOp::LocalAddr(local), vec![], TypeIndex::I64, span)
    }

    pub fn emit_call(
        &mut self,
        name: &str,
        args: Vec<NodeIndex>,
        ty: TypeIndex,
        span: Span,
    ) -> NodeIndex {
        self.emit(IrOp::Call { name: name.to_string() }, args, ty, span)
    }

    pub fn node(&self, idx: NodeIndex) -> &IrNode {
        &self.nodes[idx.0 as usize]
    }

    pub fn finish(self) -> IrFunc {
        IrFunc {
            name: self.name,
            param_count: self.param_count,
            ret: self.ret,
            locals: self.locals,
            nodes: self.nodes,
            blocks: self.blocks,
            entry: IrBlockId(0),
            exported: self.exported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_basic_shape() {
        let mut b = FuncBuilder::new("main", TypeIndex::I64, true);
        let v = b.emit_const_int(42, TypeIndex::I64, Span::none());
        b.set_term(IrTerm::Return(Some(v)));
        let f = b.finish();
        assert_eq!(f.name, "main");
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.block(f.entry).nodes.len(), 1);
        assert!(matches!(f.block(f.entry).term, Some(IrTerm::Return(Some(_)))));
    }

    #[test]
    fn test_local_addr_marks_addr_taken() {
        let mut b = FuncBuilder::new("f", TypeIndex::VOID, false);
        let l = b.add_local("tmp", TypeIndex::I64, 8);
        assert!(!b.locals[l.0 as usize].addr_taken);
        b.emit_local_addr(l, Span::none());
        assert!(b.locals[l.0 as usize].addr_taken);
    }

    #[test]
    fn test_terminator_not_overwritten() {
        let mut b = FuncBuilder::new("f", TypeIndex::VOID, false);
        b.set_term(IrTerm::Return(None));
        b.set_term(IrTerm::Trap);
        let f = b.finish();
        assert!(matches!(f.block(f.entry).term, Some(IrTerm::Return(None))));
    }

    #[test]
    fn test_string_interning() {
        let mut m = IrModule::new();
        let a = m.intern_string("hello");
        let b = m.intern_string("world");
        let c = m.intern_string("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(m.string_len(a), 5);
    }

    #[test]
    fn test_metadata_registration_dedups() {
        let mut m = IrModule::new();
        let a = m.register_metadata("Tracer");
        let b = m.register_metadata("Tracer");
        assert_eq!(a, b);
        assert_eq!(m.metadata_types.len(), 1);
    }
}
