//! Reference interpreter for HIR.
//!
//! Executes a [`MethodIr`] directly so that transformations can be checked
//! for semantic equivalence: run a method, transform it, run it again on the
//! same inputs and compare results and heap contents. Exceptions are not
//! dispatched; a failing check or a `Throw` ends execution with an error.

use super::inst::{ConstValue, InstId, OpndId, Payload, VmHelper};
use super::method::{BlockId, BlockKind, EdgeId, EdgeKind, MethodIr};
use super::opcode::{CmpMod, InstFlags, Opcode, OverflowMod};
use super::types::{FieldId, TypeId, TypeKind};
use rustc_hash::FxHashMap;
use thiserror::Error;

// =============================================================================
// Values
// =============================================================================

/// Location a managed pointer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr {
    Elem { obj: usize, index: i64 },
    Field { obj: usize, field: FieldId },
    Static(FieldId),
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    /// Heap object by index.
    Ref(usize),
    Null,
    Ptr(Addr),
    Tau,
    Vector(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            Value::Int(v) => Some(v as f64),
            _ => None,
        }
    }
}

/// Why execution stopped abnormally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpError {
    #[error("null pointer at instruction {0}")]
    NullPointer(u32),

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("division by zero at instruction {0}")]
    DivideByZero(u32),

    #[error("invalid cast at instruction {0}")]
    ClassCast(u32),

    #[error("negative array size {0}")]
    NegativeArraySize(i64),

    #[error("arithmetic overflow at instruction {0}")]
    Overflow(u32),

    #[error("exception thrown at instruction {0}")]
    Thrown(u32),

    #[error("cannot interpret {0}")]
    Unsupported(&'static str),

    #[error("instruction {inst}: {message}")]
    Malformed { inst: u32, message: String },

    #[error("step limit exceeded")]
    OutOfFuel,
}

type InterpResult<T> = Result<T, InterpError>;

#[derive(Debug, Clone)]
struct HeapObject {
    ty: TypeId,
    elems: Vec<Value>,
    fields: FxHashMap<FieldId, Value>,
}

// =============================================================================
// Interpreter
// =============================================================================

/// Executes one method over a private heap.
pub struct Interpreter<'a> {
    ir: &'a MethodIr,
    heap: Vec<HeapObject>,
    statics: FxHashMap<FieldId, Value>,
    strings: FxHashMap<u32, usize>,
    env: FxHashMap<OpndId, Value>,
    vector_ops: u64,
    fuel: u64,
}

const DEFAULT_FUEL: u64 = 10_000_000;

impl<'a> Interpreter<'a> {
    pub fn new(ir: &'a MethodIr) -> Self {
        Interpreter {
            ir,
            heap: Vec::new(),
            statics: FxHashMap::default(),
            strings: FxHashMap::default(),
            env: FxHashMap::default(),
            vector_ops: 0,
            fuel: DEFAULT_FUEL,
        }
    }

    /// Limit the number of executed instructions.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    /// Allocate an array of `array_ty` holding `values`.
    pub fn alloc_array(&mut self, array_ty: TypeId, values: Vec<Value>) -> Value {
        self.heap.push(HeapObject {
            ty: array_ty,
            elems: values,
            fields: FxHashMap::default(),
        });
        Value::Ref(self.heap.len() - 1)
    }

    /// Elements of an array value.
    pub fn array(&self, v: &Value) -> Option<&[Value]> {
        match *v {
            Value::Ref(o) => self.heap.get(o).map(|h| h.elems.as_slice()),
            _ => None,
        }
    }

    /// Number of vector operations executed so far.
    pub fn vector_ops(&self) -> u64 {
        self.vector_ops
    }

    /// Run the method on `args` and return its result.
    pub fn run(&mut self, args: &[Value]) -> InterpResult<Option<Value>> {
        let ir = self.ir;
        let mut block = ir.entry;
        let mut incoming: Option<EdgeId> = None;
        loop {
            if ir.block(block).kind == BlockKind::Exit {
                return Ok(None);
            }
            if let Some(e) = incoming {
                self.eval_phis(block, e)?;
            }
            let mut next = None;
            let mut ret = None;
            for &i in &ir.block(block).insts {
                if ir.inst(i).opcode == Opcode::Phi {
                    continue;
                }
                if self.fuel == 0 {
                    return Err(InterpError::OutOfFuel);
                }
                self.fuel -= 1;
                match self.exec(i, args)? {
                    Flow::Continue => {}
                    Flow::Edge(e) => next = Some(e),
                    Flow::Return(v) => ret = Some(v),
                }
            }
            if let Some(v) = ret {
                return Ok(v);
            }
            let e = match next {
                Some(e) => e,
                None => ir
                    .block(block)
                    .out_edges
                    .iter()
                    .copied()
                    .find(|&e| ir.edge(e).kind == EdgeKind::Unconditional)
                    .ok_or_else(|| InterpError::Malformed {
                        inst: 0,
                        message: format!("block B{} falls off the CFG", block.index()),
                    })?,
            };
            incoming = Some(e);
            block = ir.edge(e).target;
        }
    }

    fn eval_phis(&mut self, block: BlockId, e: EdgeId) -> InterpResult<()> {
        let ir = self.ir;
        let Some(pos) = ir.in_edge_index(e) else {
            return Ok(());
        };
        let mut updates = Vec::new();
        for phi in ir.phis(block) {
            let inst = ir.inst(phi);
            let src = *inst.srcs.get(pos).ok_or_else(|| malformed(phi, "phi arity"))?;
            if let Some(d) = inst.dst {
                updates.push((d, self.get(src, phi)?));
            }
        }
        for (d, v) in updates {
            self.env.insert(d, v);
        }
        Ok(())
    }

    fn get(&self, opnd: OpndId, at: InstId) -> InterpResult<Value> {
        self.env
            .get(&opnd)
            .cloned()
            .ok_or_else(|| malformed(at, format!("t{} read before definition", opnd.index())))
    }

    fn int(&self, opnd: OpndId, at: InstId) -> InterpResult<i64> {
        self.get(opnd, at)?
            .as_int()
            .ok_or_else(|| malformed(at, "expected integer"))
    }

    fn obj(&self, opnd: OpndId, at: InstId) -> InterpResult<usize> {
        match self.get(opnd, at)? {
            Value::Ref(o) => Ok(o),
            Value::Null => Err(InterpError::NullPointer(at.index())),
            _ => Err(malformed(at, "expected reference")),
        }
    }

    fn zero_of(&self, ty: TypeId) -> Value {
        let kind = self.ir.types.kind(ty);
        if kind.is_floating() {
            Value::Float(0.0)
        } else if kind.is_object() {
            Value::Null
        } else {
            Value::Int(0)
        }
    }

    fn alloc(&mut self, ty: TypeId, len: usize) -> Value {
        let elems = match self.ir.types.element_type(ty) {
            Some(et) if self.ir.types.is_array(ty) => vec![self.zero_of(et); len],
            _ => Vec::new(),
        };
        self.heap.push(HeapObject {
            ty,
            elems,
            fields: FxHashMap::default(),
        });
        Value::Ref(self.heap.len() - 1)
    }

    fn exec(&mut self, i: InstId, args: &[Value]) -> InterpResult<Flow> {
        let ir = self.ir;
        let inst = ir.inst(i);
        let kind = ir.types.kind(inst.ty);
        let value = match inst.opcode {
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Min | Opcode::Max | Opcode::And | Opcode::Or
            | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::MulHi | Opcode::TauDiv | Opcode::TauRem => {
                let a = self.get(inst.src(0), i)?;
                let b = self.get(inst.src(1), i)?;
                if let (Value::Vector(_), _) | (_, Value::Vector(_)) = (&a, &b) {
                    self.vector_ops += 1;
                }
                let lane_kind = if kind == TypeKind::Vector {
                    ir.types.element_type(inst.ty).map(|t| ir.types.kind(t)).unwrap_or(TypeKind::Int32)
                } else {
                    kind
                };
                lanewise(&a, &b, &mut |x, y| binary(inst.opcode, inst.modifier.overflow, inst.modifier.flags, lane_kind, x, y, i))?
            }
            Opcode::Neg | Opcode::Not | Opcode::Abs => {
                let a = self.get(inst.src(0), i)?;
                unary(inst.opcode, kind, a, i)?
            }
            Opcode::ShlAdd => {
                let a = self.int(inst.src(0), i)?;
                let s = self.int(inst.src(1), i)?;
                let b = self.int(inst.src(2), i)?;
                Value::Int(wrap(kind, a.wrapping_shl(s as u32).wrapping_add(b)))
            }
            Opcode::Cmp => {
                let cmp = inst.modifier.cmp.ok_or_else(|| malformed(i, "cmp without relation"))?;
                Value::Int(self.compare(cmp, inst.srcs.as_slice(), i)? as i64)
            }
            Opcode::Select => {
                let cmp = inst.modifier.cmp.ok_or_else(|| malformed(i, "select without relation"))?;
                let pick = if self.compare(cmp, &inst.srcs[..2], i)? { 2 } else { 3 };
                self.get(inst.src(pick), i)?
            }
            Opcode::Conv => {
                let a = self.get(inst.src(0), i)?;
                convert(kind, a, i)?
            }
            Opcode::Branch => {
                let cmp = inst.modifier.cmp.ok_or_else(|| malformed(i, "branch without relation"))?;
                let taken = self.compare(cmp, inst.srcs.as_slice(), i)?;
                let want = if taken { EdgeKind::True } else { EdgeKind::False };
                let e = ir
                    .out_edge_of_kind(inst.block, want)
                    .ok_or_else(|| malformed(i, "branch edge missing"))?;
                return Ok(Flow::Edge(e));
            }
            Opcode::Switch => {
                let idx = self.int(inst.src(0), i)?;
                let Payload::Cases(cases) = &inst.payload else {
                    return Err(malformed(i, "switch without cases"));
                };
                let last = cases.len().checked_sub(1).ok_or_else(|| malformed(i, "empty switch"))?;
                let pick = if idx >= 0 && (idx as usize) < last { idx as usize } else { last };
                return Ok(Flow::Edge(cases[pick]));
            }
            Opcode::Return => {
                let v = match inst.srcs.first() {
                    Some(&s) => Some(self.get(s, i)?),
                    None => None,
                };
                return Ok(Flow::Return(v));
            }
            Opcode::Throw => return Err(InterpError::Thrown(i.index())),
            Opcode::DirectCall | Opcode::IndirectCall => return Err(InterpError::Unsupported("calls")),
            Opcode::VmHelperCall => match self.helper(i)? {
                Some(v) => v,
                None => return Ok(Flow::Continue),
            },
            Opcode::LdConstant => match inst.payload {
                Payload::Const(ConstValue::Int(v)) => Value::Int(v),
                Payload::Const(ConstValue::Float(v)) => Value::Float(v),
                _ => return Err(malformed(i, "constant without value")),
            },
            Opcode::LdNull => Value::Null,
            Opcode::LdRef => {
                let Payload::Str(s) = inst.payload else {
                    return Err(malformed(i, "ldref without index"));
                };
                match self.strings.get(&s) {
                    Some(&o) => Value::Ref(o),
                    None => {
                        let root = ir.types.root_object();
                        let v = self.alloc(root, 0);
                        if let Value::Ref(o) = v {
                            self.strings.insert(s, o);
                        }
                        v
                    }
                }
            }
            Opcode::LdFieldOffset => match inst.payload {
                Payload::Field(f) => Value::Int(ir.types.field(f).offset as i64),
                _ => return Err(malformed(i, "field offset without field")),
            },
            Opcode::Copy | Opcode::LdVar | Opcode::StVar | Opcode::CompressRef | Opcode::UncompressRef
            | Opcode::TauStaticCast => self.get(inst.src(0), i)?,
            Opcode::DefArg => match inst.payload {
                Payload::Arg(n) => args
                    .get(n as usize)
                    .cloned()
                    .ok_or_else(|| malformed(i, format!("missing argument {n}")))?,
                _ => return Err(malformed(i, "defarg without position")),
            },
            Opcode::Phi => return Ok(Flow::Continue),
            Opcode::NewObj => self.alloc(inst.ty, 0),
            Opcode::NewArray => {
                let n = self.int(inst.src(0), i)?;
                if n < 0 {
                    return Err(InterpError::NegativeArraySize(n));
                }
                self.alloc(inst.ty, n as usize)
            }
            Opcode::LdArrayLen => {
                let o = self.obj(inst.src(0), i)?;
                Value::Int(self.heap[o].elems.len() as i64)
            }
            Opcode::LdFieldAddr => {
                let o = self.obj(inst.src(0), i)?;
                let Payload::Field(field) = inst.payload else {
                    return Err(malformed(i, "field address without field"));
                };
                Value::Ptr(Addr::Field { obj: o, field })
            }
            Opcode::LdStaticAddr => match inst.payload {
                Payload::Field(f) => Value::Ptr(Addr::Static(f)),
                _ => return Err(malformed(i, "static address without field")),
            },
            Opcode::LdElemAddr => {
                let o = self.obj(inst.src(0), i)?;
                let index = self.int(inst.src(1), i)?;
                Value::Ptr(Addr::Elem { obj: o, index })
            }
            Opcode::LdArrayBaseAddr => {
                let o = self.obj(inst.src(0), i)?;
                Value::Ptr(Addr::Elem { obj: o, index: 0 })
            }
            Opcode::AddScaledIndex => match self.get(inst.src(0), i)? {
                Value::Ptr(Addr::Elem { obj, index }) => {
                    let k = self.int(inst.src(1), i)?;
                    Value::Ptr(Addr::Elem { obj, index: index + k })
                }
                _ => return Err(malformed(i, "scaled index on non-element pointer")),
            },
            Opcode::TauLdInd => {
                let addr = self.addr(inst.src(0), i)?;
                if kind == TypeKind::Vector {
                    self.vector_ops += 1;
                    let lanes = ir.types.lanes(inst.ty) as i64;
                    let mut out = Vec::with_capacity(lanes as usize);
                    for k in 0..lanes {
                        out.push(self.load(offset(addr, k))?);
                    }
                    Value::Vector(out)
                } else {
                    self.load(addr)?
                }
            }
            Opcode::TauStInd => {
                let v = self.get(inst.src(0), i)?;
                let addr = self.addr(inst.src(1), i)?;
                match v {
                    Value::Vector(lanes) => {
                        self.vector_ops += 1;
                        for (k, lane) in lanes.into_iter().enumerate() {
                            self.store(offset(addr, k as i64), lane)?;
                        }
                    }
                    v => self.store(addr, v)?,
                }
                return Ok(Flow::Continue);
            }
            Opcode::TauLdVTableAddr => {
                let o = self.obj(inst.src(0), i)?;
                Value::Int(self.heap[o].ty.index() as i64)
            }
            Opcode::TauMonitorEnter | Opcode::TauMonitorExit => {
                self.obj(inst.src(0), i)?;
                return Ok(Flow::Continue);
            }
            Opcode::TauCheckNull => {
                self.obj(inst.src(0), i)?;
                Value::Tau
            }
            Opcode::TauCheckBounds => {
                let len = self.int(inst.src(0), i)?;
                let index = self.int(inst.src(1), i)?;
                if index < 0 || index >= len {
                    return Err(InterpError::IndexOutOfBounds { index, len: len.max(0) as usize });
                }
                Value::Tau
            }
            Opcode::TauCheckZero => {
                if self.int(inst.src(0), i)? == 0 {
                    return Err(InterpError::DivideByZero(i.index()));
                }
                Value::Tau
            }
            Opcode::TauCheckCast => {
                let target = inst.type_payload().ok_or_else(|| malformed(i, "cast without type"))?;
                match self.get(inst.src(0), i)? {
                    Value::Ref(o) if !ir.types.is_subtype(self.heap[o].ty, target) => {
                        return Err(InterpError::ClassCast(i.index()))
                    }
                    _ => Value::Tau,
                }
            }
            Opcode::TauAsType | Opcode::TauInstanceOf => {
                let target = inst.type_payload().ok_or_else(|| malformed(i, "cast without type"))?;
                let v = self.get(inst.src(0), i)?;
                let ok = matches!(v, Value::Ref(o) if ir.types.is_subtype(self.heap[o].ty, target));
                if inst.opcode == Opcode::TauInstanceOf {
                    Value::Int(ok as i64)
                } else if ok {
                    v
                } else {
                    Value::Null
                }
            }
            Opcode::TauSafe
            | Opcode::TauUnsafe
            | Opcode::TauPoint
            | Opcode::TauEdge
            | Opcode::TauAnd
            | Opcode::TauHasType
            | Opcode::TauHasExactType
            | Opcode::TauIsNonNull => Value::Tau,
            Opcode::VecPack => {
                self.vector_ops += 1;
                let mut lanes = Vec::with_capacity(inst.srcs.len());
                for &s in &inst.srcs {
                    lanes.push(self.get(s, i)?);
                }
                Value::Vector(lanes)
            }
            Opcode::VecExtract => {
                let Payload::Lane(k) = inst.payload else {
                    return Err(malformed(i, "extract without lane"));
                };
                match self.get(inst.src(0), i)? {
                    Value::Vector(lanes) => lanes
                        .get(k as usize)
                        .cloned()
                        .ok_or_else(|| malformed(i, "lane out of range"))?,
                    _ => return Err(malformed(i, "extract from scalar")),
                }
            }
        };
        if let Some(d) = inst.dst {
            self.env.insert(d, value);
        }
        Ok(Flow::Continue)
    }

    fn helper(&mut self, i: InstId) -> InterpResult<Option<Value>> {
        let ir = self.ir;
        let inst = ir.inst(i);
        let Payload::Helper(h) = inst.payload else {
            return Err(malformed(i, "helper call without helper"));
        };
        Ok(match h {
            VmHelper::AllocObject => Some(self.alloc(inst.ty, 0)),
            VmHelper::AllocArray => {
                let n = self.int(inst.src(0), i)?;
                if n < 0 {
                    return Err(InterpError::NegativeArraySize(n));
                }
                Some(self.alloc(inst.ty, n as usize))
            }
            VmHelper::ThrowNullPointer => return Err(InterpError::NullPointer(i.index())),
            VmHelper::ThrowIndexOutOfBounds => return Err(InterpError::IndexOutOfBounds { index: -1, len: 0 }),
            VmHelper::IdentityHash => Some(Value::Int(self.obj(inst.src(0), i)? as i64)),
            VmHelper::MathSqrt => {
                let x = self
                    .get(inst.src(0), i)?
                    .as_float()
                    .ok_or_else(|| malformed(i, "sqrt of non-number"))?;
                Some(Value::Float(x.sqrt()))
            }
            VmHelper::ArrayCopy => {
                let src = self.obj(inst.src(0), i)?;
                let sp = self.int(inst.src(1), i)?;
                let dst = self.obj(inst.src(2), i)?;
                let dp = self.int(inst.src(3), i)?;
                let n = self.int(inst.src(4), i)?;
                let (slen, dlen) = (self.heap[src].elems.len() as i64, self.heap[dst].elems.len() as i64);
                if n < 0 || sp < 0 || dp < 0 || sp + n > slen || dp + n > dlen {
                    return Err(InterpError::IndexOutOfBounds { index: sp.max(dp) + n, len: slen.min(dlen) as usize });
                }
                let chunk: Vec<Value> = self.heap[src].elems[sp as usize..(sp + n) as usize].to_vec();
                for (k, v) in chunk.into_iter().enumerate() {
                    self.heap[dst].elems[dp as usize + k] = v;
                }
                None
            }
        })
    }

    fn addr(&self, opnd: OpndId, at: InstId) -> InterpResult<Addr> {
        match self.get(opnd, at)? {
            Value::Ptr(a) => Ok(a),
            Value::Null => Err(InterpError::NullPointer(at.index())),
            _ => Err(malformed(at, "expected pointer")),
        }
    }

    fn load(&self, addr: Addr) -> InterpResult<Value> {
        match addr {
            Addr::Elem { obj, index } => {
                let elems = &self.heap[obj].elems;
                if index < 0 || index as usize >= elems.len() {
                    return Err(InterpError::IndexOutOfBounds { index, len: elems.len() });
                }
                Ok(elems[index as usize].clone())
            }
            Addr::Field { obj, field } => Ok(self.heap[obj]
                .fields
                .get(&field)
                .cloned()
                .unwrap_or_else(|| self.zero_of(self.ir.types.field(field).ty))),
            Addr::Static(field) => Ok(self
                .statics
                .get(&field)
                .cloned()
                .unwrap_or_else(|| self.zero_of(self.ir.types.field(field).ty))),
        }
    }

    fn store(&mut self, addr: Addr, v: Value) -> InterpResult<()> {
        match addr {
            Addr::Elem { obj, index } => {
                let elems = &mut self.heap[obj].elems;
                if index < 0 || index as usize >= elems.len() {
                    return Err(InterpError::IndexOutOfBounds { index, len: elems.len() });
                }
                elems[index as usize] = v;
            }
            Addr::Field { obj, field } => {
                self.heap[obj].fields.insert(field, v);
            }
            Addr::Static(field) => {
                self.statics.insert(field, v);
            }
        }
        Ok(())
    }

    fn compare(&self, cmp: CmpMod, srcs: &[OpndId], at: InstId) -> InterpResult<bool> {
        let a = self.get(srcs[0], at)?;
        if cmp.is_unary() {
            let zero = match a {
                Value::Int(v) => v == 0,
                Value::Float(v) => v == 0.0,
                Value::Null => true,
                _ => false,
            };
            return Ok(if cmp == CmpMod::Zero { zero } else { !zero });
        }
        let b = self.get(*srcs.get(1).ok_or_else(|| malformed(at, "binary compare arity"))?, at)?;
        let width = self.ir.types.bit_width(self.ir.opnd_ty(srcs[0])).unwrap_or(64);
        Ok(match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => {
                let (ux, uy) = (unsigned(*x, width), unsigned(*y, width));
                match cmp {
                    CmpMod::Eq => x == y,
                    CmpMod::Ne => x != y,
                    CmpMod::Lt => x < y,
                    CmpMod::Le => x <= y,
                    CmpMod::Gt => x > y,
                    CmpMod::Ge => x >= y,
                    CmpMod::LtUn => ux < uy,
                    CmpMod::LeUn => ux <= uy,
                    CmpMod::GtUn => ux > uy,
                    CmpMod::GeUn => ux >= uy,
                    CmpMod::Zero | CmpMod::NonZero => false,
                }
            }
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                let (x, y) = (a.as_float().unwrap_or(f64::NAN), b.as_float().unwrap_or(f64::NAN));
                match cmp {
                    CmpMod::Eq => x == y,
                    CmpMod::Ne => x != y,
                    CmpMod::Lt | CmpMod::LtUn => x < y,
                    CmpMod::Le | CmpMod::LeUn => x <= y,
                    CmpMod::Gt | CmpMod::GtUn => x > y,
                    CmpMod::Ge | CmpMod::GeUn => x >= y,
                    CmpMod::Zero | CmpMod::NonZero => false,
                }
            }
            _ => match cmp {
                CmpMod::Eq => same_object(&a, &b),
                CmpMod::Ne => !same_object(&a, &b),
                _ => return Err(malformed(at, "ordered compare of references")),
            },
        })
    }
}

enum Flow {
    Continue,
    Edge(EdgeId),
    Return(Option<Value>),
}

fn malformed(inst: InstId, message: impl Into<String>) -> InterpError {
    InterpError::Malformed {
        inst: inst.index(),
        message: message.into(),
    }
}

fn offset(addr: Addr, k: i64) -> Addr {
    match addr {
        Addr::Elem { obj, index } => Addr::Elem { obj, index: index + k },
        other => other,
    }
}

/// Reference equality; pointers compare by the object they point into.
fn same_object(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Ptr(Addr::Elem { obj: x, .. }), Value::Ptr(Addr::Elem { obj: y, .. }))
        | (Value::Ptr(Addr::Field { obj: x, .. }), Value::Ptr(Addr::Field { obj: y, .. })) => x == y,
        _ => a == b,
    }
}

fn unsigned(v: i64, width: u32) -> u64 {
    if width >= 64 {
        v as u64
    } else {
        (v as u64) & ((1u64 << width) - 1)
    }
}

/// Truncate an integer to the width of `kind`.
fn wrap(kind: TypeKind, v: i64) -> i64 {
    match kind {
        TypeKind::Int8 => v as i8 as i64,
        TypeKind::Int16 => v as i16 as i64,
        TypeKind::Int32 => v as i32 as i64,
        TypeKind::UInt8 | TypeKind::Boolean => v as u8 as i64,
        TypeKind::UInt16 | TypeKind::Char => v as u16 as i64,
        TypeKind::UInt32 => v as u32 as i64,
        _ => v,
    }
}

fn lanewise(
    a: &Value,
    b: &Value,
    f: &mut dyn FnMut(Value, Value) -> InterpResult<Value>,
) -> InterpResult<Value> {
    match (a, b) {
        (Value::Vector(xs), Value::Vector(ys)) => {
            let mut out = Vec::with_capacity(xs.len());
            for (x, y) in xs.iter().zip(ys) {
                out.push(f(x.clone(), y.clone())?);
            }
            Ok(Value::Vector(out))
        }
        (Value::Vector(xs), y) => {
            let mut out = Vec::with_capacity(xs.len());
            for x in xs {
                out.push(f(x.clone(), y.clone())?);
            }
            Ok(Value::Vector(out))
        }
        (x, Value::Vector(ys)) => {
            let mut out = Vec::with_capacity(ys.len());
            for y in ys {
                out.push(f(x.clone(), y.clone())?);
            }
            Ok(Value::Vector(out))
        }
        (x, y) => f(x.clone(), y.clone()),
    }
}

fn binary(
    op: Opcode,
    overflow: OverflowMod,
    flags: InstFlags,
    kind: TypeKind,
    a: Value,
    b: Value,
    at: InstId,
) -> InterpResult<Value> {
    if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
        let (x, y) = (*x, *y);
        let width = kind.bit_width().unwrap_or(64);
        let exact: Option<i128> = match op {
            Opcode::Add => Some(x as i128 + y as i128),
            Opcode::Sub => Some(x as i128 - y as i128),
            Opcode::Mul => Some(x as i128 * y as i128),
            _ => None,
        };
        if let Some(r) = exact {
            let wrapped = wrap(kind, r as i64);
            let fits = match overflow {
                OverflowMod::None => true,
                OverflowMod::Signed => {
                    let lim = 1i128 << (width - 1);
                    (-lim..lim).contains(&r)
                }
                OverflowMod::Unsigned => (0..(1i128 << width)).contains(&r),
            };
            if !fits {
                return Err(InterpError::Overflow(at.index()));
            }
            return Ok(Value::Int(wrapped));
        }
        let r = match op {
            Opcode::Min => x.min(y),
            Opcode::Max => x.max(y),
            Opcode::And => x & y,
            Opcode::Or => x | y,
            Opcode::Xor => x ^ y,
            Opcode::Shl => x.wrapping_shl((y as u32) & (width - 1)),
            Opcode::Shr => {
                let s = (y as u32) & (width - 1);
                if flags.contains(InstFlags::SIGNED) {
                    x >> s
                } else {
                    (unsigned(x, width) >> s) as i64
                }
            }
            Opcode::MulHi => ((x as i128 * y as i128) >> width) as i64,
            Opcode::TauDiv | Opcode::TauRem => {
                if y == 0 {
                    return Err(InterpError::DivideByZero(at.index()));
                }
                match (op, flags.contains(InstFlags::SIGNED)) {
                    (Opcode::TauDiv, true) => x.wrapping_div(y),
                    (Opcode::TauRem, true) => x.wrapping_rem(y),
                    (Opcode::TauDiv, false) => (unsigned(x, width) / unsigned(y, width)) as i64,
                    _ => (unsigned(x, width) % unsigned(y, width)) as i64,
                }
            }
            _ => return Err(InterpError::Unsupported("integer operator")),
        };
        return Ok(Value::Int(wrap(kind, r)));
    }
    let (x, y) = match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(malformed(at, "arithmetic on non-numbers")),
    };
    Ok(Value::Float(match op {
        Opcode::Add => x + y,
        Opcode::Sub => x - y,
        Opcode::Mul => x * y,
        Opcode::TauDiv => x / y,
        Opcode::TauRem => x % y,
        Opcode::Min => x.min(y),
        Opcode::Max => x.max(y),
        _ => return Err(InterpError::Unsupported("floating-point operator")),
    }))
}

fn unary(op: Opcode, kind: TypeKind, a: Value, at: InstId) -> InterpResult<Value> {
    match a {
        Value::Vector(lanes) => {
            let mut out = Vec::with_capacity(lanes.len());
            for l in lanes {
                out.push(unary(op, kind, l, at)?);
            }
            Ok(Value::Vector(out))
        }
        Value::Int(x) => Ok(Value::Int(wrap(
            kind,
            match op {
                Opcode::Neg => x.wrapping_neg(),
                Opcode::Not => !x,
                _ => x.wrapping_abs(),
            },
        ))),
        Value::Float(x) => Ok(Value::Float(match op {
            Opcode::Neg => -x,
            Opcode::Abs => x.abs(),
            _ => return Err(InterpError::Unsupported("bitwise not on float")),
        })),
        _ => Err(malformed(at, "unary operator on non-number")),
    }
}

fn convert(to: TypeKind, a: Value, at: InstId) -> InterpResult<Value> {
    Ok(match (to.is_floating(), a) {
        (true, Value::Int(x)) => Value::Float(x as f64),
        (true, Value::Float(x)) if to == TypeKind::Single => Value::Float(x as f32 as f64),
        (true, Value::Float(x)) => Value::Float(x),
        (false, Value::Int(x)) => Value::Int(wrap(to, x)),
        (false, Value::Float(x)) => Value::Int(wrap(to, x as i64)),
        (_, other @ (Value::Ref(_) | Value::Null | Value::Ptr(_))) => other,
        _ => return Err(malformed(at, "conversion of non-number")),
    })
}
