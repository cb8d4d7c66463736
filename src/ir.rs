//! Intermediate representation for scheduled kernels
//!
//! Every function is a [`Module`]: parameters, an optional return type and an
//! ordered tree of named [`Op`]s. Scalars are rank-0 buffers, so all memory
//! traffic goes through an [`Access`]: reads appear as [`Expr::Load`], writes
//! as [`OpKind::Store`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// Element type of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn bits(self) -> u32 {
        match self {
            DType::I8 => 8,
            DType::I16 => 16,
            DType::I32 | DType::F32 => 32,
            DType::I64 | DType::F64 => 64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Element type plus shape; an empty shape is a scalar
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DType,
    #[serde(default)]
    pub shape: Vec<usize>,
}

impl TensorType {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dtype)?;
        if !self.shape.is_empty() {
            let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
            write!(f, "[{}]", dims.join(", "))?;
        }
        Ok(())
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
        }
    }
}

/// Whether an access reads or writes its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// A memory access: buffer, logical index per dimension and, once the buffer
/// is partitioned, one bank-select expression per recorded partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Access {
    pub buffer: String,
    #[serde(default)]
    pub indices: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub banks: Vec<Expr>,
}

impl Access {
    pub fn new(buffer: impl Into<String>, indices: Vec<Expr>) -> Self {
        Self {
            buffer: buffer.into(),
            indices,
            banks: Vec::new(),
        }
    }

    fn for_each_expr_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        for index in &mut self.indices {
            f(index);
        }
        for bank in &mut self.banks {
            f(bank);
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indices: Vec<String> = self.indices.iter().map(|i| i.to_string()).collect();
        write!(f, "{}[{}]", self.buffer, indices.join(", "))?;
        if !self.banks.is_empty() {
            let banks: Vec<String> = self.banks.iter().map(|b| b.to_string()).collect();
            write!(f, "{{bank {}}}", banks.join(", "))?;
        }
        Ok(())
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Float(f64),
    /// Loop induction variable or instantiation parameter
    Var(String),
    Load(Access),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn load(buffer: impl Into<String>, indices: Vec<Expr>) -> Self {
        Expr::Load(Access::new(buffer, indices))
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn min(left: Expr, right: Expr) -> Self {
        Self::binary(BinOp::Min, left, right)
    }

    pub fn max(left: Expr, right: Expr) -> Self {
        Self::binary(BinOp::Max, left, right)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn uses_var(&self, var: &str) -> bool {
        match self {
            Expr::Int(_) | Expr::Float(_) => false,
            Expr::Var(name) => name == var,
            Expr::Load(access) => access.indices.iter().any(|i| i.uses_var(var)),
            Expr::Binary(_, l, r) => l.uses_var(var) || r.uses_var(var),
        }
    }

    /// Collect the variables this expression reads
    pub fn free_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Int(_) | Expr::Float(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Load(access) => {
                for index in &access.indices {
                    index.free_vars(out);
                }
            }
            Expr::Binary(_, l, r) => {
                l.free_vars(out);
                r.free_vars(out);
            }
        }
    }

    /// Replace every occurrence of `var` with `with`
    pub fn substitute(&mut self, var: &str, with: &Expr) {
        match self {
            Expr::Var(name) if name == var => *self = with.clone(),
            Expr::Load(access) => access.for_each_expr_mut(&mut |e| e.substitute(var, with)),
            Expr::Binary(_, l, r) => {
                l.substitute(var, with);
                r.substitute(var, with);
            }
            _ => {}
        }
    }

    /// Visit every load in this expression, nested loads first
    pub fn for_each_access(&self, f: &mut dyn FnMut(&Access)) {
        match self {
            Expr::Load(access) => {
                for index in &access.indices {
                    index.for_each_access(f);
                }
                f(access);
            }
            Expr::Binary(_, l, r) => {
                l.for_each_access(f);
                r.for_each_access(f);
            }
            _ => {}
        }
    }

    pub fn for_each_access_mut(&mut self, f: &mut dyn FnMut(&mut Access)) {
        match self {
            Expr::Load(access) => {
                access.for_each_expr_mut(&mut |e| e.for_each_access_mut(f));
                f(access);
            }
            Expr::Binary(_, l, r) => {
                l.for_each_access_mut(f);
                r.for_each_access_mut(f);
            }
            _ => {}
        }
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Int(value)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Var(name.to_string())
    }
}

impl<T: Into<Expr>> ops::Add<T> for Expr {
    type Output = Expr;

    fn add(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Add, self, rhs.into())
    }
}

impl<T: Into<Expr>> ops::Sub<T> for Expr {
    type Output = Expr;

    fn sub(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs.into())
    }
}

impl<T: Into<Expr>> ops::Mul<T> for Expr {
    type Output = Expr;

    fn mul(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs.into())
    }
}

impl<T: Into<Expr>> ops::Div<T> for Expr {
    type Output = Expr;

    fn div(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Div, self, rhs.into())
    }
}

impl<T: Into<Expr>> ops::Rem<T> for Expr {
    type Output = Expr;

    fn rem(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Mod, self, rhs.into())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Float(v) => write!(f, "{:?}", v),
            Expr::Var(name) => f.write_str(name),
            Expr::Load(access) => write!(f, "{}", access),
            Expr::Binary(op @ (BinOp::Min | BinOp::Max), l, r) => {
                write!(f, "{}({}, {})", op.symbol(), l, r)
            }
            Expr::Binary(op, l, r) => write!(f, "({} {} {})", l, op.symbol(), r),
        }
    }
}

/// Spatial loops iterate independently; reduction loops accumulate with a
/// commutative-associative update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    Spatial,
    Reduction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loop {
    pub var: String,
    pub lower: i64,
    pub upper: i64,
    #[serde(default = "unit_step")]
    pub step: i64,
    pub kind: LoopKind,
    /// Initiation interval once pipelined
    #[serde(default)]
    pub pipeline: Option<u32>,
    pub body: Vec<Op>,
}

fn unit_step() -> i64 {
    1
}

impl Loop {
    pub fn trip_count(&self) -> i64 {
        if self.upper <= self.lower || self.step <= 0 {
            0
        } else {
            (self.upper - self.lower + self.step - 1) / self.step
        }
    }

    pub fn is_reduction(&self) -> bool {
        self.kind == LoopKind::Reduction
    }
}

/// Everything that identifies a loop apart from its body
#[derive(Debug, Clone, PartialEq)]
pub struct LoopHeader {
    pub name: String,
    pub var: String,
    pub lower: i64,
    pub upper: i64,
    pub step: i64,
    pub kind: LoopKind,
    pub pipeline: Option<u32>,
}

/// Where an allocated buffer lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Storage {
    #[default]
    Memory,
    /// FIFO channel between a single producer and a single consumer stage
    Stream { depth: usize },
    /// Double buffer between stages that disagree on access order
    PingPong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Complete,
    Block,
    Cyclic,
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionKind::Complete => "complete",
            PartitionKind::Block => "block",
            PartitionKind::Cyclic => "cyclic",
        })
    }
}

impl std::str::FromStr for PartitionKind {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" | "0" => Ok(PartitionKind::Complete),
            "block" | "1" => Ok(PartitionKind::Block),
            "cyclic" | "2" => Ok(PartitionKind::Cyclic),
            other => Err(CompileError::parse_error(format!(
                "Unknown partition kind: {}",
                other
            ))),
        }
    }
}

/// One partitioned dimension of a buffer (1-based `dim`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub dim: usize,
    pub factor: usize,
    pub kind: PartitionKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub ops: Vec<Op>,
    /// Stages inside execute as an overlapped dataflow region
    #[serde(default)]
    pub dataflow: bool,
    /// Name of the module this block was inlined from
    #[serde(default)]
    pub inlined_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TensorType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: TensorType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Call of a (possibly generic) function; buffers are passed by reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub callee: String,
    #[serde(default)]
    pub inst_args: Vec<i64>,
    #[serde(default)]
    pub tag: Option<String>,
    pub args: Vec<String>,
    /// Buffer bound to the callee's return value
    #[serde(default)]
    pub result: Option<Param>,
}

impl Call {
    /// Name of the module this call resolves to
    pub fn target(&self) -> String {
        instance_name(&self.callee, &self.inst_args, self.tag.as_deref())
    }
}

/// Name of a specialized instantiation of `base`
pub fn instance_name(base: &str, args: &[i64], tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!("{}_{}", base, tag),
        None if args.is_empty() => base.to_string(),
        None => {
            let encoded: Vec<String> = args
                .iter()
                .map(|v| {
                    if *v < 0 {
                        format!("m{}", v.unsigned_abs())
                    } else {
                        v.to_string()
                    }
                })
                .collect();
            format!("{}_{}", base, encoded.join("_"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Loop(Loop),
    Block(Block),
    Alloc {
        buffer: String,
        ty: TensorType,
        #[serde(default)]
        init: Option<Expr>,
        #[serde(default)]
        storage: Storage,
    },
    Store {
        access: Access,
        value: Expr,
    },
    Call(Call),
    Return {
        value: String,
    },
}

/// A named operation; names are unique within a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub name: String,
    pub kind: OpKind,
}

impl Op {
    pub fn new(name: impl Into<String>, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn children(&self) -> Option<&Vec<Op>> {
        match &self.kind {
            OpKind::Loop(l) => Some(&l.body),
            OpKind::Block(b) => Some(&b.ops),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Op>> {
        match &mut self.kind {
            OpKind::Loop(l) => Some(&mut l.body),
            OpKind::Block(b) => Some(&mut b.ops),
            _ => None,
        }
    }

    pub fn as_loop(&self) -> Option<&Loop> {
        match &self.kind {
            OpKind::Loop(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_loop_mut(&mut self) -> Option<&mut Loop> {
        match &mut self.kind {
            OpKind::Loop(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match &self.kind {
            OpKind::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn loop_header(&self) -> Option<LoopHeader> {
        self.as_loop().map(|l| LoopHeader {
            name: self.name.clone(),
            var: l.var.clone(),
            lower: l.lower,
            upper: l.upper,
            step: l.step,
            kind: l.kind,
            pipeline: l.pipeline,
        })
    }

    pub fn set_loop_header(&mut self, header: LoopHeader) -> bool {
        let OpKind::Loop(l) = &mut self.kind else {
            return false;
        };
        l.var = header.var;
        l.lower = header.lower;
        l.upper = header.upper;
        l.step = header.step;
        l.kind = header.kind;
        l.pipeline = header.pipeline;
        self.name = header.name;
        true
    }

    /// Pre-order traversal of this op and everything nested in it
    pub fn walk(&self, f: &mut dyn FnMut(&Op)) {
        f(self);
        if let Some(children) = self.children() {
            for child in children {
                child.walk(f);
            }
        }
    }

    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Op)) {
        f(self);
        if let Some(children) = self.children_mut() {
            for child in children {
                child.walk_mut(f);
            }
        }
    }

    /// Visit every memory access in this op and its descendants
    pub fn for_each_access(&self, f: &mut dyn FnMut(&Access, AccessMode)) {
        match &self.kind {
            OpKind::Loop(l) => {
                for op in &l.body {
                    op.for_each_access(f);
                }
            }
            OpKind::Block(b) => {
                for op in &b.ops {
                    op.for_each_access(f);
                }
            }
            OpKind::Alloc { init: Some(init), .. } => {
                init.for_each_access(&mut |a| f(a, AccessMode::Read));
            }
            OpKind::Store { access, value } => {
                value.for_each_access(&mut |a| f(a, AccessMode::Read));
                for index in &access.indices {
                    index.for_each_access(&mut |a| f(a, AccessMode::Read));
                }
                f(access, AccessMode::Write);
            }
            _ => {}
        }
    }

    pub fn for_each_access_mut(&mut self, f: &mut dyn FnMut(&mut Access, AccessMode)) {
        match &mut self.kind {
            OpKind::Loop(l) => {
                for op in &mut l.body {
                    op.for_each_access_mut(f);
                }
            }
            OpKind::Block(b) => {
                for op in &mut b.ops {
                    op.for_each_access_mut(f);
                }
            }
            OpKind::Alloc { init: Some(init), .. } => {
                init.for_each_access_mut(&mut |a| f(a, AccessMode::Read));
            }
            OpKind::Store { access, value } => {
                value.for_each_access_mut(&mut |a| f(a, AccessMode::Read));
                access.for_each_expr_mut(&mut |e| {
                    e.for_each_access_mut(&mut |a| f(a, AccessMode::Read))
                });
                f(access, AccessMode::Write);
            }
            _ => {}
        }
    }

    /// Visit every top-level expression held by this op and its descendants
    pub fn for_each_expr_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        match &mut self.kind {
            OpKind::Loop(l) => {
                for op in &mut l.body {
                    op.for_each_expr_mut(f);
                }
            }
            OpKind::Block(b) => {
                for op in &mut b.ops {
                    op.for_each_expr_mut(f);
                }
            }
            OpKind::Alloc { init: Some(init), .. } => f(init),
            OpKind::Store { access, value } => {
                access.for_each_expr_mut(f);
                f(value);
            }
            _ => {}
        }
    }

    /// Rename buffers everywhere they are mentioned
    pub fn rename_buffers(&mut self, map: &BTreeMap<String, String>) {
        if map.is_empty() {
            return;
        }
        self.walk_mut(&mut |op| match &mut op.kind {
            OpKind::Alloc { buffer, .. } => rename_in_place(buffer, map),
            OpKind::Call(call) => {
                for arg in &mut call.args {
                    rename_in_place(arg, map);
                }
                if let Some(result) = &mut call.result {
                    rename_in_place(&mut result.name, map);
                }
            }
            OpKind::Return { value } => rename_in_place(value, map),
            _ => {}
        });
        self.for_each_access_mut(&mut |access, _| rename_in_place(&mut access.buffer, map));
    }

    /// Prepend `prefix.` to the name of this op and all nested ops
    pub fn prefix_names(&mut self, prefix: &str) {
        self.walk_mut(&mut |op| op.name = format!("{}.{}", prefix, op.name));
    }
}

fn rename_in_place(name: &mut String, map: &BTreeMap<String, String>) {
    if let Some(new_name) = map.get(name.as_str()) {
        *name = new_name.clone();
    }
}

/// The list of ops reached by following `prefix` through nested containers
pub fn list_at_mut<'a>(ops: &'a mut Vec<Op>, prefix: &[usize]) -> Option<&'a mut Vec<Op>> {
    match prefix.split_first() {
        None => Some(ops),
        Some((&index, rest)) => list_at_mut(ops.get_mut(index)?.children_mut()?, rest),
    }
}

pub fn list_at<'a>(ops: &'a [Op], prefix: &[usize]) -> Option<&'a [Op]> {
    match prefix.split_first() {
        None => Some(ops),
        Some((&index, rest)) => list_at(ops.get(index)?.children()?, rest),
    }
}

fn find_paths(ops: &[Op], pred: &dyn Fn(&Op) -> bool, path: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    for (index, op) in ops.iter().enumerate() {
        path.push(index);
        if pred(op) {
            out.push(path.clone());
        }
        if let Some(children) = op.children() {
            find_paths(children, pred, path, out);
        }
        path.pop();
    }
}

/// A function's IR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub ret: Option<TensorType>,
    pub body: Vec<Op>,
    /// Partitions recorded per buffer, in application order
    #[serde(default)]
    pub partitions: BTreeMap<String, Vec<Partition>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret: None,
            body: Vec::new(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn walk(&self, f: &mut dyn FnMut(&Op)) {
        for op in &self.body {
            op.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Op)) {
        for op in &mut self.body {
            op.walk_mut(f);
        }
    }

    pub fn for_each_access(&self, f: &mut dyn FnMut(&Access, AccessMode)) {
        for op in &self.body {
            op.for_each_access(f);
        }
    }

    pub fn for_each_access_mut(&mut self, f: &mut dyn FnMut(&mut Access, AccessMode)) {
        for op in &mut self.body {
            op.for_each_access_mut(f);
        }
    }

    /// Paths of every op satisfying `pred`, in pre-order
    pub fn find_all(&self, pred: &dyn Fn(&Op) -> bool) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        find_paths(&self.body, pred, &mut Vec::new(), &mut out);
        out
    }

    pub fn find_path(&self, name: &str) -> Option<Vec<usize>> {
        self.find_all(&|op| op.name == name).into_iter().next()
    }

    /// Resolve a target name: exact match first, then a unique `.name` suffix
    pub fn resolve(&self, name: &str) -> CompileResult<Vec<usize>> {
        if let Some(path) = self.find_path(name) {
            return Ok(path);
        }
        let suffix = format!(".{}", name);
        let mut matches = self.find_all(&|op| op.name.ends_with(&suffix));
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(CompileError::unknown_op(name)),
            _ => {
                let names: Vec<String> = matches
                    .iter()
                    .filter_map(|p| self.op_at(p).map(|op| op.name.clone()))
                    .collect();
                Err(CompileError::unknown_op(format!(
                    "{} (ambiguous: {})",
                    name,
                    names.join(", ")
                )))
            }
        }
    }

    pub fn op_at(&self, path: &[usize]) -> Option<&Op> {
        let (last, prefix) = path.split_last()?;
        list_at(&self.body, prefix)?.get(*last)
    }

    pub fn op_at_mut(&mut self, path: &[usize]) -> Option<&mut Op> {
        let (last, prefix) = path.split_last()?;
        list_at_mut(&mut self.body, prefix)?.get_mut(*last)
    }

    /// Ops enclosing `path`, outermost first (the op itself excluded)
    pub fn ancestors(&self, path: &[usize]) -> Vec<&Op> {
        (1..path.len())
            .filter_map(|len| self.op_at(&path[..len]))
            .collect()
    }

    pub fn op(&self, name: &str) -> Option<&Op> {
        self.find_path(name).and_then(|p| self.op_at(&p))
    }

    pub fn is_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Type of a parameter, allocated buffer or call result
    pub fn buffer_type(&self, name: &str) -> Option<TensorType> {
        if let Some(param) = self.params.iter().find(|p| p.name == name) {
            return Some(param.ty.clone());
        }
        let mut found = None;
        self.walk(&mut |op| {
            if found.is_some() {
                return;
            }
            match &op.kind {
                OpKind::Alloc { buffer, ty, .. } if buffer == name => found = Some(ty.clone()),
                OpKind::Call(Call {
                    result: Some(result),
                    ..
                }) if result.name == name => found = Some(result.ty.clone()),
                _ => {}
            }
        });
        found
    }

    pub fn buffer_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.params.iter().map(|p| p.name.clone()).collect();
        self.walk(&mut |op| match &op.kind {
            OpKind::Alloc { buffer, .. } => {
                names.insert(buffer.clone());
            }
            OpKind::Call(Call {
                result: Some(result),
                ..
            }) => {
                names.insert(result.name.clone());
            }
            _ => {}
        });
        names
    }

    pub fn op_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(&mut |op| names.push(op.name.clone()));
        names
    }

    pub fn count_ops(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    /// Buffer named by the top-level `Return`, if any
    pub fn returned_value(&self) -> Option<&str> {
        self.body.iter().rev().find_map(|op| match &op.kind {
            OpKind::Return { value } => Some(value.as_str()),
            _ => None,
        })
    }

    /// Every call site with its path
    pub fn call_sites(&self) -> Vec<(Vec<usize>, &Op)> {
        self.find_all(&|op| matches!(op.kind, OpKind::Call(_)))
            .into_iter()
            .filter_map(|path| self.op_at(&path).map(|op| (path.clone(), op)))
            .collect()
    }

    /// An independent copy of the body; nothing is shared with `self`
    pub fn deep_copy_body(&self) -> Vec<Op> {
        self.body.iter().map(|op| Op::new(op.name.clone(), op.kind.clone())).collect()
    }

    pub fn fresh_buffer_name(&self, base: &str) -> String {
        let taken = self.buffer_names();
        fresh_name(base, |candidate| taken.contains(candidate))
    }

    pub fn fresh_op_name(&self, base: &str) -> String {
        let taken: BTreeSet<String> = self.op_names().into_iter().collect();
        fresh_name(base, |candidate| taken.contains(candidate))
    }
}

fn fresh_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, p.ty))
            .collect();
        write!(f, "func {}({})", self.name, params.join(", "))?;
        if let Some(ret) = &self.ret {
            write!(f, " -> {}", ret)?;
        }
        writeln!(f, " {{")?;
        for (buffer, parts) in &self.partitions {
            for part in parts {
                writeln!(
                    f,
                    "  partition {} dim={} factor={} {}",
                    buffer, part.dim, part.factor, part.kind
                )?;
            }
        }
        for op in &self.body {
            write_op(f, op, 1)?;
        }
        writeln!(f, "}}")
    }
}

fn write_op(f: &mut fmt::Formatter<'_>, op: &Op, depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    match &op.kind {
        OpKind::Loop(l) => {
            let kind = if l.is_reduction() { "reduce" } else { "for" };
            write!(f, "{}{} {} in {}..{}", pad, kind, l.var, l.lower, l.upper)?;
            if l.step != 1 {
                write!(f, " step {}", l.step)?;
            }
            write!(f, " @{}", op.name)?;
            if let Some(ii) = l.pipeline {
                write!(f, " pipeline(II={})", ii)?;
            }
            writeln!(f, " {{")?;
            for child in &l.body {
                write_op(f, child, depth + 1)?;
            }
            writeln!(f, "{}}}", pad)
        }
        OpKind::Block(b) => {
            write!(f, "{}block @{}", pad, op.name)?;
            if b.dataflow {
                write!(f, " dataflow")?;
            }
            if let Some(from) = &b.inlined_from {
                write!(f, " inlined({})", from)?;
            }
            writeln!(f, " {{")?;
            for child in &b.ops {
                write_op(f, child, depth + 1)?;
            }
            writeln!(f, "{}}}", pad)
        }
        OpKind::Alloc {
            buffer,
            ty,
            init,
            storage,
        } => {
            write!(f, "{}{}: {}", pad, buffer, ty)?;
            if let Some(init) = init {
                write!(f, " = {}", init)?;
            }
            match storage {
                Storage::Memory => {}
                Storage::Stream { depth } => write!(f, " stream(depth={})", depth)?,
                Storage::PingPong => write!(f, " pingpong")?,
            }
            writeln!(f)
        }
        OpKind::Store { access, value } => writeln!(f, "{}{} = {}", pad, access, value),
        OpKind::Call(call) => {
            write!(f, "{}", pad)?;
            if let Some(result) = &call.result {
                write!(f, "{}: {} = ", result.name, result.ty)?;
            }
            writeln!(f, "call {}({}) @{}", call.target(), call.args.join(", "), op.name)
        }
        OpKind::Return { value } => writeln!(f, "{}return {}", pad, value),
    }
}
