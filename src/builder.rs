//! Programmatic IR construction
//!
//! The front end is out of scope, so programs either arrive as JSON or are
//! assembled with these builders.
//!
//! ```rust
//! use accel_schedule::builder::{grid, store, FunctionBuilder};
//! use accel_schedule::{DType, Expr, TensorType};
//!
//! let ty = TensorType::new(DType::I32, [10, 10]);
//! let stage_a = FunctionBuilder::new("stageA")
//!     .returns(ty.clone())
//!     .alloc("A", ty)
//!     .op(grid(&[("i", 10), ("j", 10)], vec![
//!         store("A", vec![Expr::var("i"), Expr::var("j")], Expr::var("i") + Expr::var("j")),
//!     ]))
//!     .ret("A")
//!     .build();
//! assert_eq!(stage_a.op_names(), vec!["A", "i", "j", "S0", "ret"]);
//! ```

use std::collections::BTreeSet;

use crate::ir::{
    Access, Block, Call, Expr, Loop, LoopKind, Module, Op, OpKind, Param, Storage, TensorType,
};

/// Builder for one function's [`Module`]
pub struct FunctionBuilder {
    module: Module,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: TensorType) -> Self {
        self.module.params.push(Param::new(name, ty));
        self
    }

    pub fn returns(mut self, ty: TensorType) -> Self {
        self.module.ret = Some(ty);
        self
    }

    pub fn alloc(self, buffer: impl Into<String>, ty: TensorType) -> Self {
        self.op(alloc(buffer, ty))
    }

    pub fn op(mut self, op: Op) -> Self {
        self.module.body.push(op);
        self
    }

    pub fn ops(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.module.body.extend(ops);
        self
    }

    pub fn ret(self, value: impl Into<String>) -> Self {
        self.op(Op::new(String::new(), OpKind::Return { value: value.into() }))
    }

    /// Finish the module, naming anonymous ops and making every name unique
    pub fn build(mut self) -> Module {
        assign_names(&mut self.module.body);
        self.module
    }
}

/// Give every unnamed op a default name, then suffix duplicates with `_1`, `_2`, ...
pub fn assign_names(ops: &mut [Op]) {
    let mut seen = BTreeSet::new();
    let mut stores = 0usize;
    let mut blocks = 0usize;
    for op in ops.iter_mut() {
        op.walk_mut(&mut |op| {
            if op.name.is_empty() {
                op.name = match &op.kind {
                    OpKind::Loop(l) => l.var.clone(),
                    OpKind::Store { .. } => {
                        stores += 1;
                        format!("S{}", stores - 1)
                    }
                    OpKind::Block(_) => {
                        blocks += 1;
                        format!("block{}", blocks - 1)
                    }
                    OpKind::Alloc { buffer, .. } => buffer.clone(),
                    OpKind::Call(call) => match &call.tag {
                        Some(tag) => format!("{}_{}", call.callee, tag),
                        None => call.callee.clone(),
                    },
                    OpKind::Return { .. } => "ret".to_string(),
                };
            }
            if !seen.insert(op.name.clone()) {
                let unique = (1..)
                    .map(|n| format!("{}_{}", op.name, n))
                    .find(|candidate| !seen.contains(candidate))
                    .unwrap_or_default();
                seen.insert(unique.clone());
                op.name = unique;
            }
        });
    }
}

impl Op {
    /// Override the default name assigned at build time
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        if let OpKind::Loop(l) = &mut self.kind {
            l.step = step;
        }
        self
    }
}

fn make_loop(var: &str, lower: i64, upper: i64, kind: LoopKind, body: Vec<Op>) -> Op {
    Op::new(
        String::new(),
        OpKind::Loop(Loop {
            var: var.to_string(),
            lower,
            upper,
            step: 1,
            kind,
            pipeline: None,
            body,
        }),
    )
}

pub fn for_loop(var: &str, lower: i64, upper: i64, body: Vec<Op>) -> Op {
    make_loop(var, lower, upper, LoopKind::Spatial, body)
}

pub fn reduction(var: &str, lower: i64, upper: i64, body: Vec<Op>) -> Op {
    make_loop(var, lower, upper, LoopKind::Reduction, body)
}

/// Perfect nest of spatial loops `0..extent`, outermost first
pub fn grid(dims: &[(&str, i64)], body: Vec<Op>) -> Op {
    let mut ops = body;
    for (var, extent) in dims.iter().rev() {
        ops = vec![for_loop(var, 0, *extent, ops)];
    }
    match ops.pop() {
        Some(op) if ops.is_empty() => op,
        Some(op) => {
            ops.push(op);
            block(ops)
        }
        None => block(Vec::new()),
    }
}

pub fn block(ops: Vec<Op>) -> Op {
    Op::new(
        String::new(),
        OpKind::Block(Block {
            ops,
            ..Block::default()
        }),
    )
}

pub fn store(buffer: &str, indices: Vec<Expr>, value: Expr) -> Op {
    Op::new(
        String::new(),
        OpKind::Store {
            access: Access::new(buffer, indices),
            value,
        },
    )
}

pub fn alloc(buffer: impl Into<String>, ty: TensorType) -> Op {
    Op::new(
        String::new(),
        OpKind::Alloc {
            buffer: buffer.into(),
            ty,
            init: None,
            storage: Storage::Memory,
        },
    )
}

/// Allocation with every element set to `init`
pub fn alloc_init(buffer: impl Into<String>, ty: TensorType, init: Expr) -> Op {
    let mut op = alloc(buffer, ty);
    if let OpKind::Alloc { init: slot, .. } = &mut op.kind {
        *slot = Some(init);
    }
    op
}

/// Builder for call ops
pub struct CallBuilder {
    call: Call,
}

impl CallBuilder {
    pub fn new(callee: impl Into<String>) -> Self {
        Self {
            call: Call {
                callee: callee.into(),
                inst_args: Vec::new(),
                tag: None,
                args: Vec::new(),
                result: None,
            },
        }
    }

    /// Instantiation arguments of a generic callee
    pub fn inst(mut self, args: &[i64]) -> Self {
        self.call.inst_args = args.to_vec();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.call.tag = Some(tag.into());
        self
    }

    pub fn arg(mut self, buffer: impl Into<String>) -> Self {
        self.call.args.push(buffer.into());
        self
    }

    pub fn result(mut self, name: impl Into<String>, ty: TensorType) -> Self {
        self.call.result = Some(Param::new(name, ty));
        self
    }

    pub fn build(self) -> Op {
        Op::new(String::new(), OpKind::Call(self.call))
    }
}

pub fn call(callee: impl Into<String>) -> CallBuilder {
    CallBuilder::new(callee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::DType;

    #[test]
    fn test_duplicate_loop_names() {
        let ty = TensorType::new(DType::I32, [4]);
        let module = FunctionBuilder::new("f")
            .param("A", ty.clone())
            .op(for_loop("i", 0, 4, vec![store("A", vec![Expr::var("i")], Expr::Int(0))]))
            .op(for_loop("i", 0, 4, vec![store("A", vec![Expr::var("i")], Expr::Int(1))]))
            .build();
        assert_eq!(module.op_names(), vec!["i", "S0", "i_1", "S1"]);
    }

    #[test]
    fn test_tagged_call_name() {
        let ty = TensorType::new(DType::I32, [4]);
        let module = FunctionBuilder::new("top")
            .param("A", ty.clone())
            .op(call("add_const").inst(&[5]).tag("const5").arg("A").result("B", ty).build())
            .build();
        assert_eq!(module.op_names(), vec!["add_const_const5"]);
        let call = module.body[0].as_call().unwrap();
        assert_eq!(call.target(), "add_const_const5");
    }

    #[test]
    fn test_explicit_names_kept() {
        let module = FunctionBuilder::new("f")
            .op(for_loop("i", 0, 2, vec![]).named("outer"))
            .build();
        assert_eq!(module.op_names(), vec!["outer"]);
    }

    #[test]
    fn test_grid_is_perfect_nest() {
        let op = grid(&[("i", 2), ("j", 3)], vec![]);
        let outer = op.as_loop().unwrap();
        assert_eq!(outer.var, "i");
        assert_eq!(outer.body.len(), 1);
        assert_eq!(outer.body[0].as_loop().unwrap().upper, 3);
    }
}
