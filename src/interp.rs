//! Reference evaluator
//!
//! Executes a module directly on the IR so schedules can be checked
//! numerically against the unscheduled program. Banks, streams and pipeline
//! markings are ignored; they change how hardware runs the code, not what it
//! computes. Residual calls resolve through a library of modules keyed by
//! [`Call::target`](crate::ir::Call::target).

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{CompileError, CompileResult};
use crate::ir::{Access, BinOp, DType, Expr, Module, Op, OpKind, TensorType};

const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_i64(self) -> i64 {
        match self {
            Value::Int(v) => v,
            Value::Float(v) => v as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    /// Convert to the representation of `dtype`, wrapping integers to its width
    pub fn cast(self, dtype: DType) -> Value {
        match dtype {
            DType::F32 => Value::Float(self.as_f64() as f32 as f64),
            DType::F64 => Value::Float(self.as_f64()),
            DType::I8 => Value::Int(self.as_i64() as i8 as i64),
            DType::I16 => Value::Int(self.as_i64() as i16 as i64),
            DType::I32 => Value::Int(self.as_i64() as i32 as i64),
            DType::I64 => Value::Int(self.as_i64()),
        }
    }
}

/// A dense row-major buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub ty: TensorType,
    pub data: Vec<Value>,
}

impl Tensor {
    pub fn zeros(ty: TensorType) -> Self {
        let zero = Value::Int(0).cast(ty.dtype);
        let data = vec![zero; ty.num_elements()];
        Self { ty, data }
    }

    pub fn filled(ty: TensorType, value: Value) -> Self {
        let value = value.cast(ty.dtype);
        let data = vec![value; ty.num_elements()];
        Self { ty, data }
    }

    /// Build from a function of the multi-dimensional index
    pub fn from_fn(ty: TensorType, f: impl Fn(&[usize]) -> i64) -> Self {
        let mut tensor = Self::zeros(ty);
        let mut index = vec![0usize; tensor.ty.rank()];
        for slot in 0..tensor.data.len() {
            let mut rest = slot;
            for (d, extent) in tensor.ty.shape.iter().enumerate().rev() {
                index[d] = rest % extent;
                rest /= extent;
            }
            tensor.data[slot] = Value::Int(f(&index)).cast(tensor.ty.dtype);
        }
        tensor
    }

    fn offset(&self, index: &[i64]) -> Option<usize> {
        if index.len() != self.ty.rank() {
            return None;
        }
        let mut offset = 0usize;
        for (i, extent) in index.iter().zip(&self.ty.shape) {
            let i = usize::try_from(*i).ok().filter(|i| i < extent)?;
            offset = offset * extent + i;
        }
        Some(offset)
    }

    pub fn get(&self, index: &[i64]) -> Option<Value> {
        self.offset(index).map(|o| self.data[o])
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.data.iter().map(|v| v.as_i64()).collect()
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.iter().map(|v| v.as_f64()).collect()
    }
}

/// Outcome of running a module: its return value and the final state of
/// every argument (buffers are passed by reference)
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub result: Option<Tensor>,
    pub args: Vec<Tensor>,
}

pub struct Interpreter<'a> {
    library: &'a BTreeMap<String, Module>,
    max_depth: usize,
}

struct Frame {
    buffers: BTreeMap<String, Tensor>,
    vars: BTreeMap<String, i64>,
    result: Option<Tensor>,
}

impl<'a> Interpreter<'a> {
    pub fn new(library: &'a BTreeMap<String, Module>) -> Self {
        Self {
            library,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn run(&self, module: &Module, args: Vec<Tensor>) -> CompileResult<Execution> {
        self.call(module, args, 0)
    }

    fn call(&self, module: &Module, args: Vec<Tensor>, depth: usize) -> CompileResult<Execution> {
        if depth >= self.max_depth {
            return Err(CompileError::eval(format!("call depth exceeds {} in `{}`", self.max_depth, module.name)));
        }
        if args.len() != module.params.len() {
            return Err(CompileError::eval(format!(
                "`{}` takes {} argument(s), got {}",
                module.name,
                module.params.len(),
                args.len()
            )));
        }
        let mut frame = Frame {
            buffers: BTreeMap::new(),
            vars: BTreeMap::new(),
            result: None,
        };
        for (param, arg) in module.params.iter().zip(args) {
            if param.ty.shape != arg.ty.shape {
                return Err(CompileError::type_mismatch(
                    format!("{}: {}", param.name, param.ty),
                    arg.ty.to_string(),
                ));
            }
            frame.buffers.insert(param.name.clone(), arg);
        }
        trace!(module = %module.name, depth, "evaluate");
        self.exec_ops(&module.body, &mut frame, depth)?;
        let args = module
            .params
            .iter()
            .map(|p| {
                frame
                    .buffers
                    .remove(&p.name)
                    .ok_or_else(|| CompileError::eval(format!("argument `{}` vanished", p.name)))
            })
            .collect::<CompileResult<Vec<_>>>()?;
        Ok(Execution {
            result: frame.result,
            args,
        })
    }

    fn exec_ops(&self, ops: &[Op], frame: &mut Frame, depth: usize) -> CompileResult<()> {
        for op in ops {
            self.exec(op, frame, depth)?;
        }
        Ok(())
    }

    fn exec(&self, op: &Op, frame: &mut Frame, depth: usize) -> CompileResult<()> {
        match &op.kind {
            OpKind::Loop(l) => {
                if l.step <= 0 {
                    return Err(CompileError::eval(format!("loop `{}` has step {}", op.name, l.step)));
                }
                let saved = frame.vars.get(&l.var).copied();
                let mut v = l.lower;
                while v < l.upper {
                    frame.vars.insert(l.var.clone(), v);
                    self.exec_ops(&l.body, frame, depth)?;
                    v += l.step;
                }
                match saved {
                    Some(old) => frame.vars.insert(l.var.clone(), old),
                    None => frame.vars.remove(&l.var),
                };
                Ok(())
            }
            OpKind::Block(b) => self.exec_ops(&b.ops, frame, depth),
            OpKind::Alloc { buffer, ty, init, .. } => {
                let tensor = match init {
                    Some(init) => Tensor::filled(ty.clone(), self.eval(init, frame)?),
                    None => Tensor::zeros(ty.clone()),
                };
                frame.buffers.insert(buffer.clone(), tensor);
                Ok(())
            }
            OpKind::Store { access, value } => {
                let value = self.eval(value, frame)?;
                let index = self.eval_indices(access, frame)?;
                let tensor = frame
                    .buffers
                    .get_mut(&access.buffer)
                    .ok_or_else(|| CompileError::eval(format!("store to unallocated buffer `{}`", access.buffer)))?;
                let offset = tensor
                    .offset(&index)
                    .ok_or_else(|| CompileError::eval(format!("store {} out of bounds: {:?}", access, index)))?;
                tensor.data[offset] = value.cast(tensor.ty.dtype);
                Ok(())
            }
            OpKind::Call(call) => {
                let target = call.target();
                let callee = self
                    .library
                    .get(&target)
                    .ok_or_else(|| CompileError::unknown_function(&target))?;
                let args = call
                    .args
                    .iter()
                    .map(|a| {
                        frame
                            .buffers
                            .get(a)
                            .cloned()
                            .ok_or_else(|| CompileError::eval(format!("argument `{}` is not allocated", a)))
                    })
                    .collect::<CompileResult<Vec<_>>>()?;
                let execution = self.call(callee, args, depth + 1)?;
                for (name, tensor) in call.args.iter().zip(execution.args) {
                    frame.buffers.insert(name.clone(), tensor);
                }
                if let Some(result) = &call.result {
                    let tensor = execution
                        .result
                        .ok_or_else(|| CompileError::eval(format!("`{}` returned nothing", target)))?;
                    frame.buffers.insert(result.name.clone(), tensor);
                }
                Ok(())
            }
            OpKind::Return { value } => {
                let tensor = frame
                    .buffers
                    .get(value)
                    .cloned()
                    .ok_or_else(|| CompileError::eval(format!("returned buffer `{}` is not allocated", value)))?;
                frame.result = Some(tensor);
                Ok(())
            }
        }
    }

    fn eval_indices(&self, access: &Access, frame: &Frame) -> CompileResult<Vec<i64>> {
        access
            .indices
            .iter()
            .map(|i| self.eval(i, frame).map(Value::as_i64))
            .collect()
    }

    fn eval(&self, expr: &Expr, frame: &Frame) -> CompileResult<Value> {
        match expr {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Float(v) => Ok(Value::Float(*v)),
            Expr::Var(name) => frame
                .vars
                .get(name)
                .map(|v| Value::Int(*v))
                .ok_or_else(|| CompileError::eval(format!("unbound variable `{}`", name))),
            Expr::Load(access) => {
                let index = self.eval_indices(access, frame)?;
                let tensor = frame
                    .buffers
                    .get(&access.buffer)
                    .ok_or_else(|| CompileError::eval(format!("load from unallocated buffer `{}`", access.buffer)))?;
                tensor
                    .get(&index)
                    .ok_or_else(|| CompileError::eval(format!("load {} out of bounds: {:?}", access, index)))
            }
            Expr::Binary(op, l, r) => {
                let (l, r) = (self.eval(l, frame)?, self.eval(r, frame)?);
                binary(*op, l, r)
            }
        }
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> CompileResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let v = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div | BinOp::Mod if b == 0 => return Err(CompileError::eval("integer division by zero")),
                BinOp::Div => a.wrapping_div(b),
                BinOp::Mod => a.wrapping_rem(b),
                BinOp::Min => a.min(b),
                BinOp::Max => a.max(b),
            };
            Ok(Value::Int(v))
        }
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                BinOp::Min => a.min(b),
                BinOp::Max => a.max(b),
            };
            Ok(Value::Float(v))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{call, grid, store, FunctionBuilder};

    #[test]
    fn test_int_wraps_to_dtype() {
        assert_eq!(Value::Int(300).cast(DType::I8), Value::Int(44));
        assert_eq!(Value::Float(2.9).cast(DType::I32), Value::Int(2));
    }

    #[test]
    fn test_call_through_library() {
        let ty = TensorType::new(DType::I32, [3]);
        let double = FunctionBuilder::new("double")
            .param("A", ty.clone())
            .op(grid(&[("i", 3)], vec![store("A", vec![Expr::var("i")], Expr::load("A", vec![Expr::var("i")]) * 2)]))
            .build();
        let top = FunctionBuilder::new("top")
            .param("X", ty.clone())
            .op(call("double").arg("X").build())
            .build();
        let library = BTreeMap::from([("double".to_string(), double)]);
        let input = Tensor::from_fn(ty, |ix| ix[0] as i64 + 1);
        let out = Interpreter::new(&library).run(&top, vec![input]).unwrap();
        assert_eq!(out.args[0].to_i64_vec(), vec![2, 4, 6]);
        assert!(out.result.is_none());
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let ty = TensorType::new(DType::I32, [2]);
        let m = FunctionBuilder::new("oob")
            .param("A", ty.clone())
            .op(grid(&[("i", 3)], vec![store("A", vec![Expr::var("i")], Expr::Int(0))]))
            .build();
        let library = BTreeMap::new();
        let err = Interpreter::new(&library).run(&m, vec![Tensor::zeros(ty)]).unwrap_err();
        assert!(matches!(err, CompileError::Evaluation { .. }));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(binary(BinOp::Div, Value::Int(1), Value::Int(0)).is_err());
        assert_eq!(binary(BinOp::Div, Value::Float(1.0), Value::Int(2)).unwrap(), Value::Float(0.5));
    }
}
