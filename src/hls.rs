//! HLS C++ emitter
//!
//! Lowers a finished schedule to Vivado/Vitis-style C++: one function per
//! module, every local buffer declared at the top of its function, and one
//! synthesis pragma per pipelined loop, recorded partition, channel and
//! dataflow region. Functions still reached through residual calls are
//! emitted before their callers.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::ir::{Access, BinOp, DType, Expr, Module, Op, OpKind, Storage, TensorType};
use crate::schedule::Schedule;

/// Emitted translation unit
#[derive(Debug, Clone, Serialize)]
pub struct HlsProgram {
    pub top: String,
    /// Emitted function names, callees first
    pub functions: Vec<String>,
    pub code: String,
}

impl HlsProgram {
    /// Number of lines carrying `#pragma HLS <kind>`
    pub fn pragma_count(&self, kind: &str) -> usize {
        let needle = format!("#pragma HLS {}", kind);
        self.code.lines().filter(|line| line.trim_start().starts_with(&needle)).count()
    }
}

/// C identifier for an IR name
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn c_type(dtype: DType) -> &'static str {
    match dtype {
        DType::I8 => "int8_t",
        DType::I16 => "int16_t",
        DType::I32 => "int32_t",
        DType::I64 => "int64_t",
        DType::F32 => "float",
        DType::F64 => "double",
    }
}

fn declarator(ident: &str, ty: &TensorType) -> String {
    let dims: String = if ty.shape.is_empty() {
        "[1]".to_string()
    } else {
        ty.shape.iter().map(|d| format!("[{}]", d)).collect()
    };
    format!("{} {}{}", c_type(ty.dtype), ident, dims)
}

/// C identifiers of one function. Distinct IR names always get distinct
/// identifiers, even when they sanitize to the same text.
#[derive(Debug, Default)]
struct Idents {
    names: BTreeMap<String, String>,
    taken: BTreeSet<String>,
}

impl Idents {
    /// Identifier bound to an IR name, assigned on first use
    fn of(&mut self, name: &str) -> String {
        if let Some(ident) = self.names.get(name) {
            return ident.clone();
        }
        let ident = self.fresh(&sanitize(name));
        self.names.insert(name.to_string(), ident.clone());
        ident
    }

    /// `base`, or `base_<n>` for the first free `n`
    fn fresh(&mut self, base: &str) -> String {
        let mut ident = base.to_string();
        let mut n = 1;
        while !self.taken.insert(ident.clone()) {
            ident = format!("{}_{}", base, n);
            n += 1;
        }
        ident
    }

    fn access(&mut self, access: &Access) -> String {
        let buffer = self.of(&access.buffer);
        if access.indices.is_empty() {
            return format!("{}[0]", buffer);
        }
        let index: String = access.indices.iter().map(|i| format!("[{}]", self.expr(i))).collect();
        format!("{}{}", buffer, index)
    }

    fn expr(&mut self, e: &Expr) -> String {
        match e {
            Expr::Int(v) => v.to_string(),
            Expr::Float(v) => format!("{:?}", v),
            Expr::Var(name) => self.of(name),
            Expr::Load(access) => self.access(access),
            Expr::Binary(BinOp::Min, l, r) => format!("std::min({}, {})", self.expr(l), self.expr(r)),
            Expr::Binary(BinOp::Max, l, r) => format!("std::max({}, {})", self.expr(l), self.expr(r)),
            Expr::Binary(op, l, r) => format!("({} {} {})", self.expr(l), op.symbol(), self.expr(r)),
        }
    }
}

/// Generator for one translation unit
pub struct HlsGenerator<'a> {
    library: &'a BTreeMap<String, Module>,
    out: String,
    indent: usize,
    emitted: BTreeSet<String>,
    order: Vec<String>,
    idents: Idents,
    labels: Idents,
    ret: String,
}

impl<'a> HlsGenerator<'a> {
    pub fn new(library: &'a BTreeMap<String, Module>) -> Self {
        Self {
            library,
            out: String::new(),
            indent: 0,
            emitted: BTreeSet::new(),
            order: Vec::new(),
            idents: Idents::default(),
            labels: Idents::default(),
            ret: String::new(),
        }
    }

    pub fn generate(mut self, schedule: &Schedule) -> CompileResult<HlsProgram> {
        self.line("#include <stdint.h>");
        self.line("#include <algorithm>");
        self.line("");
        let top = schedule.module();
        self.emit_callees(top, &mut Vec::new())?;
        self.emit_function(top);
        debug!(top = %top.name, functions = self.order.len(), "emitted HLS");
        Ok(HlsProgram {
            top: sanitize(&top.name),
            functions: self.order,
            code: self.out,
        })
    }

    fn line(&mut self, text: &str) {
        if !text.is_empty() {
            self.out.push_str(&"  ".repeat(self.indent));
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    fn emit_callees(&mut self, module: &Module, stack: &mut Vec<String>) -> CompileResult<()> {
        stack.push(module.name.clone());
        for (_, op) in module.call_sites() {
            let Some(call) = op.as_call() else { continue };
            let target = call.target();
            if self.emitted.contains(&target) {
                continue;
            }
            if stack.contains(&target) {
                let mut cycle = stack.clone();
                cycle.push(target);
                return Err(CompileError::CyclicDependency { stages: cycle });
            }
            let library = self.library;
            let callee = library
                .get(&target)
                .ok_or_else(|| CompileError::unknown_function(&target))?;
            self.emit_callees(callee, stack)?;
            self.emit_function(callee);
        }
        stack.pop();
        Ok(())
    }

    fn emit_function(&mut self, module: &Module) {
        if !self.emitted.insert(module.name.clone()) {
            return;
        }
        let name = sanitize(&module.name);
        self.idents = Idents::default();
        self.labels = Idents::default();
        let mut params: Vec<String> = module
            .params
            .iter()
            .map(|p| declarator(&self.idents.of(&p.name), &p.ty))
            .collect();
        self.ret = self.idents.fresh("ret");
        if let Some(ret) = &module.ret {
            params.push(declarator(&self.ret, ret));
        }
        self.line(&format!("void {}({}) {{", name, params.join(", ")));
        self.indent += 1;

        let mut locals = Vec::new();
        module.walk(&mut |op| match &op.kind {
            OpKind::Alloc { buffer, ty, storage, .. } => locals.push((buffer.clone(), ty.clone(), storage.clone())),
            OpKind::Call(call) => {
                if let Some(result) = &call.result {
                    locals.push((result.name.clone(), result.ty.clone(), Storage::Memory));
                }
            }
            _ => {}
        });
        let locals: Vec<(String, TensorType, Storage)> = locals
            .into_iter()
            .map(|(buffer, ty, storage)| (self.idents.of(&buffer), ty, storage))
            .collect();

        for (buffer, parts) in &module.partitions {
            let ident = self.idents.of(buffer);
            for part in parts {
                self.line(&format!(
                    "#pragma HLS array_partition variable={} {} factor={} dim={}",
                    ident, part.kind, part.factor, part.dim
                ));
            }
        }
        for (ident, ty, storage) in &locals {
            self.line(&format!("{};", declarator(ident, ty)));
            match storage {
                Storage::Memory => {}
                Storage::Stream { depth } => {
                    self.line(&format!("#pragma HLS stream variable={} depth={}", ident, depth))
                }
                Storage::PingPong => self.line(&format!("#pragma HLS stream variable={} type=pipo", ident)),
            }
        }

        for op in &module.body {
            self.emit_op(op, module);
        }
        self.indent -= 1;
        self.line("}");
        self.line("");
        self.order.push(name);
    }

    fn emit_op(&mut self, op: &Op, module: &Module) {
        match &op.kind {
            OpKind::Loop(l) => {
                let var = self.idents.of(&l.var);
                let label = self.labels.fresh(&sanitize(&op.name));
                self.line(&format!(
                    "{}: for (int {} = {}; {} < {}; {} += {}) {{",
                    label,
                    var,
                    l.lower,
                    var,
                    l.upper,
                    var,
                    l.step
                ));
                self.indent += 1;
                if let Some(ii) = l.pipeline {
                    self.line(&format!("#pragma HLS pipeline II={}", ii));
                }
                for child in &l.body {
                    self.emit_op(child, module);
                }
                self.indent -= 1;
                self.line("}");
            }
            OpKind::Block(b) => {
                if let Some(from) = &b.inlined_from {
                    self.line(&format!("// inlined {} at {}", sanitize(from), sanitize(&op.name)));
                }
                self.line("{");
                self.indent += 1;
                if b.dataflow {
                    self.line("#pragma HLS dataflow");
                }
                for child in &b.ops {
                    self.emit_op(child, module);
                }
                self.indent -= 1;
                self.line("}");
            }
            OpKind::Alloc { buffer, ty, init: Some(init), .. } => {
                let value = self.idents.expr(init);
                let ident = self.idents.of(buffer);
                self.line(&format!(
                    "std::fill_n(&{}{}, {}, {});",
                    ident,
                    "[0]".repeat(ty.rank().max(1)),
                    ty.num_elements().max(1),
                    value
                ));
            }
            OpKind::Alloc { .. } => {}
            OpKind::Store { access, value } => {
                let target = self.idents.access(access);
                let value = self.idents.expr(value);
                self.line(&format!("{} = {};", target, value));
            }
            OpKind::Call(call) => {
                let mut args: Vec<String> = call.args.iter().map(|a| self.idents.of(a)).collect();
                if let Some(result) = &call.result {
                    args.push(self.idents.of(&result.name));
                }
                self.line(&format!("// call site {}", sanitize(&op.name)));
                self.line(&format!("{}({});", sanitize(&call.target()), args.join(", ")));
            }
            OpKind::Return { value } => {
                let ty = module.ret.clone().unwrap_or_else(|| TensorType::scalar(DType::I32));
                let src = self.idents.of(value);
                let ret = self.ret.clone();
                if ty.rank() == 0 {
                    self.line(&format!("{}[0] = {}[0];", ret, src));
                    return;
                }
                let vars: Vec<String> = (0..ty.rank()).map(|k| self.idents.fresh(&format!("r{}", k))).collect();
                for (var, extent) in vars.iter().zip(&ty.shape) {
                    self.line(&format!("for (int {} = 0; {} < {}; {}++) {{", var, var, extent, var));
                    self.indent += 1;
                }
                let index: String = vars.iter().map(|v| format!("[{}]", v)).collect();
                self.line(&format!("{}{} = {}{};", ret, index, src, index));
                for _ in &vars {
                    self.indent -= 1;
                    self.line("}");
                }
            }
        }
    }
}

/// Emit `schedule` plus every library function it still calls
pub fn emit(schedule: &Schedule, library: &BTreeMap<String, Module>) -> CompileResult<HlsProgram> {
    HlsGenerator::new(library).generate(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{alloc, grid, store, FunctionBuilder};
    use crate::ir::PartitionKind;
    use crate::session::{Program, Session};

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("site.i.inner"), "site_i_inner");
        assert_eq!(sanitize("0x"), "_0x");
    }

    #[test]
    fn test_pragmas() {
        let ty = TensorType::new(DType::F32, [8, 8]);
        let m = FunctionBuilder::new("scale")
            .param("A", ty.clone())
            .op(grid(
                &[("i", 8), ("j", 8)],
                vec![store("A", vec![Expr::var("i"), Expr::var("j")], Expr::load("A", vec![Expr::var("i"), Expr::var("j")]) * Expr::Float(0.5))],
            ))
            .build();
        let mut session = Session::new(Program::new().with(m));
        let mut s = session.customize("scale").unwrap();
        s.pipeline("j").unwrap();
        s.partition("A", 2, 4, PartitionKind::Cyclic).unwrap();
        let program = emit(&s, &session.library()).unwrap();
        assert_eq!(program.pragma_count("pipeline"), 1);
        assert!(program.code.contains("#pragma HLS array_partition variable=A cyclic factor=4 dim=2"));
        assert!(program.code.contains("void scale(float A[8][8])"));
        assert!(program.code.contains("A[i][j] = (A[i][j] * 0.5);"));
        assert_eq!(program.functions, vec!["scale"]);
    }

    #[test]
    fn test_colliding_names_stay_distinct() {
        let ty = TensorType::new(DType::I32, [4]);
        let i = Expr::var("i");
        let m = FunctionBuilder::new("copy")
            .param("site_B", ty.clone())
            .returns(ty.clone())
            .op(alloc("site.B", ty.clone()))
            .op(grid(&[("i", 4)], vec![store("site.B", vec![i.clone()], Expr::load("site_B", vec![i.clone()]))]))
            .op(alloc("ret", ty))
            .op(grid(&[("i", 4)], vec![store("ret", vec![i.clone()], Expr::load("site.B", vec![i]) + 1)]))
            .ret("ret")
            .build();
        let mut session = Session::new(Program::new().with(m));
        let s = session.customize("copy").unwrap();
        let code = emit(&s, &session.library()).unwrap().code;
        assert!(code.contains("void copy(int32_t site_B[4], int32_t ret[4])"));
        assert!(code.contains("int32_t site_B_1[4];"));
        assert!(code.contains("int32_t ret_1[4];"));
        assert!(code.contains("site_B_1[i] = site_B[i];"));
        assert!(code.contains("ret_1[i] = (site_B_1[i] + 1);"));
        assert!(code.contains("ret[r0] = ret_1[r0];"));
        // Both nests reuse the loop variable `i` under their own labels
        assert!(code.contains("i: for (int i = 0; i < 4; i += 1) {"));
        assert!(code.contains("i_1: for (int i = 0; i < 4; i += 1) {"));
    }
}
