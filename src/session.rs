//! Programs, generic instantiation and customization sessions
//!
//! A [`Session`] owns one program, its instantiation table and the
//! equivalence tracker every schedule customized from it shares. Two
//! sessions never share state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CompilerConfig;
use crate::equivalence::{qualified, EquivalenceTracker, SharedTracker};
use crate::error::{CompileError, CompileResult};
use crate::ir::{instance_name, Call, Expr, Module, Op, OpKind};
use crate::schedule::{Origin, Schedule};

/// A function definition; generic when it declares instantiation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    #[serde(flatten)]
    pub module: Module,
    /// Names bound by `f[v1, v2, ...]` instantiation, usable as `Expr::Var`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inst_params: Vec<String>,
}

impl Function {
    pub fn is_generic(&self) -> bool {
        !self.inst_params.is_empty()
    }
}

/// The front end's output: every function of one program
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, module: Module) -> Self {
        self.add(module);
        self
    }

    pub fn with_generic(mut self, module: Module, inst_params: &[&str]) -> Self {
        self.functions.push(Function {
            module,
            inst_params: inst_params.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    pub fn add(&mut self, module: Module) {
        self.functions.push(Function {
            module,
            inst_params: Vec::new(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.module.name == name)
    }

    pub fn from_json(text: &str) -> CompileResult<Self> {
        let program: Program = serde_json::from_str(text)
            .map_err(|e| CompileError::parse_error(format!("invalid program: {}", e)))?;
        let mut seen = BTreeSet::new();
        for function in &program.functions {
            if !seen.insert(function.module.name.as_str()) {
                return Err(CompileError::parse_error(format!(
                    "function `{}` defined twice",
                    function.module.name
                )));
            }
        }
        Ok(program)
    }

    pub fn load(path: impl AsRef<Path>) -> CompileResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompileError::parse_error(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Rename call sites and inlined bodies inside a tagged instance to
/// `<callee>_<tag>` so emitted code can be traced back to the instance
pub fn retag_call_sites(ops: &mut [Op], tag: &str) {
    for op in ops.iter_mut() {
        op.walk_mut(&mut |op| {
            let base = match &op.kind {
                OpKind::Call(call) if op.name == call.callee => Some(call.callee.clone()),
                OpKind::Block(block) => block.inlined_from.clone().filter(|from| *from == op.name),
                _ => None,
            };
            if let Some(base) = base {
                op.name = format!("{}_{}", base, tag);
            }
        });
    }
}

type InstanceKey = (String, Vec<i64>, Option<String>);

/// (base, instantiation arguments, tag) -> specialized module
#[derive(Debug, Clone, Default)]
pub struct InstantiationTable {
    entries: BTreeMap<InstanceKey, Module>,
}

impl InstantiationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing specialization, or a fresh one from the generic template
    pub fn get_or_specialize(
        &mut self,
        program: &Program,
        base: &str,
        args: &[i64],
        tag: Option<&str>,
    ) -> CompileResult<&Module> {
        let key = (base.to_string(), args.to_vec(), tag.map(str::to_string));
        if !self.entries.contains_key(&key) {
            let module = specialize(program, base, args, tag)?;
            debug!(base, instance = %module.name, "specialized");
            self.entries.insert(key.clone(), module);
        }
        self.entries
            .get(&key)
            .ok_or_else(|| CompileError::unknown_function(instance_name(base, args, tag)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.entries.values()
    }
}

fn specialize(program: &Program, base: &str, args: &[i64], tag: Option<&str>) -> CompileResult<Module> {
    let function = program
        .get(base)
        .ok_or_else(|| CompileError::unknown_function(base))?;
    if function.inst_params.len() != args.len() {
        return Err(CompileError::type_mismatch(
            format!("{} instantiation argument(s) for `{}`", function.inst_params.len(), base),
            format!("{}", args.len()),
        ));
    }
    let mut module = function.module.clone();
    module.name = instance_name(base, args, tag);
    for (param, value) in function.inst_params.iter().zip(args) {
        let value = Expr::Int(*value);
        for op in &mut module.body {
            op.for_each_expr_mut(&mut |e| e.substitute(param, &value));
        }
    }
    if let Some(tag) = tag {
        retag_call_sites(&mut module.body, tag);
    }
    Ok(module)
}

/// One customization session over a program
pub struct Session {
    program: Program,
    instances: InstantiationTable,
    tracker: SharedTracker,
    config: CompilerConfig,
}

impl Session {
    pub fn new(program: Program) -> Self {
        Self::with_config(program, CompilerConfig::default())
    }

    pub fn with_config(program: Program, config: CompilerConfig) -> Self {
        Self {
            program,
            instances: InstantiationTable::new(),
            tracker: EquivalenceTracker::shared(),
            config,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn tracker(&self) -> SharedTracker {
        Rc::clone(&self.tracker)
    }

    pub fn instances(&self) -> &InstantiationTable {
        &self.instances
    }

    /// Schedule a non-generic function
    pub fn customize(&mut self, name: &str) -> CompileResult<Schedule> {
        self.customize_instance(name, &[], None)
    }

    /// Schedule one instantiation of a function; also infers use-def
    /// relations along the whole call tree below it
    pub fn customize_instance(&mut self, name: &str, args: &[i64], tag: Option<&str>) -> CompileResult<Schedule> {
        let module = self.resolve(name, args, tag)?;
        self.relate_call_tree(&module, &mut Vec::new())?;
        debug!(function = name, module = %module.name, "customize");
        Ok(Schedule::new(
            module,
            Origin {
                base: name.to_string(),
                inst_args: args.to_vec(),
                tag: tag.map(str::to_string),
            },
            self.tracker(),
            self.config.clone(),
        ))
    }

    fn resolve(&mut self, base: &str, args: &[i64], tag: Option<&str>) -> CompileResult<Module> {
        let function = self
            .program
            .get(base)
            .ok_or_else(|| CompileError::unknown_function(base))?;
        if args.is_empty() && tag.is_none() {
            if function.is_generic() {
                return Err(CompileError::type_mismatch(
                    format!("{} instantiation argument(s) for `{}`", function.inst_params.len(), base),
                    "0",
                ));
            }
            return Ok(function.module.clone());
        }
        Ok(self
            .instances
            .get_or_specialize(&self.program, base, args, tag)?
            .clone())
    }

    /// Module a call resolves to
    pub fn callee(&mut self, call: &Call) -> CompileResult<Module> {
        self.resolve(&call.callee, &call.inst_args, call.tag.as_deref())
    }

    fn relate_call_tree(&mut self, module: &Module, stack: &mut Vec<String>) -> CompileResult<()> {
        if stack.contains(&module.name) {
            let mut cycle = stack.clone();
            cycle.push(module.name.clone());
            return Err(CompileError::CyclicDependency { stages: cycle });
        }
        if stack.len() >= self.config.max_call_depth {
            return Err(CompileError::config(format!(
                "call depth exceeds max_call_depth ({})",
                self.config.max_call_depth
            )));
        }
        stack.push(module.name.clone());
        let calls: Vec<Call> = module
            .call_sites()
            .into_iter()
            .filter_map(|(_, op)| op.as_call().cloned())
            .collect();
        for call in calls {
            let callee = self.callee(&call)?;
            if callee.params.len() != call.args.len() {
                return Err(CompileError::type_mismatch(
                    format!("{} argument(s) for `{}`", callee.params.len(), callee.name),
                    call.args.len().to_string(),
                ));
            }
            {
                let mut tracker = self.tracker.borrow_mut();
                for (actual, formal) in call.args.iter().zip(&callee.params) {
                    tracker.relate(&qualified(&module.name, actual), &qualified(&callee.name, &formal.name));
                }
                if let (Some(result), Some(returned)) = (&call.result, callee.returned_value()) {
                    tracker.relate(&qualified(&module.name, &result.name), &qualified(&callee.name, returned));
                }
            }
            self.relate_call_tree(&callee, stack)?;
        }
        stack.pop();
        Ok(())
    }

    /// Every function the session can resolve calls to: plain functions
    /// plus every instantiation specialized so far
    pub fn library(&self) -> BTreeMap<String, Module> {
        let mut library: BTreeMap<String, Module> = self
            .program
            .functions
            .iter()
            .filter(|f| !f.is_generic())
            .map(|f| (f.module.name.clone(), f.module.clone()))
            .collect();
        for module in self.instances.modules() {
            library.insert(module.name.clone(), module.clone());
        }
        library
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{call, grid, store, FunctionBuilder};
    use crate::ir::{DType, TensorType};

    fn scalar() -> TensorType {
        TensorType::scalar(DType::I32)
    }

    fn use_def_program() -> Program {
        let foo2 = FunctionBuilder::new("foo2")
            .param("A", scalar())
            .returns(scalar())
            .alloc("B", scalar())
            .op(store("B", vec![], Expr::load("A", vec![]) + 1))
            .ret("B")
            .build();
        let foo = FunctionBuilder::new("foo")
            .param("A", scalar())
            .returns(scalar())
            .op(call("foo2").arg("A").result("T", scalar()).build())
            .alloc("C", scalar())
            .op(store("C", vec![], Expr::load("T", vec![]) * 2))
            .ret("C")
            .build();
        let kernel = FunctionBuilder::new("kernel")
            .param("A", scalar())
            .returns(scalar())
            .alloc("D", scalar())
            .op(store("D", vec![], Expr::load("A", vec![]) + 1))
            .op(call("foo").arg("D").result("E", scalar()).build())
            .ret("E")
            .build();
        Program::new().with(foo2).with(foo).with(kernel)
    }

    #[test]
    fn test_use_def_chain() {
        let mut session = Session::new(use_def_program());
        let s = session.customize("kernel").unwrap();
        let class = s.equivalent_values("kernel:D");
        assert_eq!(
            class,
            BTreeSet::from(["foo2:A".to_string(), "foo:A".to_string(), "kernel:D".to_string()])
        );
        let class = s.equivalent_values("kernel:E");
        assert!(class.contains("foo:C"));
        assert!(!class.contains("foo:T"));
    }

    #[test]
    fn test_returned_values_close_over_the_call_chain() {
        // C calls B calls A; B and C hand back their callee's result as is
        let a = FunctionBuilder::new("A")
            .param("x", scalar())
            .returns(scalar())
            .alloc("r", scalar())
            .op(store("r", vec![], Expr::load("x", vec![]) + 1))
            .ret("r")
            .build();
        let b = FunctionBuilder::new("B")
            .param("x", scalar())
            .returns(scalar())
            .op(call("A").arg("x").result("t", scalar()).build())
            .ret("t")
            .build();
        let c = FunctionBuilder::new("C")
            .param("x", scalar())
            .returns(scalar())
            .op(call("B").arg("x").result("y", scalar()).build())
            .ret("y")
            .build();
        let mut session = Session::new(Program::new().with(a).with(b).with(c));
        let s = session.customize("C").unwrap();

        let results = BTreeSet::from(["A:r".to_string(), "B:t".to_string(), "C:y".to_string()]);
        for value in &results {
            assert_eq!(s.equivalent_values(value), results, "class of {}", value);
        }
        assert_eq!(
            s.equivalent_values("A:x"),
            BTreeSet::from(["A:x".to_string(), "B:x".to_string(), "C:x".to_string()])
        );
    }

    #[test]
    fn test_instantiation_naming_and_substitution() {
        let ty = TensorType::new(DType::I32, [4]);
        let add_const = FunctionBuilder::new("add_const")
            .param("A", ty.clone())
            .op(grid(&[("i", 4)], vec![store("A", vec![Expr::var("i")], Expr::load("A", vec![Expr::var("i")]) + Expr::var("N"))]))
            .build();
        let program = Program::new().with_generic(add_const, &["N"]);
        let mut session = Session::new(program);
        let s = session.customize_instance("add_const", &[5], Some("const5")).unwrap();
        assert_eq!(s.module().name, "add_const_const5");
        let text = s.module().to_string();
        assert!(text.contains("+ 5"));
        assert!(!text.contains("N"));
        assert!(session.customize("add_const").is_err());
        assert_eq!(session.instances().len(), 1);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let mut a = Session::new(use_def_program());
        let b = Session::new(use_def_program());
        a.customize("kernel").unwrap();
        assert!(b.tracker().borrow().is_empty());
        assert!(!a.tracker().borrow().is_empty());
    }

    #[test]
    fn test_program_json_round_trip() {
        let program = use_def_program();
        let json = program.to_json().unwrap();
        assert_eq!(Program::from_json(&json).unwrap(), program);
    }
}
