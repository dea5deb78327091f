use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::rc::Rc;

use indexmap::IndexMap;
use tamarin_code::{make, read_u16, read_u8, Instructions, Op};
use tamarin_object::{Builtin, Closure, CompiledFunction, HashPair, Value, BUILTINS};
use tamarin_syntax::{Block, Expr, FunctionLit, InfixOp, PrefixOp, Program, Stmt};

pub const STACK_SIZE: usize = 2048;
pub const GLOBALS_SIZE: usize = 65536;
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug)]
pub enum VmError {
    StackUnderflow,
    Compile { message: String },
    Runtime { message: String },
}

impl VmError {
    fn compile(message: impl Into<String>) -> Self {
        VmError::Compile {
            message: message.into(),
        }
    }

    fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime {
            message: message.into(),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::Compile { message } => write!(f, "compile error: {message}"),
            VmError::Runtime { message } => write!(f, "runtime error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

/// Nested name scopes. Resolution walks outward; a hit in an enclosing
/// non-global scope is recorded as a free variable of the current table,
/// which is what drives closure capture.
#[derive(Debug, Default)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    store: HashMap<String, Symbol>,
    num_definitions: usize,
    free_symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn new_enclosed(outer: SymbolTable) -> Self {
        SymbolTable {
            outer: Some(Box::new(outer)),
            ..SymbolTable::default()
        }
    }

    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.outer.is_none() {
            SymbolScope::Global
        } else {
            SymbolScope::Local
        };
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: self.num_definitions,
        };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    /// Index is the builtin's position in the registry, not a local slot.
    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Binds a function's own name inside its body without consuming a
    /// local slot or a capture.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        let symbol = self.outer.as_mut()?.resolve(name)?;
        if matches!(symbol.scope, SymbolScope::Global | SymbolScope::Builtin) {
            return Some(symbol);
        }
        Some(self.define_free(symbol))
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol {
            name: original.name,
            scope: SymbolScope::Free,
            index: self.free_symbols.len() - 1,
        };
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct EmittedInstruction {
    opcode: Op,
    position: usize,
}

#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

#[derive(Debug, Clone)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

pub struct Compiler {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
}

impl Compiler {
    pub fn new() -> Self {
        let mut symbol_table = SymbolTable::new();
        for (index, builtin) in BUILTINS.iter().enumerate() {
            symbol_table.define_builtin(index, builtin.name);
        }
        Self::new_with_state(symbol_table, Vec::new())
    }

    /// Reuse a symbol table and constants pool from an earlier compilation,
    /// so an interactive session accumulates state.
    pub fn new_with_state(symbol_table: SymbolTable, constants: Vec<Value>) -> Self {
        Compiler {
            constants,
            symbol_table,
            scopes: vec![CompilationScope::default()],
        }
    }

    pub fn into_state(self) -> (SymbolTable, Vec<Value>) {
        let Compiler {
            constants,
            mut symbol_table,
            ..
        } = self;
        // A compile error inside a function literal leaves the table
        // enclosed; unwind so reused state starts at the top level again.
        while let Some(outer) = symbol_table.outer.take() {
            symbol_table = *outer;
        }
        (symbol_table, constants)
    }

    pub fn compile(&mut self, program: &Program) -> Result<(), VmError> {
        for stmt in &program.statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.current_scope().instructions.clone(),
            constants: self.constants.clone(),
        }
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), VmError> {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop, &[]);
            }
            Stmt::Let { name, value, .. } => {
                // Defined before the value compiles, so a function literal
                // bound here can resolve its own name.
                let symbol = self.symbol_table.define(&name.name);
                self.compile_expr(value)?;
                match symbol.scope {
                    SymbolScope::Global => self.emit(Op::SetGlobal, &[symbol.index]),
                    _ => self.emit(Op::SetLocal, &[symbol.index]),
                };
            }
            Stmt::Return { value, .. } => {
                self.compile_expr(value)?;
                self.emit(Op::ReturnValue, &[]);
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), VmError> {
        for stmt in &block.statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), VmError> {
        match expr {
            Expr::Ident(ident) => {
                let symbol = self
                    .symbol_table
                    .resolve(&ident.name)
                    .ok_or_else(|| VmError::compile(format!("undefined variable: {}", ident.name)))?;
                self.load_symbol(&symbol);
            }
            Expr::Int { value, .. } => {
                let index = self.add_constant(Value::Integer(*value));
                self.emit(Op::Constant, &[index]);
            }
            Expr::Str { value, .. } => {
                let index = self.add_constant(Value::Str(Rc::new(value.clone())));
                self.emit(Op::Constant, &[index]);
            }
            Expr::Bool { value, .. } => {
                if *value {
                    self.emit(Op::True, &[]);
                } else {
                    self.emit(Op::False, &[]);
                }
            }
            Expr::Prefix { op, right, .. } => {
                self.compile_expr(right)?;
                match op {
                    PrefixOp::Bang => self.emit(Op::Bang, &[]),
                    PrefixOp::Minus => self.emit(Op::Minus, &[]),
                };
            }
            Expr::Infix {
                op, left, right, ..
            } => {
                // `<` reuses OpGreaterThan with the operands swapped.
                if *op == InfixOp::Lt {
                    self.compile_expr(right)?;
                    self.compile_expr(left)?;
                    self.emit(Op::GreaterThan, &[]);
                    return Ok(());
                }
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                match op {
                    InfixOp::Plus => self.emit(Op::Add, &[]),
                    InfixOp::Minus => self.emit(Op::Sub, &[]),
                    InfixOp::Asterisk => self.emit(Op::Mul, &[]),
                    InfixOp::Slash => self.emit(Op::Div, &[]),
                    InfixOp::Gt => self.emit(Op::GreaterThan, &[]),
                    InfixOp::Eq => self.emit(Op::Equal, &[]),
                    InfixOp::NotEq => self.emit(Op::NotEqual, &[]),
                    InfixOp::Lt => unreachable!("handled above"),
                };
            }
            Expr::If {
                condition,
                consequence,
                alternative,
                ..
            } => {
                self.compile_expr(condition)?;
                // Placeholder operands are back-patched once the target
                // position is known.
                let jump_not_truthy = self.emit(Op::JumpNotTruthy, &[9999]);
                self.compile_block(consequence)?;
                if self.last_instruction_is(Op::Pop) {
                    self.remove_last_pop();
                }
                let jump = self.emit(Op::Jump, &[9999]);
                let after_consequence = self.current_scope().instructions.len();
                self.change_operand(jump_not_truthy, after_consequence);
                match alternative {
                    None => {
                        self.emit(Op::Null, &[]);
                    }
                    Some(alternative) => {
                        self.compile_block(alternative)?;
                        if self.last_instruction_is(Op::Pop) {
                            self.remove_last_pop();
                        }
                    }
                }
                let after_alternative = self.current_scope().instructions.len();
                self.change_operand(jump, after_alternative);
            }
            Expr::Array { elements, .. } => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Op::Array, &[elements.len()]);
            }
            Expr::Hash { pairs, .. } => {
                // Sorted by stringified key so identical programs compile to
                // identical bytecode regardless of source pair order.
                let mut sorted: Vec<_> = pairs.iter().collect();
                sorted.sort_by_key(|(key, _)| key.to_string());
                for (key, value) in &sorted {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Op::Hash, &[sorted.len() * 2]);
            }
            Expr::Index { left, index, .. } => {
                self.compile_expr(left)?;
                self.compile_expr(index)?;
                self.emit(Op::Index, &[]);
            }
            Expr::Function(lit) => self.compile_function(lit)?,
            Expr::Call {
                function,
                arguments,
                ..
            } => {
                self.compile_expr(function)?;
                for argument in arguments {
                    self.compile_expr(argument)?;
                }
                self.emit(Op::Call, &[arguments.len()]);
            }
        }
        Ok(())
    }

    fn compile_function(&mut self, lit: &FunctionLit) -> Result<(), VmError> {
        self.enter_scope();
        if let Some(name) = &lit.name {
            self.symbol_table.define_function_name(name);
        }
        for parameter in &lit.parameters {
            self.symbol_table.define(&parameter.name);
        }
        self.compile_block(&lit.body)?;
        if self.last_instruction_is(Op::Pop) {
            self.replace_last_pop_with_return();
        }
        if !self.last_instruction_is(Op::ReturnValue) {
            self.emit(Op::Return, &[]);
        }
        let free_symbols = self.symbol_table.free_symbols.clone();
        let num_locals = self.symbol_table.num_definitions;
        let instructions = self.leave_scope();
        // Each captured value is loaded from the enclosing scope's point of
        // view, in recorded order, right before OpClosure consumes them.
        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }
        let func = CompiledFunction {
            instructions,
            num_locals,
            num_parameters: lit.parameters.len(),
        };
        let index = self.add_constant(Value::CompiledFunction(Rc::new(func)));
        self.emit(Op::Closure, &[index, free_symbols.len()]);
        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Op::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Op::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Op::GetBuiltin, &[symbol.index]),
            SymbolScope::Free => self.emit(Op::GetFree, &[symbol.index]),
            SymbolScope::Function => self.emit(Op::CurrentClosure, &[]),
        };
    }

    fn add_constant(&mut self, value: Value) -> usize {
        if let Some(index) = self
            .constants
            .iter()
            .position(|existing| existing == &value)
        {
            return index;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn emit(&mut self, op: Op, operands: &[usize]) -> usize {
        let instruction = make(op, operands);
        let position = self.add_instruction(&instruction);
        self.set_last_instruction(op, position);
        position
    }

    fn add_instruction(&mut self, instruction: &[u8]) -> usize {
        let scope = self.current_scope_mut();
        let position = scope.instructions.len();
        scope.instructions.extend(instruction);
        position
    }

    fn set_last_instruction(&mut self, opcode: Op, position: usize) {
        let scope = self.current_scope_mut();
        scope.previous_instruction = scope.last_instruction.take();
        scope.last_instruction = Some(EmittedInstruction { opcode, position });
    }

    fn last_instruction_is(&self, op: Op) -> bool {
        self.current_scope()
            .last_instruction
            .map_or(false, |last| last.opcode == op)
    }

    fn remove_last_pop(&mut self) {
        let scope = self.current_scope_mut();
        if let Some(last) = scope.last_instruction.take() {
            scope.instructions.0.truncate(last.position);
            scope.last_instruction = scope.previous_instruction.take();
        }
    }

    fn replace_instruction(&mut self, position: usize, new_instruction: &[u8]) {
        let instructions = &mut self.current_scope_mut().instructions.0;
        instructions[position..position + new_instruction.len()].copy_from_slice(new_instruction);
    }

    fn change_operand(&mut self, position: usize, operand: usize) {
        let byte = self.current_scope().instructions.0[position];
        let op = Op::try_from(byte).expect("back-patch target holds a known opcode");
        self.replace_instruction(position, &make(op, &[operand]));
    }

    fn replace_last_pop_with_return(&mut self) {
        let position = match self.current_scope().last_instruction {
            Some(last) => last.position,
            None => return,
        };
        self.replace_instruction(position, &make(Op::ReturnValue, &[]));
        if let Some(last) = self.current_scope_mut().last_instruction.as_mut() {
            last.opcode = Op::ReturnValue;
        }
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        let outer = mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self.scopes.pop().expect("enter_scope preceded leave_scope");
        let outer = self
            .symbol_table
            .outer
            .take()
            .expect("enclosed table has an outer");
        self.symbol_table = *outer;
        scope.instructions
    }

    fn current_scope(&self) -> &CompilationScope {
        self.scopes.last().expect("at least the main scope")
    }

    fn current_scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("at least the main scope")
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Frame {
    closure: Rc<Closure>,
    /// Index of the next byte to fetch.
    ip: usize,
    /// Stack slot where this frame's locals begin.
    base_pointer: usize,
}

pub type GlobalStore = Rc<RefCell<Vec<Value>>>;

pub fn new_globals_store() -> GlobalStore {
    Rc::new(RefCell::new(vec![Value::Null; GLOBALS_SIZE]))
}

pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    /// Next free stack slot. The slot at `sp` survives a pop untouched,
    /// which is what `last_popped_stack_elem` reads.
    sp: usize,
    globals: GlobalStore,
    frames: Vec<Frame>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Self::new_with_global_store(bytecode, new_globals_store())
    }

    pub fn new_with_global_store(bytecode: Bytecode, globals: GlobalStore) -> Self {
        let main_fn = Rc::new(CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        });
        let main_closure = Rc::new(Closure {
            func: main_fn,
            free: Vec::new(),
        });
        let mut frames = Vec::with_capacity(MAX_FRAMES);
        frames.push(Frame {
            closure: main_closure,
            ip: 0,
            base_pointer: 0,
        });
        Vm {
            constants: bytecode.constants,
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames,
        }
    }

    pub fn last_popped_stack_elem(&self) -> Value {
        self.stack[self.sp].clone()
    }

    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            let frame = self.frames.last().ok_or(VmError::StackUnderflow)?;
            let func = Rc::clone(&frame.closure.func);
            let ip = frame.ip;
            let ins = func.instructions.as_bytes();
            if ip >= ins.len() {
                return Ok(());
            }
            let op = Op::try_from(ins[ip]).map_err(|err| VmError::runtime(err.to_string()))?;
            let operands = ip + 1;
            let width: usize = op.definition().operand_widths.iter().sum();
            self.current_frame_mut().ip = operands + width;
            match op {
                Op::Constant => {
                    let index = read_u16(&ins[operands..]) as usize;
                    let value = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or_else(|| VmError::runtime(format!("undefined constant: {index}")))?;
                    self.push(value)?;
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div => {
                    self.execute_binary_operation(op)?;
                }
                Op::True => self.push(Value::Boolean(true))?,
                Op::False => self.push(Value::Boolean(false))?,
                Op::Null => self.push(Value::Null)?,
                Op::Equal | Op::NotEqual | Op::GreaterThan => {
                    self.execute_comparison(op)?;
                }
                Op::Minus => {
                    let operand = self.pop()?;
                    match operand {
                        Value::Integer(value) => self.push(Value::Integer(value.wrapping_neg()))?,
                        other => {
                            return Err(VmError::runtime(format!(
                                "unsupported type for negation: {}",
                                other.kind()
                            )))
                        }
                    }
                }
                Op::Bang => {
                    let operand = self.pop()?;
                    self.push(Value::Boolean(!operand.is_truthy()))?;
                }
                Op::Jump => {
                    let target = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip = target;
                }
                Op::JumpNotTruthy => {
                    let target = read_u16(&ins[operands..]) as usize;
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = target;
                    }
                }
                Op::GetGlobal => {
                    let index = read_u16(&ins[operands..]) as usize;
                    let value = self.globals.borrow()[index].clone();
                    self.push(value)?;
                }
                Op::SetGlobal => {
                    let index = read_u16(&ins[operands..]) as usize;
                    let value = self.pop()?;
                    self.globals.borrow_mut()[index] = value;
                }
                Op::GetLocal => {
                    let index = read_u8(&ins[operands..]) as usize;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.stack[base_pointer + index].clone();
                    self.push(value)?;
                }
                Op::SetLocal => {
                    let index = read_u8(&ins[operands..]) as usize;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.pop()?;
                    self.stack[base_pointer + index] = value;
                }
                Op::GetBuiltin => {
                    let index = read_u8(&ins[operands..]) as usize;
                    let builtin = BUILTINS
                        .get(index)
                        .ok_or_else(|| VmError::runtime(format!("undefined builtin: {index}")))?;
                    self.push(Value::Builtin(builtin))?;
                }
                Op::GetFree => {
                    let index = read_u8(&ins[operands..]) as usize;
                    let value = self.current_frame().closure.free[index].clone();
                    self.push(value)?;
                }
                Op::CurrentClosure => {
                    let closure = Rc::clone(&self.current_frame().closure);
                    self.push(Value::Closure(closure))?;
                }
                Op::Array => {
                    let count = read_u16(&ins[operands..]) as usize;
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    self.push(Value::Array(Rc::new(elements)))?;
                }
                Op::Hash => {
                    let count = read_u16(&ins[operands..]) as usize;
                    let hash = self.build_hash(self.sp - count, self.sp)?;
                    self.sp -= count;
                    self.push(hash)?;
                }
                Op::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.execute_index_expression(left, index)?;
                }
                Op::Call => {
                    let num_args = read_u8(&ins[operands..]) as usize;
                    self.execute_call(num_args)?;
                }
                Op::ReturnValue => {
                    let return_value = self.pop()?;
                    if self.return_from_frame(return_value)? {
                        return Ok(());
                    }
                }
                Op::Return => {
                    if self.return_from_frame(Value::Null)? {
                        return Ok(());
                    }
                }
                Op::Closure => {
                    let index = read_u16(&ins[operands..]) as usize;
                    let num_free = read_u8(&ins[operands + 2..]) as usize;
                    self.push_closure(index, num_free)?;
                }
            }
        }
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("main frame always present")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("main frame always present")
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.sp >= STACK_SIZE {
            return Err(VmError::runtime("stack overflow"));
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        if self.sp == 0 {
            return Err(VmError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    fn execute_binary_operation(&mut self, op: Op) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match (&left, &right) {
            (Value::Integer(left), Value::Integer(right)) => {
                self.execute_binary_integer_operation(op, *left, *right)
            }
            (Value::Str(left), Value::Str(right)) => {
                if op != Op::Add {
                    return Err(VmError::runtime(format!(
                        "unknown string operator: {}",
                        op.definition().name
                    )));
                }
                let mut joined = String::with_capacity(left.len() + right.len());
                joined.push_str(left);
                joined.push_str(right);
                self.push(Value::Str(Rc::new(joined)))
            }
            _ => Err(VmError::runtime(format!(
                "unsupported types for binary operation: {} {}",
                left.kind(),
                right.kind()
            ))),
        }
    }

    fn execute_binary_integer_operation(
        &mut self,
        op: Op,
        left: i64,
        right: i64,
    ) -> Result<(), VmError> {
        let result = match op {
            Op::Add => left.wrapping_add(right),
            Op::Sub => left.wrapping_sub(right),
            Op::Mul => left.wrapping_mul(right),
            Op::Div => {
                if right == 0 {
                    return Err(VmError::runtime("division by zero"));
                }
                left.wrapping_div(right)
            }
            _ => {
                return Err(VmError::runtime(format!(
                    "unknown integer operator: {}",
                    op.definition().name
                )))
            }
        };
        self.push(Value::Integer(result))
    }

    fn execute_comparison(&mut self, op: Op) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        if let (Value::Integer(left), Value::Integer(right)) = (&left, &right) {
            return self.execute_integer_comparison(op, *left, *right);
        }
        match op {
            Op::Equal => self.push(Value::Boolean(left == right)),
            Op::NotEqual => self.push(Value::Boolean(left != right)),
            _ => Err(VmError::runtime(format!(
                "unknown operator: {} ({} {})",
                op.definition().name,
                left.kind(),
                right.kind()
            ))),
        }
    }

    fn execute_integer_comparison(
        &mut self,
        op: Op,
        left: i64,
        right: i64,
    ) -> Result<(), VmError> {
        let result = match op {
            Op::Equal => left == right,
            Op::NotEqual => left != right,
            Op::GreaterThan => left > right,
            _ => {
                return Err(VmError::runtime(format!(
                    "unknown operator: {}",
                    op.definition().name
                )))
            }
        };
        self.push(Value::Boolean(result))
    }

    fn build_hash(&self, start: usize, end: usize) -> Result<Value, VmError> {
        let mut pairs = IndexMap::new();
        let mut index = start;
        while index < end {
            let key = self.stack[index].clone();
            let value = self.stack[index + 1].clone();
            let hash_key = key
                .hash_key()
                .ok_or_else(|| VmError::runtime(format!("unusable as hash key: {}", key.kind())))?;
            pairs.insert(hash_key, HashPair { key, value });
            index += 2;
        }
        Ok(Value::Hash(Rc::new(pairs)))
    }

    fn execute_index_expression(&mut self, left: Value, index: Value) -> Result<(), VmError> {
        match (&left, &index) {
            (Value::Array(elements), Value::Integer(position)) => {
                let max = elements.len() as i64 - 1;
                if *position < 0 || *position > max {
                    self.push(Value::Null)
                } else {
                    self.push(elements[*position as usize].clone())
                }
            }
            (Value::Hash(pairs), _) => {
                let key = index.hash_key().ok_or_else(|| {
                    VmError::runtime(format!("unusable as hash key: {}", index.kind()))
                })?;
                match pairs.get(&key) {
                    Some(pair) => self.push(pair.value.clone()),
                    None => self.push(Value::Null),
                }
            }
            _ => Err(VmError::runtime(format!(
                "index operator not supported: {}",
                left.kind()
            ))),
        }
    }

    fn execute_call(&mut self, num_args: usize) -> Result<(), VmError> {
        let callee = self.stack[self.sp - 1 - num_args].clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, num_args),
            Value::Builtin(builtin) => self.call_builtin(builtin, num_args),
            _ => Err(VmError::runtime("calling non-function and non-built-in")),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, num_args: usize) -> Result<(), VmError> {
        if num_args != closure.func.num_parameters {
            return Err(VmError::runtime(format!(
                "wrong number of arguments: want={}, got={}",
                closure.func.num_parameters, num_args
            )));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::runtime(format!(
                "stack overflow: maximum call depth {MAX_FRAMES} exceeded"
            )));
        }
        let base_pointer = self.sp - num_args;
        // The arguments already sit in the first parameter slots; the rest
        // of the locals hole is reserved by bumping sp.
        if base_pointer + closure.func.num_locals > STACK_SIZE {
            return Err(VmError::runtime("stack overflow"));
        }
        self.sp = base_pointer + closure.func.num_locals;
        self.frames.push(Frame {
            closure,
            ip: 0,
            base_pointer,
        });
        Ok(())
    }

    fn call_builtin(&mut self, builtin: &'static Builtin, num_args: usize) -> Result<(), VmError> {
        let args = self.stack[self.sp - num_args..self.sp].to_vec();
        let result = (builtin.func)(&args);
        // Drop the arguments and the builtin slot, then push the result,
        // error values included.
        self.sp = self.sp - num_args - 1;
        self.push(result)
    }

    /// Returns true when the popped frame was the outermost one, which ends
    /// the run with the value left in the echo slot.
    fn return_from_frame(&mut self, value: Value) -> Result<bool, VmError> {
        let frame = self.frames.pop().ok_or(VmError::StackUnderflow)?;
        if self.frames.is_empty() {
            self.push(value)?;
            self.sp -= 1;
            return Ok(true);
        }
        self.sp = frame.base_pointer - 1;
        self.push(value)?;
        Ok(false)
    }

    fn push_closure(&mut self, const_index: usize, num_free: usize) -> Result<(), VmError> {
        let constant = self
            .constants
            .get(const_index)
            .cloned()
            .ok_or_else(|| VmError::runtime(format!("undefined constant: {const_index}")))?;
        let func = match constant {
            Value::CompiledFunction(func) => func,
            other => {
                return Err(VmError::runtime(format!(
                    "not a function: {}",
                    other.kind()
                )))
            }
        };
        let free = self.stack[self.sp - num_free..self.sp].to_vec();
        self.sp -= num_free;
        self.push(Value::Closure(Rc::new(Closure { func, free })))
    }
}
