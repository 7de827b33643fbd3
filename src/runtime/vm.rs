use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::bytecode::opcode::OpCode;
use crate::runtime::memory::{Allocator, LinearMemory, DEFAULT_MEMORY};
use crate::runtime::runtime_error::{ErrorRecord, RuntimeError};
use crate::runtime::syscall;
use crate::runtime::value::{Value, ValueIter};
use crate::runtime::vfs::Vfs;

/// Fixed capacity of the indirect-call function table.
const FUNCTION_TABLE_SIZE: usize = 1024;

/// String-cache bounds: interning is a performance detail, never
/// observable to the guest.
const STRING_CACHE_ENTRIES: usize = 256;
const STRING_CACHE_ENTRY_BYTES: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub max_memory: usize,
    pub stack_size: usize,
    pub max_call_depth: usize,
    pub ramfs: bool,
    pub validate: bool,
    pub debug: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_memory: DEFAULT_MEMORY,
            stack_size: 10_000,
            max_call_depth: 1000,
            ramfs: false,
            validate: true,
            debug: false,
        }
    }
}

/// Handler registration: where to jump and how deep the operand stack was
/// when the guarded region was entered.
struct TryEntry {
    handler_pc: usize,
    sp: usize,
}

#[derive(Debug, Default)]
pub struct Module {
    pub exports: HashMap<String, Value>,
}

/// The bytecode virtual machine.
///
/// One `Vm` owns everything a program touches: the operand stack, the
/// frame chain, linear memory with its allocator, the handle table, the
/// function table, and the module registry. All of it dies with the Vm;
/// nothing is process-global.
pub struct Vm {
    pub(crate) code: Vec<u8>,
    pub(crate) pc: usize,
    pub(crate) stack: Vec<Value>,
    frames: Vec<HashMap<String, Value>>,
    call_stack: Vec<usize>,
    try_stack: Vec<TryEntry>,
    pub(crate) memory: LinearMemory,
    pub(crate) allocator: Allocator,
    pub(crate) vfs: Vfs,
    function_table: Vec<Value>,
    modules: HashMap<String, Module>,
    string_cache: HashMap<(usize, usize), String>,
    pub(crate) config: VmConfig,
    pub(crate) running: bool,
    pub(crate) exit_code: Option<i32>,
    pub(crate) skip_atexit: bool,
    pub(crate) atexit_fns: Vec<Value>,
    pub(crate) quick_exit_fns: Vec<Value>,
    error_stack: Vec<ErrorRecord>,
    pub(crate) out: Box<dyn Write>,
    pub(crate) rng_state: u64,
}

impl Vm {
    pub fn new(code: Vec<u8>, config: VmConfig) -> Self {
        Self::with_output(code, config, Box::new(std::io::stdout()))
    }

    pub fn with_output(code: Vec<u8>, config: VmConfig, out: Box<dyn Write>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15)
            | 1;
        Vm {
            pc: 0,
            stack: Vec::with_capacity(config.stack_size),
            frames: vec![HashMap::new()],
            call_stack: Vec::new(),
            try_stack: Vec::new(),
            memory: LinearMemory::new(config.max_memory),
            allocator: Allocator::new(config.max_memory),
            vfs: Vfs::new(config.ramfs),
            function_table: vec![Value::Null; FUNCTION_TABLE_SIZE],
            modules: HashMap::new(),
            string_cache: HashMap::new(),
            running: false,
            exit_code: None,
            skip_atexit: false,
            atexit_fns: Vec::new(),
            quick_exit_fns: Vec::new(),
            error_stack: Vec::new(),
            out,
            rng_state: seed,
            config,
            code,
        }
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn error_stack(&self) -> &[ErrorRecord] {
        &self.error_stack
    }

    /// Executes until HALT, an exit request, or the end of the stream.
    /// Returns the guest exit code; a fatal condition surfaces as Err
    /// after being recorded on the error stack.
    pub fn run(&mut self) -> Result<i32, RuntimeError> {
        self.running = true;
        while self.running && self.pc < self.code.len() {
            if let Err(e) = self.step() {
                let record = self.record_error();
                if self.config.debug {
                    log::debug!("fatal: {} record={:?}", e, record);
                }
                self.vfs.flush_all();
                return Err(e
                    .at(record.pc)
                    .with_call_stack(record.call_stack));
            }
        }
        self.run_exit_handlers();
        self.vfs.flush_all();
        Ok(self.exit_code.unwrap_or(0))
    }

    fn record_error(&mut self) -> ErrorRecord {
        let record = ErrorRecord {
            pc: self.pc,
            sp: self.stack.len(),
            call_stack: self.call_stack.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        self.error_stack.push(record.clone());
        record
    }

    /// atexit handlers run in reverse registration order on a clean halt.
    fn run_exit_handlers(&mut self) {
        if self.skip_atexit {
            return;
        }
        let handlers: Vec<Value> = self.atexit_fns.drain(..).collect();
        self.running = true;
        for handler in handlers.iter().rev() {
            if let Err(e) = self.call_function(handler, &[]) {
                log::warn!("atexit handler failed: {}", e);
            }
        }
        self.running = false;
    }

    // ── Stack and frame primitives ───────────────────────────────────

    pub(crate) fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.config.stack_size {
            return Err(RuntimeError::new(format!(
                "operand stack overflow (capacity {})",
                self.config.stack_size
            )));
        }
        self.stack.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::new("operand stack underflow"))
    }

    /// Name resolution walks frames top to bottom; the bottom frame is
    /// the global scope.
    fn lookup(&self, name: &str) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(v) = frame.get(name) {
                return Some(v.clone());
            }
        }
        None
    }

    /// Writes always target the topmost frame.
    fn store(&mut self, name: String, value: Value) {
        if let Some(top) = self.frames.last_mut() {
            top.insert(name, value);
        }
    }

    // ── Operand fetch ────────────────────────────────────────────────

    fn fetch_byte(&mut self) -> Result<u8, RuntimeError> {
        let b = *self
            .code
            .get(self.pc)
            .ok_or_else(|| RuntimeError::new("truncated instruction stream"))?;
        self.pc += 1;
        Ok(b)
    }

    fn fetch_i32(&mut self) -> Result<i32, RuntimeError> {
        if self.pc + 4 > self.code.len() {
            return Err(RuntimeError::new("truncated integer operand"));
        }
        let v = i32::from_be_bytes([
            self.code[self.pc],
            self.code[self.pc + 1],
            self.code[self.pc + 2],
            self.code[self.pc + 3],
        ]);
        self.pc += 4;
        Ok(v)
    }

    /// Length-prefixed name operand, decoded through the bounded cache.
    fn fetch_name(&mut self) -> Result<String, RuntimeError> {
        let key_offset = self.pc;
        let len = self.fetch_byte()? as usize;
        if self.pc + len > self.code.len() {
            return Err(RuntimeError::new("truncated name operand"));
        }
        if let Some(cached) = self.string_cache.get(&(key_offset, len)) {
            self.pc += len;
            return Ok(cached.clone());
        }
        let s = String::from_utf8_lossy(&self.code[self.pc..self.pc + len]).into_owned();
        self.pc += len;
        if self.string_cache.len() < STRING_CACHE_ENTRIES && s.len() <= STRING_CACHE_ENTRY_BYTES {
            self.string_cache.insert((key_offset, len), s.clone());
        }
        Ok(s)
    }

    fn jump_to(&mut self, target: i32) -> Result<(), RuntimeError> {
        if target < 0 || target as usize > self.code.len() {
            return Err(RuntimeError::new(format!("jump target {} out of range", target)));
        }
        self.pc = target as usize;
        Ok(())
    }

    // ── Calls ────────────────────────────────────────────────────────

    fn call_bytecode(&mut self, offset: usize) -> Result<(), RuntimeError> {
        if offset > self.code.len() {
            return Err(RuntimeError::new(format!(
                "call target {} outside the instruction stream",
                offset
            )));
        }
        if self.call_stack.len() >= self.config.max_call_depth {
            return Err(RuntimeError::new(format!(
                "stack overflow: call depth exceeded ({})",
                self.config.max_call_depth
            )));
        }
        self.call_stack.push(self.pc);
        self.frames.push(HashMap::new());
        self.pc = offset;
        Ok(())
    }

    pub(crate) fn call_value(&mut self, target: Value) -> Result<(), RuntimeError> {
        match target {
            Value::Function(offset) => self.call_bytecode(offset),
            Value::HostFn(id) => syscall::dispatch(self, id),
            v if v.is_numeric() => self.call_bytecode(v.coerce_i64() as usize),
            other => Err(RuntimeError::new(format!(
                "call target is not callable: {}",
                other.type_name()
            ))),
        }
    }

    /// Runs a guest or host function to completion from inside a syscall
    /// (comparators, atexit handlers). Returns the function's result, or
    /// Null when it pushed nothing.
    pub(crate) fn call_function(
        &mut self,
        target: &Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let base = self.stack.len();
        match target {
            Value::HostFn(id) => {
                for arg in args {
                    self.push(arg.clone())?;
                }
                self.push(Value::Int(args.len() as i32))?;
                syscall::dispatch(self, *id)?;
            }
            _ => {
                for arg in args {
                    self.push(arg.clone())?;
                }
                let depth = self.call_stack.len();
                self.call_value(target.clone())?;
                while self.running && self.call_stack.len() > depth && self.pc < self.code.len()
                {
                    self.step()?;
                }
            }
        }
        if self.stack.len() > base {
            self.pop()
        } else {
            Ok(Value::Null)
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn step(&mut self) -> Result<(), RuntimeError> {
        let at = self.pc;
        let byte = self.fetch_byte()?;
        let op = OpCode::from_u8(byte)
            .ok_or_else(|| RuntimeError::new(format!("invalid opcode 0x{:02X}", byte)).at(at))?;

        if self.config.debug {
            log::debug!("pc={:04} sp={} {}", at, self.stack.len(), op.name());
        }

        match op {
            OpCode::Halt => {
                self.running = false;
            }
            OpCode::PushInt => {
                let v = self.fetch_i32()?;
                self.push(Value::Int(v))?;
            }
            OpCode::PushStr => {
                let s = self.fetch_name()?;
                self.push(Value::Str(s))?;
            }
            OpCode::PushNull => self.push(Value::Null)?,
            OpCode::Syscall => {
                let id = self.fetch_byte()?;
                syscall::dispatch(self, id)?;
            }
            OpCode::Store => {
                let name = self.fetch_name()?;
                let v = self.pop()?;
                self.store(name, v);
            }
            OpCode::Load => {
                let name = self.fetch_name()?;
                match self.lookup(&name) {
                    Some(v) => self.push(v)?,
                    None => {
                        log::warn!("load of undefined name '{}'", name);
                        self.push(Value::Null)?;
                    }
                }
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                self.arithmetic(op)?;
            }
            OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor | OpCode::Shl | OpCode::Shr => {
                self.bitwise(op)?;
            }
            OpCode::BitNot => {
                let a = self.pop()?;
                let result = match a {
                    Value::Long(n) => Value::Long(!n),
                    other => Value::Int(!other.coerce_i32()),
                };
                self.push(result)?;
            }

            OpCode::Eq | OpCode::Ne | OpCode::Lt | OpCode::Gt | OpCode::Le | OpCode::Ge => {
                self.compare(op)?;
            }
            OpCode::LogicalAnd => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Int((a.truthy() && b.truthy()) as i32))?;
            }
            OpCode::LogicalOr => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Int((a.truthy() || b.truthy()) as i32))?;
            }
            OpCode::LogicalNot => {
                let a = self.pop()?;
                self.push(Value::Int(!a.truthy() as i32))?;
            }

            OpCode::Jmp => {
                let target = self.fetch_i32()?;
                self.jump_to(target)?;
            }
            OpCode::Jz => {
                let target = self.fetch_i32()?;
                let v = self.pop()?;
                if !v.truthy() {
                    self.jump_to(target)?;
                }
            }
            OpCode::Jnz => {
                let target = self.fetch_i32()?;
                let v = self.pop()?;
                if v.truthy() {
                    self.jump_to(target)?;
                }
            }
            OpCode::Jgt => {
                let target = self.fetch_i32()?;
                let b = self.pop()?;
                let a = self.pop()?;
                if a.coerce_f64() > b.coerce_f64() {
                    self.jump_to(target)?;
                }
            }
            OpCode::Jlt => {
                let target = self.fetch_i32()?;
                let b = self.pop()?;
                let a = self.pop()?;
                if a.coerce_f64() < b.coerce_f64() {
                    self.jump_to(target)?;
                }
            }

            OpCode::Call => {
                let name = self.fetch_name()?;
                if name.is_empty() {
                    let target = self.pop()?;
                    self.call_value(target)?;
                } else {
                    match self.lookup(&name) {
                        Some(target) => self.call_value(target)?,
                        None => {
                            return Err(RuntimeError::new(format!(
                                "call to undefined function '{}'",
                                name
                            )));
                        }
                    }
                }
            }
            OpCode::Ret => {
                match self.call_stack.pop() {
                    Some(return_pc) => {
                        if self.frames.len() > 1 {
                            self.frames.pop();
                        }
                        self.pc = return_pc;
                    }
                    // Stray top-level RET halts cleanly.
                    None => self.running = false,
                }
            }

            OpCode::ForIter => {
                let target = self.fetch_i32()?;
                self.for_iter(target)?;
            }
            OpCode::TryEnter => {
                let target = self.fetch_i32()?;
                self.try_stack.push(TryEntry {
                    handler_pc: target as usize,
                    sp: self.stack.len(),
                });
            }
            OpCode::TryExit => {
                self.try_stack.pop();
            }
            OpCode::Raise => {
                let value = self.pop()?;
                match self.try_stack.pop() {
                    Some(entry) => {
                        self.stack.truncate(entry.sp);
                        self.push(value)?;
                        self.pc = entry.handler_pc;
                    }
                    None => {
                        eprintln!("Unhandled exception: {}", value);
                        self.exit_code = Some(1);
                        self.running = false;
                    }
                }
            }

            OpCode::Dup => {
                let v = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| RuntimeError::new("operand stack underflow"))?;
                self.push(v)?;
            }
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            OpCode::Over => {
                if self.stack.len() < 2 {
                    return Err(RuntimeError::new("operand stack underflow"));
                }
                let v = self.stack[self.stack.len() - 2].clone();
                self.push(v)?;
            }
            OpCode::Rot => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(c)?;
                self.push(a)?;
            }

            OpCode::I32ToI64 => {
                let v = self.pop()?;
                debug_assert!(matches!(v, Value::Int(_)), "I32_TO_I64 on {}", v.type_name());
                self.push(Value::Long(v.coerce_i64()))?;
            }
            OpCode::I64ToI32 => {
                let v = self.pop()?;
                self.push(Value::Int(v.coerce_i64() as i32))?;
            }
            OpCode::I32ToF64 | OpCode::I64ToF64 => {
                let v = self.pop()?;
                self.push(Value::Float(v.coerce_i64() as f64))?;
            }
            OpCode::F64ToI32 => {
                let v = self.pop()?;
                self.push(Value::Int(v.coerce_f64() as i32))?;
            }
            OpCode::F64ToI64 => {
                let v = self.pop()?;
                self.push(Value::Long(v.coerce_f64() as i64))?;
            }
            OpCode::F32ToF64 => {
                let v = self.pop()?;
                self.push(Value::Float(v.coerce_f64()))?;
            }
            OpCode::F64ToF32 => {
                let v = self.pop()?;
                self.push(Value::Float(v.coerce_f64() as f32 as f64))?;
            }
            OpCode::ToString => {
                let v = self.pop()?;
                self.push(Value::Str(v.to_string()))?;
            }
            OpCode::ToInt => {
                let v = self.pop()?;
                self.push(Value::Int(v.coerce_i32()))?;
            }

            // Typed comparisons narrow through the declared variant; a
            // mismatch is a debug assertion, not a runtime branch.
            OpCode::I32Eqz => {
                let a = self.pop_typed_i32(op)?;
                self.push(Value::Int((a == 0) as i32))?;
            }
            OpCode::I32Eq | OpCode::I32Ne | OpCode::I32LtS | OpCode::I32GtS | OpCode::I32LeS
            | OpCode::I32GeS => {
                let b = self.pop_typed_i32(op)?;
                let a = self.pop_typed_i32(op)?;
                let r = match op {
                    OpCode::I32Eq => a == b,
                    OpCode::I32Ne => a != b,
                    OpCode::I32LtS => a < b,
                    OpCode::I32GtS => a > b,
                    OpCode::I32LeS => a <= b,
                    _ => a >= b,
                };
                self.push(Value::Int(r as i32))?;
            }
            OpCode::I32LtU | OpCode::I32GtU | OpCode::I32LeU | OpCode::I32GeU => {
                let b = self.pop_typed_i32(op)? as u32;
                let a = self.pop_typed_i32(op)? as u32;
                let r = match op {
                    OpCode::I32LtU => a < b,
                    OpCode::I32GtU => a > b,
                    OpCode::I32LeU => a <= b,
                    _ => a >= b,
                };
                self.push(Value::Int(r as i32))?;
            }
            OpCode::I64Eqz => {
                let a = self.pop_typed_i64(op)?;
                self.push(Value::Int((a == 0) as i32))?;
            }
            OpCode::I64Eq | OpCode::I64Ne | OpCode::I64LtS | OpCode::I64GtS | OpCode::I64LeS
            | OpCode::I64GeS => {
                let b = self.pop_typed_i64(op)?;
                let a = self.pop_typed_i64(op)?;
                let r = match op {
                    OpCode::I64Eq => a == b,
                    OpCode::I64Ne => a != b,
                    OpCode::I64LtS => a < b,
                    OpCode::I64GtS => a > b,
                    OpCode::I64LeS => a <= b,
                    _ => a >= b,
                };
                self.push(Value::Int(r as i32))?;
            }
            OpCode::F32Eq | OpCode::F32Ne | OpCode::F32Lt | OpCode::F32Gt | OpCode::F32Le
            | OpCode::F32Ge => {
                let b = self.pop_typed_f64(op)? as f32;
                let a = self.pop_typed_f64(op)? as f32;
                let r = match op {
                    OpCode::F32Eq => a == b,
                    OpCode::F32Ne => a != b,
                    OpCode::F32Lt => a < b,
                    OpCode::F32Gt => a > b,
                    OpCode::F32Le => a <= b,
                    _ => a >= b,
                };
                self.push(Value::Int(r as i32))?;
            }
            OpCode::F64Eq | OpCode::F64Ne | OpCode::F64Lt | OpCode::F64Gt | OpCode::F64Le
            | OpCode::F64Ge => {
                let b = self.pop_typed_f64(op)?;
                let a = self.pop_typed_f64(op)?;
                let r = match op {
                    OpCode::F64Eq => a == b,
                    OpCode::F64Ne => a != b,
                    OpCode::F64Lt => a < b,
                    OpCode::F64Gt => a > b,
                    OpCode::F64Le => a <= b,
                    _ => a >= b,
                };
                self.push(Value::Int(r as i32))?;
            }

            OpCode::ModuleExport => {
                let name = self.fetch_name()?;
                let value = self.pop()?;
                let (module, symbol) = split_module_name(&name);
                self.modules
                    .entry(module.to_string())
                    .or_default()
                    .exports
                    .insert(symbol.to_string(), value);
            }
            OpCode::ModuleImport => {
                let name = self.fetch_name()?;
                self.modules.entry(name).or_default();
            }
            OpCode::ModuleGet => {
                let name = self.fetch_name()?;
                let (module, symbol) = split_module_name(&name);
                let value = self
                    .modules
                    .get(module)
                    .and_then(|m| m.exports.get(symbol))
                    .cloned();
                match value {
                    Some(v) => self.push(v)?,
                    None => {
                        log::warn!("module symbol '{}' not found", name);
                        self.push(Value::Null)?;
                    }
                }
            }

            OpCode::TableGet => {
                let index = self.pop()?.coerce_i64();
                let v = self.table_slot(index)?.clone();
                self.push(v)?;
            }
            OpCode::TableSet => {
                let index = self.pop()?.coerce_i64();
                let value = self.pop()?;
                *self.table_slot_mut(index)? = value;
            }
            OpCode::CallIndirect => {
                let index = self.pop()?.coerce_i64();
                let target = self.table_slot(index)?.clone();
                self.call_value(target)?;
            }

            OpCode::MemoryFill => {
                let count = self.pop()?.coerce_i64();
                let value = self.pop()?.coerce_i64();
                let addr = self.pop()?.coerce_i64();
                self.memory.fill(addr, value as u8, count)?;
            }
            OpCode::MemoryCopy => {
                let count = self.pop()?.coerce_i64();
                let src = self.pop()?.coerce_i64();
                let dst = self.pop()?.coerce_i64();
                self.memory.copy(dst, src, count)?;
            }
            OpCode::MemorySize => {
                let pages = self.memory.page_count();
                self.push(Value::Int(pages as i32))?;
            }
            OpCode::MemoryGrow => {
                let pages = self.pop()?.coerce_i64();
                let result = self.memory.grow(pages);
                self.push(Value::Int(result as i32))?;
            }

            OpCode::I32Load8 | OpCode::I32Load16 | OpCode::I32Load => {
                let width = match op {
                    OpCode::I32Load8 => 1,
                    OpCode::I32Load16 => 2,
                    _ => 4,
                };
                let addr = self.pop()?.coerce_i64();
                let v = self.memory.load_int(addr, width)?;
                self.push(Value::Int(v as i32))?;
            }
            OpCode::I64Load => {
                let addr = self.pop()?.coerce_i64();
                let v = self.memory.load_int(addr, 8)?;
                self.push(Value::Long(v))?;
            }
            OpCode::F32Load => {
                let addr = self.pop()?.coerce_i64();
                let v = self.memory.load_f32(addr)?;
                self.push(Value::Float(v))?;
            }
            OpCode::F64Load => {
                let addr = self.pop()?.coerce_i64();
                let v = self.memory.load_f64(addr)?;
                self.push(Value::Float(v))?;
            }
            OpCode::I32Store8 | OpCode::I32Store16 | OpCode::I32Store | OpCode::I64Store => {
                let width = match op {
                    OpCode::I32Store8 => 1,
                    OpCode::I32Store16 => 2,
                    OpCode::I32Store => 4,
                    _ => 8,
                };
                let value = self.pop()?.coerce_i64();
                let addr = self.pop()?.coerce_i64();
                self.memory.store_int(addr, width, value)?;
            }
            OpCode::F32Store => {
                let value = self.pop()?.coerce_f64();
                let addr = self.pop()?.coerce_i64();
                self.memory.store_f32(addr, value)?;
            }
            OpCode::F64Store => {
                let value = self.pop()?.coerce_f64();
                let addr = self.pop()?.coerce_i64();
                self.memory.store_f64(addr, value)?;
            }

            // Single-threaded: atomics are their plain counterparts.
            OpCode::AtomicLoad => {
                let addr = self.pop()?.coerce_i64();
                let v = self.memory.load_int(addr, 4)?;
                self.push(Value::Int(v as i32))?;
            }
            OpCode::AtomicStore => {
                let value = self.pop()?.coerce_i64();
                let addr = self.pop()?.coerce_i64();
                self.memory.store_int(addr, 4, value)?;
            }
            OpCode::AtomicAdd => {
                let value = self.pop()?.coerce_i64();
                let addr = self.pop()?.coerce_i64();
                let old = self.memory.load_int(addr, 4)?;
                self.memory
                    .store_int(addr, 4, (old as i32).wrapping_add(value as i32) as i64)?;
                self.push(Value::Int(old as i32))?;
            }

            OpCode::TypeOf => {
                let v = self.pop()?;
                self.push(Value::Str(v.type_name().to_string()))?;
            }
            OpCode::TypeCheck => {
                let name = self.fetch_name()?;
                let v = self.pop()?;
                self.push(Value::Int((v.type_name() == name) as i32))?;
            }
            OpCode::TypeCast => {
                let name = self.fetch_name()?;
                let v = self.pop()?;
                let cast = match name.as_str() {
                    "int" => Value::Int(v.coerce_i32()),
                    "long" | "bigint" => Value::Long(v.coerce_i64()),
                    "float" | "double" => Value::Float(v.coerce_f64()),
                    "string" | "str" => Value::Str(v.to_string()),
                    "bool" => Value::Int(v.truthy() as i32),
                    _ => {
                        log::warn!("cast to unknown type '{}'", name);
                        v
                    }
                };
                self.push(cast)?;
            }

            OpCode::ProfileStart | OpCode::ProfileEnd => {
                let label = self.fetch_name()?;
                log::debug!("{} {} at pc {}", op.name(), label, at);
            }
            OpCode::DebugTrace => {
                let label = self.fetch_name()?;
                log::debug!("trace '{}' pc={} sp={}", label, at, self.stack.len());
            }
            OpCode::Breakpoint => {
                log::debug!("breakpoint at pc {}", at);
            }

            OpCode::SetNew => self.push(Value::set(Vec::new()))?,
            OpCode::SetAdd => {
                let value = self.pop()?;
                let receiver = self.pop()?;
                if let Value::Set(items) = &receiver {
                    let mut items_ref = items.borrow_mut();
                    if !items_ref.iter().any(|v| v.loose_eq(&value)) {
                        items_ref.push(value);
                    }
                } else {
                    log::warn!("SET_ADD on {}", receiver.type_name());
                }
                self.push(receiver)?;
            }
            OpCode::DictNew => self.push(Value::dict(Vec::new()))?,
            OpCode::DictSet => {
                let value = self.pop()?;
                let key = self.pop()?;
                let receiver = self.pop()?;
                self.collection_set(&receiver, key, value)?;
                self.push(receiver)?;
            }
            OpCode::DictGet => {
                let key = self.pop()?;
                let receiver = self.pop()?;
                let v = self.collection_get(&receiver, &key)?;
                self.push(v)?;
            }
            OpCode::ListNew => self.push(Value::list(Vec::new()))?,
            OpCode::ListAppend => {
                let value = self.pop()?;
                let receiver = self.pop()?;
                if let Value::List(items) = &receiver {
                    items.borrow_mut().push(value);
                } else {
                    log::warn!("LIST_APPEND on {}", receiver.type_name());
                }
                self.push(receiver)?;
            }
            OpCode::ListShift => {
                let receiver = self.pop()?;
                let v = match &receiver {
                    Value::List(items) => {
                        let mut items = items.borrow_mut();
                        if items.is_empty() {
                            Value::Null
                        } else {
                            items.remove(0)
                        }
                    }
                    _ => Value::Null,
                };
                self.push(v)?;
            }
            OpCode::ListPop => {
                let receiver = self.pop()?;
                let v = match &receiver {
                    Value::List(items) => items.borrow_mut().pop().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                self.push(v)?;
            }

            OpCode::Malloc => {
                let n = self.pop()?.coerce_i64();
                let addr = self.allocator.malloc(n)?;
                self.push(Value::Int(addr))?;
            }
            OpCode::Free => {
                let addr = self.pop()?.coerce_i64();
                self.allocator.free(addr);
            }
            OpCode::ReadAddr => {
                let width = self.fetch_byte()? as usize;
                let addr = self.pop()?.coerce_i64();
                let v = match width {
                    8 => Value::Long(self.memory.load_int(addr, 8)?),
                    w => Value::Int(self.memory.load_int(addr, w)? as i32),
                };
                self.push(v)?;
            }
            OpCode::WriteAddr => {
                let width = self.fetch_byte()? as usize;
                let value = self.pop()?.coerce_i64();
                let addr = self.pop()?.coerce_i64();
                self.memory.store_int(addr, width, value)?;
            }
            OpCode::AddrOf => {
                // Identifier values are addresses in this model: ADDR_OF
                // is a load that expects an integer.
                let name = self.fetch_name()?;
                let v = self.lookup(&name).unwrap_or(Value::Null);
                debug_assert!(
                    v.is_numeric() || matches!(v, Value::Null),
                    "ADDR_OF of non-address {}",
                    v.type_name()
                );
                self.push(v)?;
            }
        }
        Ok(())
    }

    // ── Opcode families ──────────────────────────────────────────────

    fn pop_typed_i32(&mut self, op: OpCode) -> Result<i32, RuntimeError> {
        let v = self.pop()?;
        debug_assert!(matches!(v, Value::Int(_)), "{} on {}", op.name(), v.type_name());
        Ok(v.coerce_i32())
    }

    fn pop_typed_i64(&mut self, op: OpCode) -> Result<i64, RuntimeError> {
        let v = self.pop()?;
        debug_assert!(
            matches!(v, Value::Int(_) | Value::Long(_)),
            "{} on {}",
            op.name(),
            v.type_name()
        );
        Ok(v.coerce_i64())
    }

    fn pop_typed_f64(&mut self, op: OpCode) -> Result<f64, RuntimeError> {
        let v = self.pop()?;
        debug_assert!(v.is_numeric(), "{} on {}", op.name(), v.type_name());
        Ok(v.coerce_f64())
    }

    /// Integer ops truncate (32-bit two's complement), float ops keep
    /// full precision. Strings and lists concatenate under ADD.
    fn arithmetic(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;

        if op == OpCode::Add {
            if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
                let mut s = x.clone();
                s.push_str(y);
                return self.push(Value::Str(s));
            }
            if let (Value::List(x), Value::List(y)) = (&a, &b) {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().cloned());
                return self.push(Value::list(items));
            }
        }

        let result = if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
            let x = a.coerce_f64();
            let y = b.coerce_f64();
            Value::Float(match op {
                OpCode::Add => x + y,
                OpCode::Sub => x - y,
                OpCode::Mul => x * y,
                OpCode::Div => x / y,
                _ => x % y,
            })
        } else if matches!(a, Value::Long(_)) || matches!(b, Value::Long(_)) {
            let x = a.coerce_i64();
            let y = b.coerce_i64();
            match op {
                OpCode::Add => Value::Long(x.wrapping_add(y)),
                OpCode::Sub => Value::Long(x.wrapping_sub(y)),
                OpCode::Mul => Value::Long(x.wrapping_mul(y)),
                OpCode::Div | OpCode::Mod if y == 0 => {
                    log::warn!("division by zero yields 0");
                    Value::Long(0)
                }
                OpCode::Div => Value::Long(x.wrapping_div(y)),
                _ => Value::Long(x.wrapping_rem(y)),
            }
        } else {
            let x = a.coerce_i32();
            let y = b.coerce_i32();
            match op {
                OpCode::Add => Value::Int(x.wrapping_add(y)),
                OpCode::Sub => Value::Int(x.wrapping_sub(y)),
                OpCode::Mul => Value::Int(x.wrapping_mul(y)),
                OpCode::Div | OpCode::Mod if y == 0 => {
                    log::warn!("division by zero yields 0");
                    Value::Int(0)
                }
                OpCode::Div => Value::Int(x.wrapping_div(y)),
                _ => Value::Int(x.wrapping_rem(y)),
            }
        };
        self.push(result)
    }

    fn bitwise(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let wide = matches!(a, Value::Long(_)) || matches!(b, Value::Long(_));
        let x = a.coerce_i64();
        let y = b.coerce_i64();
        let result = if wide {
            match op {
                OpCode::BitAnd => x & y,
                OpCode::BitOr => x | y,
                OpCode::BitXor => x ^ y,
                OpCode::Shl => x.wrapping_shl(y as u32),
                _ => x.wrapping_shr(y as u32),
            }
        } else {
            let x = x as i32;
            let y = y as i32;
            (match op {
                OpCode::BitAnd => x & y,
                OpCode::BitOr => x | y,
                OpCode::BitXor => x ^ y,
                OpCode::Shl => x.wrapping_shl(y as u32),
                _ => x.wrapping_shr(y as u32),
            }) as i64
        };
        self.push(if wide {
            Value::Long(result)
        } else {
            Value::Int(result as i32)
        })
    }

    fn compare(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        use std::cmp::Ordering;
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match op {
            OpCode::Eq => a.loose_eq(&b),
            OpCode::Ne => !a.loose_eq(&b),
            OpCode::Lt => a.loose_cmp(&b) == Some(Ordering::Less),
            OpCode::Gt => a.loose_cmp(&b) == Some(Ordering::Greater),
            OpCode::Le => matches!(a.loose_cmp(&b), Some(Ordering::Less | Ordering::Equal)),
            _ => matches!(a.loose_cmp(&b), Some(Ordering::Greater | Ordering::Equal)),
        };
        self.push(Value::Int(result as i32))
    }

    /// FOR_ITER: the top of stack is either an iterator (advance it) or a
    /// sequence (converted to an iterator in place, then advanced). When
    /// exhausted, the iterator is popped and control branches to the
    /// target.
    fn for_iter(&mut self, target: i32) -> Result<(), RuntimeError> {
        let top_is_iter = matches!(self.stack.last(), Some(Value::Iter(_)));
        if !top_is_iter {
            let v = self.pop()?;
            let items = v.iteration_items().unwrap_or_else(|| {
                log::warn!("FOR_ITER over non-iterable {}", v.type_name());
                Vec::new()
            });
            self.push(Value::Iter(Rc::new(std::cell::RefCell::new(ValueIter {
                items: Rc::new(items),
                index: 0,
            }))))?;
        }

        let next = match self.stack.last() {
            Some(Value::Iter(iter)) => iter.borrow_mut().next(),
            _ => None,
        };
        match next {
            Some(v) => self.push(v)?,
            None => {
                self.pop()?;
                self.jump_to(target)?;
            }
        }
        Ok(())
    }

    fn table_slot(&self, index: i64) -> Result<&Value, RuntimeError> {
        if index < 0 || index as usize >= self.function_table.len() {
            return Err(RuntimeError::new(format!(
                "function table index {} out of range",
                index
            )));
        }
        Ok(&self.function_table[index as usize])
    }

    fn table_slot_mut(&mut self, index: i64) -> Result<&mut Value, RuntimeError> {
        if index < 0 || index as usize >= self.function_table.len() {
            return Err(RuntimeError::new(format!(
                "function table index {} out of range",
                index
            )));
        }
        Ok(&mut self.function_table[index as usize])
    }

    /// Index/key read shared by lists, dicts, sets, and strings. A bad
    /// list index is an addressing error and fails the program.
    pub(crate) fn collection_get(
        &self,
        receiver: &Value,
        key: &Value,
    ) -> Result<Value, RuntimeError> {
        match receiver {
            Value::List(items) | Value::Set(items) => {
                let items = items.borrow();
                let index = normalize_index(key.coerce_i64(), items.len()).ok_or_else(|| {
                    RuntimeError::new(format!(
                        "index {} out of bounds for length {}",
                        key.coerce_i64(),
                        items.len()
                    ))
                })?;
                Ok(items[index].clone())
            }
            Value::Dict(entries) => {
                let entries = entries.borrow();
                for (k, v) in entries.iter() {
                    if k.loose_eq(key) {
                        return Ok(v.clone());
                    }
                }
                log::warn!("key {} not found", key.repr());
                Ok(Value::Null)
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let index = normalize_index(key.coerce_i64(), chars.len()).ok_or_else(|| {
                    RuntimeError::new(format!(
                        "string index {} out of bounds for length {}",
                        key.coerce_i64(),
                        chars.len()
                    ))
                })?;
                Ok(Value::Str(chars[index].to_string()))
            }
            other => {
                log::warn!("indexing into {}", other.type_name());
                Ok(Value::Null)
            }
        }
    }

    pub(crate) fn collection_set(
        &self,
        receiver: &Value,
        key: Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match receiver {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let index = normalize_index(key.coerce_i64(), len).ok_or_else(|| {
                    RuntimeError::new(format!(
                        "index {} out of bounds for length {}",
                        key.coerce_i64(),
                        len
                    ))
                })?;
                items[index] = value;
                Ok(())
            }
            Value::Dict(entries) => {
                let mut entries = entries.borrow_mut();
                for (k, v) in entries.iter_mut() {
                    if k.loose_eq(&key) {
                        *v = value;
                        return Ok(());
                    }
                }
                entries.push((key, value));
                Ok(())
            }
            other => {
                log::warn!("index assignment into {}", other.type_name());
                Ok(())
            }
        }
    }

    pub(crate) fn next_random(&mut self) -> u64 {
        // xorshift64
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }
}

fn split_module_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((module, symbol)) => (module, symbol),
        None => ("main", name),
    }
}

/// Python-style index normalization (negative counts from the end).
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let index = if index < 0 { index + len as i64 } else { index };
    if index >= 0 && (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compiler::Compiler;
    use crate::frontend::lexer::Lexer;
    use crate::runtime::memory::PAGE_SIZE;
    use std::cell::RefCell;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn compile_src(source: &str) -> Vec<u8> {
        let mut lexer = Lexer::new(source, true);
        let tokens = lexer.tokenize().expect("lex");
        Compiler::new(tokens).compile().expect("compile")
    }

    /// Compile, run with a captured output sink, return (stdout, exit).
    fn run_source(source: &str) -> (String, i32) {
        let code = compile_src(source);
        let buf = SharedBuf::default();
        let config = VmConfig {
            ramfs: true,
            ..VmConfig::default()
        };
        let mut vm = Vm::with_output(code, config, Box::new(buf.clone()));
        let exit = vm.run().expect("run");
        (buf.contents(), exit)
    }

    /// Tiny assembler for opcode-level tests.
    struct Asm {
        code: Vec<u8>,
    }

    impl Asm {
        fn new() -> Self {
            Asm { code: Vec::new() }
        }
        fn op(mut self, op: OpCode) -> Self {
            self.code.push(op as u8);
            self
        }
        fn i32(mut self, v: i32) -> Self {
            self.code.extend_from_slice(&v.to_be_bytes());
            self
        }
        fn byte(mut self, b: u8) -> Self {
            self.code.push(b);
            self
        }
        fn name(mut self, s: &str) -> Self {
            self.code.push(s.len() as u8);
            self.code.extend_from_slice(s.as_bytes());
            self
        }
        fn push_int(self, v: i32) -> Self {
            self.op(OpCode::PushInt).i32(v)
        }
        fn halt(self) -> Self {
            self.op(OpCode::Halt)
        }
        fn build(self) -> Vec<u8> {
            self.code
        }
    }

    fn run_asm(code: Vec<u8>) -> Vm {
        run_asm_config(code, VmConfig::default())
    }

    fn run_asm_config(code: Vec<u8>, config: VmConfig) -> Vm {
        let mut vm = Vm::with_output(code, config, Box::new(SharedBuf::default()));
        vm.run().expect("run");
        vm
    }

    fn run_asm_err(code: Vec<u8>) -> RuntimeError {
        let mut vm = Vm::new(code, VmConfig::default());
        vm.run().expect_err("expected a fatal error")
    }

    // ── End-to-end scenarios ─────────────────────────────────────────

    #[test]
    fn test_scenario_hello() {
        let (out, exit) = run_source("def main():\n    print(\"hi\")\n");
        assert_eq!(out, "hi\n");
        assert_eq!(exit, 0);
    }

    #[test]
    fn test_scenario_try_except() {
        let code = compile_src("try:\n    raise 7\nexcept e:\n    print(e)\n");
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(code, VmConfig::default(), Box::new(buf.clone()));
        vm.run().unwrap();
        assert_eq!(buf.contents(), "7\n");
        assert!(vm.stack().is_empty(), "handler must leave the stack balanced");
    }

    #[test]
    fn test_scenario_for_over_range() {
        let (out, _) = run_source("for i in range(3):\n    print(i)\n");
        assert_eq!(out, "0\n1\n2\n");
    }

    #[test]
    fn test_scenario_malloc_free_reuse() {
        let (out, _) = run_source("p = malloc(16)\nfree(p)\nq = malloc(16)\nprint(p == q)\n");
        assert_eq!(out, "1\n");
    }

    #[test]
    fn test_scenario_constant_fold_runs() {
        let (out, _) = run_source("print(2 + 3 * 4)\n");
        assert_eq!(out, "14\n");
    }

    #[test]
    fn test_scenario_bounds_error() {
        let max = VmConfig::default().max_memory as i32;
        let err = run_asm_err(
            Asm::new()
                .push_int(max - 3)
                .op(OpCode::I32Load)
                .halt()
                .build(),
        );
        assert!(err.message.contains("out of bounds"), "got: {}", err.message);
    }

    // ── Arithmetic properties ────────────────────────────────────────

    #[test]
    fn test_add_wraps_two_complement() {
        let vm = run_asm(Asm::new().push_int(i32::MAX).push_int(1).op(OpCode::Add).halt().build());
        assert_eq!(vm.stack(), &[Value::Int(i32::MIN)]);
    }

    #[test]
    fn test_arithmetic_against_host_semantics() {
        let pairs = [
            (7, 3),
            (-7, 3),
            (0, 9),
            (i32::MAX, i32::MAX),
            (i32::MIN, -1),
            (1234567, -89),
        ];
        for (a, b) in pairs {
            let cases: [(OpCode, i32); 5] = [
                (OpCode::Add, a.wrapping_add(b)),
                (OpCode::Sub, a.wrapping_sub(b)),
                (OpCode::Mul, a.wrapping_mul(b)),
                (OpCode::Div, if b == 0 { 0 } else { a.wrapping_div(b) }),
                (OpCode::Mod, if b == 0 { 0 } else { a.wrapping_rem(b) }),
            ];
            for (op, expected) in cases {
                let vm = run_asm(Asm::new().push_int(a).push_int(b).op(op).halt().build());
                assert_eq!(vm.stack(), &[Value::Int(expected)], "{:?} {} {}", op, a, b);
            }
        }
    }

    #[test]
    fn test_division_by_zero_yields_zero() {
        let vm = run_asm(Asm::new().push_int(5).push_int(0).op(OpCode::Div).halt().build());
        assert_eq!(vm.stack(), &[Value::Int(0)]);
        let vm = run_asm(Asm::new().push_int(5).push_int(0).op(OpCode::Mod).halt().build());
        assert_eq!(vm.stack(), &[Value::Int(0)]);
    }

    #[test]
    fn test_bitwise_and_shifts() {
        let cases: [(OpCode, i32, i32, i32); 5] = [
            (OpCode::BitAnd, 0b1100, 0b1010, 0b1000),
            (OpCode::BitOr, 0b1100, 0b1010, 0b1110),
            (OpCode::BitXor, 0b1100, 0b1010, 0b0110),
            (OpCode::Shl, 1, 4, 16),
            (OpCode::Shr, -8, 1, -4),
        ];
        for (op, a, b, expected) in cases {
            let vm = run_asm(Asm::new().push_int(a).push_int(b).op(op).halt().build());
            assert_eq!(vm.stack(), &[Value::Int(expected)], "{:?}", op);
        }
    }

    #[test]
    fn test_string_concat_under_add() {
        let code = Asm::new()
            .op(OpCode::PushStr)
            .name("foo")
            .op(OpCode::PushStr)
            .name("bar")
            .op(OpCode::Add)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Str("foobar".to_string())]);
    }

    // ── Control flow ─────────────────────────────────────────────────

    #[test]
    fn test_raise_unwinds_to_recorded_sp() {
        // One value below the try region; two pushed inside; after the
        // raise the stack is the recorded height plus the raised value.
        let code = Asm::new()
            .push_int(11) // survives
            .op(OpCode::TryEnter)
            .i32(27) // handler offset
            .push_int(1)
            .push_int(2)
            .push_int(99)
            .op(OpCode::Raise)
            .halt() // skipped
            .halt() // handler (offset 27)
            .build();
        assert_eq!(code[27], OpCode::Halt as u8);
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(11), Value::Int(99)]);
    }

    #[test]
    fn test_unhandled_raise_exits_nonzero() {
        let code = Asm::new().push_int(3).op(OpCode::Raise).halt().build();
        let mut vm = Vm::with_output(code, VmConfig::default(), Box::new(SharedBuf::default()));
        assert_eq!(vm.run().unwrap(), 1);
    }

    #[test]
    fn test_try_exit_disarms_handler() {
        let code = Asm::new()
            .op(OpCode::TryEnter)
            .i32(100) // never taken
            .op(OpCode::TryExit)
            .push_int(5)
            .op(OpCode::Raise)
            .halt()
            .build();
        let mut vm = Vm::with_output(code, VmConfig::default(), Box::new(SharedBuf::default()));
        assert_eq!(vm.run().unwrap(), 1, "raise after TRY_EXIT is unhandled");
    }

    #[test]
    fn test_for_iter_consumes_list_exactly_k_times() {
        let (out, _) = run_source("for x in [5, 6, 7]:\n    print(x)\n");
        assert_eq!(out, "5\n6\n7\n");
    }

    #[test]
    fn test_for_iter_balances_stack() {
        let code = compile_src("for i in range(4):\n    x = i\n");
        let mut vm = Vm::with_output(code, VmConfig::default(), Box::new(SharedBuf::default()));
        vm.run().unwrap();
        assert!(vm.stack().is_empty());
    }

    #[test]
    fn test_for_iter_over_string_chars() {
        let (out, _) = run_source("for c in \"ab\":\n    print(c)\n");
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn test_call_and_return() {
        let (out, _) = run_source("def add(a, b):\n    return a + b\ndef main():\n    print(add(2, 3))\n");
        assert_eq!(out, "5\n");
    }

    #[test]
    fn test_recursion_depth_limit() {
        let code = compile_src("def f():\n    f()\nf()\n");
        let config = VmConfig {
            max_call_depth: 16,
            ..VmConfig::default()
        };
        let mut vm = Vm::with_output(code, config, Box::new(SharedBuf::default()));
        let err = vm.run().expect_err("must exhaust call depth");
        assert!(err.message.contains("call depth"), "got: {}", err.message);
    }

    #[test]
    fn test_undefined_function_call_is_fatal() {
        let code = Asm::new().op(OpCode::Call).name("nope").halt().build();
        let err = run_asm_err(code);
        assert!(err.message.contains("undefined function"), "got: {}", err.message);
    }

    #[test]
    fn test_operand_stack_overflow_aborts() {
        let config = VmConfig {
            stack_size: 4,
            ..VmConfig::default()
        };
        let code = Asm::new()
            .push_int(1)
            .push_int(2)
            .push_int(3)
            .push_int(4)
            .push_int(5)
            .halt()
            .build();
        let mut vm = Vm::with_output(code, config, Box::new(SharedBuf::default()));
        let err = vm.run().expect_err("overflow");
        assert!(err.message.contains("stack overflow"), "got: {}", err.message);
    }

    // ── Frames and scoping ───────────────────────────────────────────

    #[test]
    fn test_lookup_falls_through_to_globals() {
        let (out, _) = run_source("x = 5\ndef f():\n    print(x)\nf()\n");
        assert_eq!(out, "5\n");
    }

    #[test]
    fn test_writes_target_top_frame() {
        let (out, _) = run_source("x = 1\ndef f():\n    x = 2\nf()\nprint(x)\n");
        assert_eq!(out, "1\n");
    }

    #[test]
    fn test_function_value_enables_indirect_call() {
        let (out, _) = run_source("def f():\n    return 9\ng = f\nprint(g())\n");
        assert_eq!(out, "9\n");
    }

    // ── Typed memory access ──────────────────────────────────────────

    #[test]
    fn test_typed_store_load_roundtrip() {
        let widths: [(OpCode, OpCode, i32); 4] = [
            (OpCode::I32Store8, OpCode::I32Load8, -2),
            (OpCode::I32Store16, OpCode::I32Load16, -30000),
            (OpCode::I32Store, OpCode::I32Load, 123456789),
            (OpCode::I32Store, OpCode::I32Load, -1),
        ];
        for (store, load, value) in widths {
            let code = Asm::new()
                .push_int(64)
                .push_int(value)
                .op(store)
                .push_int(64)
                .op(load)
                .halt()
                .build();
            let vm = run_asm(code);
            assert_eq!(vm.stack(), &[Value::Int(value)], "{:?}", store);
        }
    }

    #[test]
    fn test_i64_store_load() {
        let code = Asm::new()
            .push_int(8)
            .push_int(-7)
            .op(OpCode::I32ToI64)
            .op(OpCode::I64Store)
            .push_int(8)
            .op(OpCode::I64Load)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Long(-7)]);
    }

    #[test]
    fn test_memory_grow_and_size() {
        let vm = run_asm(Asm::new().push_int(1).op(OpCode::MemoryGrow).halt().build());
        let old_pages = (DEFAULT_MEMORY / PAGE_SIZE) as i32;
        assert_eq!(vm.stack(), &[Value::Int(old_pages)]);

        let vm = run_asm(Asm::new().op(OpCode::MemorySize).halt().build());
        assert_eq!(vm.stack(), &[Value::Int(old_pages)]);
    }

    #[test]
    fn test_memory_fill_and_copy() {
        let code = Asm::new()
            .push_int(0)
            .push_int(0xAB)
            .push_int(4)
            .op(OpCode::MemoryFill)
            .push_int(16) // dst
            .push_int(0) // src
            .push_int(4) // count
            .op(OpCode::MemoryCopy)
            .push_int(16)
            .op(OpCode::I32Load8)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(0xABu8 as i8 as i32)]);
    }

    #[test]
    fn test_malloc_opcode_and_free() {
        let code = Asm::new()
            .push_int(32)
            .op(OpCode::Malloc)
            .op(OpCode::Dup)
            .op(OpCode::Free)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack().len(), 1);
        let addr = vm.stack()[0].coerce_i64();
        assert!(addr >= (DEFAULT_MEMORY / 2) as i64);
    }

    #[test]
    fn test_atomic_add_returns_old_value() {
        let code = Asm::new()
            .push_int(0)
            .push_int(40)
            .op(OpCode::AtomicStore)
            .push_int(0)
            .push_int(2)
            .op(OpCode::AtomicAdd)
            .push_int(0)
            .op(OpCode::AtomicLoad)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(40), Value::Int(42)]);
    }

    // ── Collections, modules, tables ─────────────────────────────────

    #[test]
    fn test_list_opcodes() {
        let code = Asm::new()
            .op(OpCode::ListNew)
            .push_int(1)
            .op(OpCode::ListAppend)
            .push_int(2)
            .op(OpCode::ListAppend)
            .op(OpCode::ListShift)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(1)]);
    }

    #[test]
    fn test_set_add_deduplicates() {
        let code = Asm::new()
            .op(OpCode::SetNew)
            .push_int(5)
            .op(OpCode::SetAdd)
            .push_int(5)
            .op(OpCode::SetAdd)
            .halt()
            .build();
        let vm = run_asm(code);
        match &vm.stack()[0] {
            Value::Set(items) => assert_eq!(items.borrow().len(), 1),
            other => panic!("expected set, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_dict_set_get_through_source() {
        let (out, _) = run_source("d = {\"a\": 1};\nd[\"b\"] = 2\nprint(d[\"b\"])\n");
        assert_eq!(out, "2\n");
    }

    #[test]
    fn test_list_index_out_of_bounds_is_fatal() {
        let code = compile_src("xs = [1]\nprint(xs[5])\n");
        let mut vm = Vm::with_output(code, VmConfig::default(), Box::new(SharedBuf::default()));
        let err = vm.run().expect_err("bad index");
        assert!(err.message.contains("out of bounds"), "got: {}", err.message);
    }

    #[test]
    fn test_negative_index_counts_from_end() {
        let (out, _) = run_source("xs = [1, 2, 3]\nprint(xs[-1])\n");
        assert_eq!(out, "3\n");
    }

    #[test]
    fn test_module_export_and_get() {
        let code = Asm::new()
            .push_int(9)
            .op(OpCode::ModuleExport)
            .name("m.v")
            .op(OpCode::ModuleGet)
            .name("m.v")
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(9)]);
    }

    #[test]
    fn test_function_table_roundtrip() {
        let code = Asm::new()
            .push_int(7) // value
            .push_int(3) // index
            .op(OpCode::TableSet)
            .push_int(3)
            .op(OpCode::TableGet)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(7)]);
    }

    #[test]
    fn test_call_indirect_through_table() {
        // 0: JMP 11 | 5: PUSH_INT 123; RET | 11: main
        let code = Asm::new()
            .op(OpCode::Jmp)
            .i32(11)
            .push_int(123)
            .op(OpCode::Ret)
            .push_int(5) // function offset
            .push_int(0) // table index
            .op(OpCode::TableSet)
            .push_int(0)
            .op(OpCode::CallIndirect)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(123)]);
    }

    #[test]
    fn test_indirect_call_with_empty_name() {
        // 0: JMP 11 | 5: PUSH_INT 55; RET | 11: push target, CALL ""
        let code = Asm::new()
            .op(OpCode::Jmp)
            .i32(11)
            .push_int(55)
            .op(OpCode::Ret)
            .push_int(5)
            .op(OpCode::Call)
            .name("")
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(55)]);
    }

    // ── Conversions and type ops ─────────────────────────────────────

    #[test]
    fn test_conversion_chain() {
        let code = Asm::new()
            .push_int(7)
            .op(OpCode::I32ToF64)
            .op(OpCode::F64ToI64)
            .op(OpCode::I64ToI32)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(7)]);
    }

    #[test]
    fn test_to_string_and_to_int() {
        let code = Asm::new()
            .push_int(42)
            .op(OpCode::ToString)
            .op(OpCode::ToInt)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(42)]);
    }

    #[test]
    fn test_typed_i32_comparisons_signed_vs_unsigned() {
        // -1 < 1 signed, but 0xFFFFFFFF > 1 unsigned.
        let vm = run_asm(Asm::new().push_int(-1).push_int(1).op(OpCode::I32LtS).halt().build());
        assert_eq!(vm.stack(), &[Value::Int(1)]);
        let vm = run_asm(Asm::new().push_int(-1).push_int(1).op(OpCode::I32LtU).halt().build());
        assert_eq!(vm.stack(), &[Value::Int(0)]);
    }

    #[test]
    fn test_type_of_and_check() {
        let code = Asm::new()
            .push_int(1)
            .op(OpCode::TypeOf)
            .op(OpCode::PushStr)
            .name("x")
            .op(OpCode::TypeCheck)
            .name("string")
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(
            vm.stack(),
            &[Value::Str("int".to_string()), Value::Int(1)]
        );
    }

    #[test]
    fn test_type_cast() {
        let code = Asm::new()
            .op(OpCode::PushStr)
            .name("17")
            .op(OpCode::TypeCast)
            .name("int")
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(17)]);
    }

    // ── Fold/interpret equivalence (spec property) ───────────────────

    #[test]
    fn test_fold_matches_interpreter() {
        let pairs = [(13, 5), (-9, 4), (1000, -3), (7, 7), (i32::MAX, 2)];
        let ops: [(char, OpCode); 8] = [
            ('+', OpCode::Add),
            ('-', OpCode::Sub),
            ('*', OpCode::Mul),
            ('/', OpCode::Div),
            ('%', OpCode::Mod),
            ('&', OpCode::BitAnd),
            ('|', OpCode::BitOr),
            ('^', OpCode::BitXor),
        ];
        for (a, b) in pairs {
            for (symbol, op) in ops {
                // Folded path through the compiler...
                let src = format!("x = {} {} {}\n", a, symbol, b);
                let code = compile_src(&src);
                let mut vm =
                    Vm::with_output(code, VmConfig::default(), Box::new(SharedBuf::default()));
                vm.run().unwrap();
                let folded = vm.lookup("x").unwrap();
                // ...must equal the raw interpreter sequence.
                let vm = run_asm(Asm::new().push_int(a).push_int(b).op(op).halt().build());
                assert_eq!(vm.stack(), &[folded], "{} {} {}", a, symbol, b);
            }
        }
    }

    #[test]
    fn test_pointer_read_write_addr() {
        let code = Asm::new()
            .push_int(16)
            .push_int(77)
            .op(OpCode::WriteAddr)
            .byte(4)
            .push_int(16)
            .op(OpCode::ReadAddr)
            .byte(4)
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(77)]);
    }

    #[test]
    fn test_addr_of_loads_address_value() {
        let code = Asm::new()
            .push_int(4096)
            .op(OpCode::Store)
            .name("p")
            .op(OpCode::AddrOf)
            .name("p")
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(4096)]);
    }

    #[test]
    fn test_module_import_creates_registry_entry() {
        let code = Asm::new()
            .op(OpCode::ModuleImport)
            .name("ext")
            .op(OpCode::ModuleGet)
            .name("ext.missing")
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Null]);
    }

    #[test]
    fn test_profiling_markers_are_inert() {
        let code = Asm::new()
            .op(OpCode::ProfileStart)
            .name("hot")
            .push_int(1)
            .op(OpCode::DebugTrace)
            .name("mid")
            .op(OpCode::Breakpoint)
            .op(OpCode::ProfileEnd)
            .name("hot")
            .halt()
            .build();
        let vm = run_asm(code);
        assert_eq!(vm.stack(), &[Value::Int(1)]);
    }

    #[test]
    fn test_call_function_value_variants() {
        // 0: JMP 11 | 5: PUSH_INT 9; RET | 11: HALT
        let code = Asm::new()
            .op(OpCode::Jmp)
            .i32(11)
            .push_int(9)
            .op(OpCode::Ret)
            .halt()
            .build();
        let mut vm = Vm::with_output(code, VmConfig::default(), Box::new(SharedBuf::default()));
        vm.run().unwrap();

        vm.running = true;
        let guest = vm.call_function(&Value::Function(5), &[]).unwrap();
        assert_eq!(guest, Value::Int(9));

        // HostFn routes through the syscall layer (0xEF = str).
        let host = vm
            .call_function(&Value::HostFn(0xEF), &[Value::Int(3)])
            .unwrap();
        assert_eq!(host, Value::Str("3".to_string()));
    }

    // ── Error records ────────────────────────────────────────────────

    #[test]
    fn test_fatal_error_recorded_on_error_stack() {
        let code = Asm::new().push_int(-5).op(OpCode::I32Load).halt().build();
        let mut vm = Vm::new(code, VmConfig::default());
        assert!(vm.run().is_err());
        assert_eq!(vm.error_stack().len(), 1);
        assert!(vm.error_stack()[0].timestamp > 0);
    }
}
