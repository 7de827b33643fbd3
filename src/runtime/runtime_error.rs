/// Fatal VM condition: bounds violation, exhausted stack, undefined call.
///
/// Guest-level exceptions (RAISE) are not errors; they unwind through the
/// try-stack inside the dispatch loop. A `RuntimeError` terminates the
/// program.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub pc: Option<usize>,
    pub call_stack: Vec<usize>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.message)?;
        if let Some(pc) = self.pc {
            write!(f, " (pc {})", pc)?;
        }
        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;
            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: return to pc {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl RuntimeError {
    pub fn new(msg: impl Into<String>) -> Self {
        RuntimeError {
            message: msg.into(),
            pc: None,
            call_stack: Vec::new(),
        }
    }

    pub fn at(mut self, pc: usize) -> Self {
        self.pc = Some(pc);
        self
    }

    pub fn with_call_stack(mut self, call_stack: Vec<usize>) -> Self {
        self.call_stack = call_stack;
        self
    }
}

/// Snapshot pushed onto the VM's error stack when a fatal condition is
/// recorded: where it happened and what the control state looked like.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub pc: usize,
    pub sp: usize,
    pub call_stack: Vec<usize>,
    pub timestamp: u64,
}
