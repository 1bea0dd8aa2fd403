use crate::device::Event;
use crate::dim::Dim;
use crate::error::FatalError;
use crate::memory::Memory;
use crate::value::Variable;

/// Per-lane execution state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    Ready,
    Barrier,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: String,
    pub line: u64,
}

/// A disassembled instruction with optional debug location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub text: String,
    pub loc: Option<SourceLoc>,
}

impl Instruction {
    /// Source line of the instruction, 0 when no debug info is attached.
    #[must_use]
    pub fn line(&self) -> u64 {
        self.loc.as_ref().map_or(0, |loc| loc.line)
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// A call frame as rendered in backtraces: `name(arg=value, ...)` plus the
/// source line of the frame's instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub signature: String,
    pub line: u64,
}

/// Everything a work-item may touch while stepping: the shared memories and
/// the diagnostic event queue drained by the device after the step.
pub struct StepCtx<'a> {
    pub global: &'a mut dyn Memory,
    pub local: &'a mut dyn Memory,
    pub events: &'a mut Vec<Event>,
}

/// One lane of data-parallel execution.
pub trait WorkItem: std::fmt::Debug {
    fn state(&self) -> State;

    /// Advance by one instruction, returning the new state.
    fn step(&mut self, ctx: &mut StepCtx<'_>) -> Result<State, FatalError>;

    /// The next instruction to execute, if any.
    fn current_instruction(&self) -> Option<Instruction>;

    /// The function frame currently executing.
    fn current_frame(&self) -> Option<Frame>;

    /// Call frames below the current function, outermost first.
    fn call_stack(&self) -> Vec<Frame>;

    fn global_id(&self) -> Dim;

    fn local_id(&self) -> Dim;

    fn get_variable(&self, name: &str) -> Option<Variable>;

    fn print_variable(&self, name: &str) -> Option<String> {
        self.get_variable(name).map(|variable| variable.to_string())
    }

    fn private_memory(&self) -> &dyn Memory;

    fn private_memory_mut(&mut self) -> &mut dyn Memory;
}
