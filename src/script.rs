//! Scripted reference kernels: a deterministic work-item machine that
//! executes a fixed op list per item. Stands in for a full instruction
//! interpreter so the device can be driven end to end, both by the demo
//! binary and by the test suite.

use crate::device::Event;
use crate::dim::{Dim, NDRange};
use crate::error::FatalError;
use crate::kernel::{Kernel, Program};
use crate::memory::{AddrSpace, Memory, VirtualMemory};
use crate::value::Variable;
use crate::work_group::WorkGroup;
use crate::work_item::{Frame, Instruction, SourceLoc, State, StepCtx, WorkItem};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum Action {
    /// Pure computation, no side effects beyond the opcode counter.
    Compute,
    Barrier,
    Call { function: String, target: usize },
    Ret,
    /// Read `size` bytes at `base + linear_global_id * stride`.
    Load {
        space: AddrSpace,
        base: u64,
        stride: u64,
        size: u64,
    },
    /// Write the item's linear global id at `base + linear_global_id * stride`.
    Store { space: AddrSpace, base: u64, stride: u64 },
}

/// One scripted instruction. A line of 0 means no debug information.
#[derive(Debug, Clone)]
pub struct Op {
    pub opcode: String,
    pub line: u64,
    pub action: Action,
}

impl Op {
    #[must_use]
    pub fn compute(opcode: &str, line: u64) -> Self {
        Self {
            opcode: opcode.to_string(),
            line,
            action: Action::Compute,
        }
    }
}

#[derive(Debug)]
pub struct ScriptProgram {
    id: u64,
    file: String,
    source: Option<String>,
    ops: Arc<Vec<Op>>,
}

impl ScriptProgram {
    #[must_use]
    pub fn new(id: u64, file: &str, source: Option<String>, ops: Vec<Op>) -> Self {
        Self {
            id,
            file: file.to_string(),
            source,
            ops: Arc::new(ops),
        }
    }
}

impl Program for ScriptProgram {
    fn id(&self) -> u64 {
        self.id
    }

    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

#[derive(Debug, Default)]
struct Counters {
    opcodes: Mutex<IndexMap<String, u64>>,
    steps: AtomicU64,
}

/// A kernel whose work-items all execute the same op list.
#[derive(Debug)]
pub struct ScriptKernel {
    name: String,
    program: ScriptProgram,
    args: Vec<(String, Variable)>,
    constant_data: Vec<u8>,
    constant_address: Option<u64>,
    fail_constant_allocation: bool,
    local_alloc: u64,
    private_buffers: Vec<Vec<u8>>,
    counters: Arc<Counters>,
    schedule: Arc<Mutex<Vec<Dim>>>,
}

impl ScriptKernel {
    #[must_use]
    pub fn new(name: &str, program: ScriptProgram) -> Self {
        Self {
            name: name.to_string(),
            program,
            args: Vec::new(),
            constant_data: Vec::new(),
            constant_address: None,
            fail_constant_allocation: false,
            local_alloc: 0,
            private_buffers: Vec::new(),
            counters: Arc::new(Counters::default()),
            schedule: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bind a named kernel argument, visible to every work-item.
    #[must_use]
    pub fn with_arg(mut self, name: &str, variable: Variable) -> Self {
        self.args.push((name.to_string(), variable));
        self
    }

    /// Initialize a constant buffer in global memory at launch.
    #[must_use]
    pub fn with_constant_data(mut self, data: Vec<u8>) -> Self {
        self.constant_data = data;
        self
    }

    #[must_use]
    pub fn with_failing_constants(mut self) -> Self {
        self.fail_constant_allocation = true;
        self
    }

    /// Give every work-group a local buffer of this many bytes.
    #[must_use]
    pub fn with_local_alloc(mut self, size: u64) -> Self {
        self.local_alloc = size;
        self
    }

    /// Give every work-item a pre-filled private buffer.
    #[must_use]
    pub fn with_private_buffer(mut self, data: Vec<u8>) -> Self {
        self.private_buffers.push(data);
        self
    }

    /// Group coordinates in instantiation order.
    #[must_use]
    pub fn schedule(&self) -> Vec<Dim> {
        self.schedule.lock().unwrap().clone()
    }

    /// Total number of work-item steps across the kernel.
    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.counters.steps.load(Ordering::Relaxed)
    }
}

impl Kernel for ScriptKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn program(&self) -> &dyn Program {
        &self.program
    }

    fn allocate_constants(&mut self, global: &mut dyn Memory) -> Result<(), FatalError> {
        if self.fail_constant_allocation {
            return Err(FatalError::new("failed to allocate constant buffer"));
        }
        if !self.constant_data.is_empty() {
            let address = global
                .alloc(self.constant_data.len() as u64)
                .map_err(|err| FatalError::new(err.to_string()))?;
            global
                .store(address, &self.constant_data)
                .map_err(|err| FatalError::new(err.to_string()))?;
            self.constant_address = Some(address);
        }
        Ok(())
    }

    fn deallocate_constants(&mut self, global: &mut dyn Memory) {
        if let Some(address) = self.constant_address.take() {
            let _ = global.free(address);
        }
    }

    fn create_group(&mut self, group_id: Dim, ndrange: &NDRange) -> Box<dyn WorkGroup> {
        self.schedule.lock().unwrap().push(group_id);
        Box::new(ScriptWorkGroup::new(
            group_id,
            ndrange,
            &self.name,
            Arc::clone(&self.program.ops),
            self.program.file.clone(),
            &self.args,
            self.local_alloc,
            &self.private_buffers,
            Arc::clone(&self.counters),
        ))
    }

    fn reset_instruction_counts(&mut self) {
        self.counters.opcodes.lock().unwrap().clear();
        self.counters.steps.store(0, Ordering::Relaxed);
    }

    fn instruction_counts(&self) -> Vec<(String, u64)> {
        self.counters
            .opcodes
            .lock()
            .unwrap()
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect()
    }
}

#[derive(Debug)]
pub struct ScriptWorkGroup {
    group_id: Dim,
    items: Vec<ScriptWorkItem>,
    local_memory: VirtualMemory,
    next_item: usize,
}

impl ScriptWorkGroup {
    #[allow(clippy::too_many_arguments)]
    fn new(
        group_id: Dim,
        ndrange: &NDRange,
        kernel_name: &str,
        ops: Arc<Vec<Op>>,
        file: String,
        args: &[(String, Variable)],
        local_alloc: u64,
        private_buffers: &[Vec<u8>],
        counters: Arc<Counters>,
    ) -> Self {
        let mut local_memory = VirtualMemory::new(AddrSpace::Local);
        if local_alloc > 0 {
            local_memory
                .alloc(local_alloc)
                .expect("local allocation fits the default capacity");
        }

        let items = ndrange
            .local_size
            .into_iter()
            .map(|local_id| {
                ScriptWorkItem::new(
                    group_id,
                    local_id,
                    ndrange,
                    kernel_name,
                    Arc::clone(&ops),
                    file.clone(),
                    args,
                    private_buffers,
                    Arc::clone(&counters),
                )
            })
            .collect();

        Self {
            group_id,
            items,
            local_memory,
            next_item: 0,
        }
    }
}

impl WorkGroup for ScriptWorkGroup {
    fn group_id(&self) -> Dim {
        self.group_id
    }

    fn next_ready_item(&mut self) -> Option<Dim> {
        let count = self.items.len();
        for offset in 0..count {
            let index = (self.next_item + offset) % count;
            if self.items[index].state == State::Ready {
                self.next_item = (index + 1) % count;
                return Some(self.items[index].local_id);
            }
        }
        None
    }

    fn has_barrier(&self) -> bool {
        self.items.iter().any(|item| item.state == State::Barrier)
    }

    fn clear_barrier(&mut self) {
        for item in &mut self.items {
            if item.state == State::Barrier {
                item.state = State::Ready;
            }
        }
    }

    fn local_memory(&self) -> &dyn Memory {
        &self.local_memory
    }

    fn local_memory_mut(&mut self) -> &mut dyn Memory {
        &mut self.local_memory
    }

    fn work_item(&self, local_id: Dim) -> Option<&dyn WorkItem> {
        self.items
            .iter()
            .find(|item| item.local_id == local_id)
            .map(|item| item as &dyn WorkItem)
    }

    fn work_item_mut(&mut self, local_id: Dim) -> Option<&mut dyn WorkItem> {
        self.items
            .iter_mut()
            .find(|item| item.local_id == local_id)
            .map(|item| item as &mut dyn WorkItem)
    }

    fn step_item(
        &mut self,
        local_id: Dim,
        global: &mut dyn Memory,
        events: &mut Vec<Event>,
    ) -> Result<State, FatalError> {
        let Self {
            items,
            local_memory,
            ..
        } = self;
        let item = items
            .iter_mut()
            .find(|item| item.local_id == local_id)
            .expect("work-item belongs to this group");
        let mut ctx = StepCtx {
            global,
            local: local_memory,
            events,
        };
        item.step(&mut ctx)
    }
}

#[derive(Debug)]
pub struct ScriptWorkItem {
    global_id: Dim,
    local_id: Dim,
    linear_global_id: u64,
    ops: Arc<Vec<Op>>,
    file: String,
    pc: usize,
    state: State,
    /// Return sites, outermost first.
    frames: Vec<Frame>,
    return_pcs: Vec<usize>,
    /// Signatures of the active functions, entry at the bottom.
    fn_stack: Vec<String>,
    private_memory: VirtualMemory,
    vars: HashMap<String, Variable>,
    counters: Arc<Counters>,
}

impl ScriptWorkItem {
    #[allow(clippy::too_many_arguments)]
    fn new(
        group_id: Dim,
        local_id: Dim,
        ndrange: &NDRange,
        kernel_name: &str,
        ops: Arc<Vec<Op>>,
        file: String,
        args: &[(String, Variable)],
        private_buffers: &[Vec<u8>],
        counters: Arc<Counters>,
    ) -> Self {
        let position = Dim::new(
            group_id.x * ndrange.local_size.x + local_id.x,
            group_id.y * ndrange.local_size.y + local_id.y,
            group_id.z * ndrange.local_size.z + local_id.z,
        );
        let global_id = Dim::new(
            position.x + ndrange.global_offset.x,
            position.y + ndrange.global_offset.y,
            position.z + ndrange.global_offset.z,
        );

        let mut private_memory = VirtualMemory::new(AddrSpace::Private);
        for data in private_buffers {
            let address = private_memory
                .alloc(data.len() as u64)
                .expect("private allocation fits the default capacity");
            private_memory
                .store(address, data)
                .expect("buffer just allocated");
        }

        Self {
            global_id,
            local_id,
            linear_global_id: position.linear_id(&ndrange.global_size),
            ops,
            file,
            pc: 0,
            state: State::Ready,
            frames: Vec::new(),
            return_pcs: Vec::new(),
            fn_stack: vec![format!("{kernel_name}()")],
            private_memory,
            vars: args.iter().cloned().collect(),
            counters,
        }
    }

    fn current_op(&self) -> Option<&Op> {
        self.ops.get(self.pc)
    }

    fn current_line(&self) -> u64 {
        self.current_op().map_or(0, |op| op.line)
    }
}

impl WorkItem for ScriptWorkItem {
    fn state(&self) -> State {
        self.state
    }

    fn step(&mut self, ctx: &mut StepCtx<'_>) -> Result<State, FatalError> {
        self.counters.steps.fetch_add(1, Ordering::Relaxed);
        if self.state != State::Ready {
            return Ok(self.state);
        }

        let Some(op) = self.ops.get(self.pc).cloned() else {
            self.state = State::Finished;
            return Ok(self.state);
        };
        *self
            .counters
            .opcodes
            .lock()
            .unwrap()
            .entry(op.opcode.clone())
            .or_insert(0) += 1;
        self.pc += 1;

        match op.action {
            Action::Compute => {}
            Action::Barrier => self.state = State::Barrier,
            Action::Call { function, target } => {
                self.frames.push(Frame {
                    signature: self.fn_stack.last().cloned().unwrap_or_default(),
                    line: op.line,
                });
                self.return_pcs.push(self.pc);
                self.fn_stack.push(function);
                self.pc = target;
            }
            Action::Ret => match self.return_pcs.pop() {
                Some(return_pc) => {
                    self.frames.pop();
                    if self.fn_stack.len() > 1 {
                        self.fn_stack.pop();
                    }
                    self.pc = return_pc;
                }
                None => self.state = State::Finished,
            },
            Action::Load {
                space,
                base,
                stride,
                size,
            } => {
                let address = base + self.linear_global_id * stride;
                let memory: &dyn Memory = match space {
                    AddrSpace::Global | AddrSpace::Constant => ctx.global,
                    AddrSpace::Local => ctx.local,
                    AddrSpace::Private => &self.private_memory,
                };
                let mut data = vec![0u8; size as usize];
                if memory.load(address, &mut data).is_err() {
                    ctx.events.push(Event::MemoryError {
                        read: true,
                        space,
                        address,
                        size,
                    });
                }
            }
            Action::Store { space, base, stride } => {
                let address = base + self.linear_global_id * stride;
                let data = (self.linear_global_id as u32).to_le_bytes();
                let memory: &mut dyn Memory = match space {
                    AddrSpace::Global | AddrSpace::Constant => ctx.global,
                    AddrSpace::Local => ctx.local,
                    AddrSpace::Private => &mut self.private_memory,
                };
                if memory.store(address, &data).is_err() {
                    ctx.events.push(Event::MemoryError {
                        read: false,
                        space,
                        address,
                        size: data.len() as u64,
                    });
                }
            }
        }

        if self.state == State::Ready && self.pc >= self.ops.len() {
            self.state = State::Finished;
        }
        Ok(self.state)
    }

    fn current_instruction(&self) -> Option<Instruction> {
        if self.state == State::Finished {
            return None;
        }
        let op = self.current_op()?;
        let loc = (op.line > 0).then(|| SourceLoc {
            file: self.file.clone(),
            line: op.line,
        });
        Some(Instruction {
            text: op.opcode.clone(),
            loc,
        })
    }

    fn current_frame(&self) -> Option<Frame> {
        if self.state == State::Finished {
            return None;
        }
        Some(Frame {
            signature: self.fn_stack.last().cloned().unwrap_or_default(),
            line: self.current_line(),
        })
    }

    fn call_stack(&self) -> Vec<Frame> {
        self.frames.clone()
    }

    fn global_id(&self) -> Dim {
        self.global_id
    }

    fn local_id(&self) -> Dim {
        self.local_id
    }

    fn get_variable(&self, name: &str) -> Option<Variable> {
        self.vars.get(name).cloned()
    }

    fn private_memory(&self) -> &dyn Memory {
        &self.private_memory
    }

    fn private_memory_mut(&mut self) -> &mut dyn Memory {
        &mut self.private_memory
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, Op, ScriptKernel, ScriptProgram};
    use crate::device::Event;
    use crate::dim::{Dim, NDRange};
    use crate::kernel::Kernel;
    use crate::memory::{AddrSpace, Memory, VirtualMemory};
    use crate::work_group::WorkGroup;
    use crate::work_item::State;
    use similar_asserts as diff;

    fn group_of(kernel: &mut ScriptKernel, local: u64) -> Box<dyn WorkGroup> {
        let ndrange = NDRange::new(1, Dim::new(local, 1, 1), Dim::ZERO, Dim::new(local, 1, 1));
        kernel.create_group(Dim::ZERO, &ndrange)
    }

    fn step(group: &mut dyn WorkGroup, local_id: Dim, global: &mut dyn Memory) -> State {
        let mut events = Vec::new();
        group
            .step_item(local_id, global, &mut events)
            .expect("scripted steps do not fail")
    }

    #[test]
    fn test_round_robin_is_deterministic() {
        let ops = vec![Op::compute("add", 1), Op::compute("add", 2)];
        let mut kernel =
            ScriptKernel::new("k", ScriptProgram::new(1, "k.cl", None, ops));
        let mut group = group_of(&mut kernel, 4);

        let order: Vec<_> = (0..5).map(|_| group.next_ready_item().unwrap().x).collect();
        diff::assert_eq!(have: order, want: vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_barrier_state_machine() {
        let ops = vec![
            Op::compute("add", 1),
            Op {
                opcode: "bar".to_string(),
                line: 2,
                action: Action::Barrier,
            },
            Op::compute("add", 3),
        ];
        let mut kernel =
            ScriptKernel::new("k", ScriptProgram::new(2, "k.cl", None, ops));
        let mut group = group_of(&mut kernel, 2);
        let mut global = VirtualMemory::new(AddrSpace::Global);

        for x in 0..2 {
            let local_id = Dim::new(x, 0, 0);
            assert_eq!(step(group.as_mut(), local_id, &mut global), State::Ready);
            assert_eq!(step(group.as_mut(), local_id, &mut global), State::Barrier);
        }
        assert!(group.next_ready_item().is_none());
        assert!(group.has_barrier());

        group.clear_barrier();
        assert!(!group.has_barrier());
        for x in 0..2 {
            let local_id = Dim::new(x, 0, 0);
            assert_eq!(step(group.as_mut(), local_id, &mut global), State::Finished);
        }
        assert!(group.next_ready_item().is_none());
    }

    #[test]
    fn test_invalid_load_raises_event() {
        let ops = vec![Op {
            opcode: "load".to_string(),
            line: 4,
            action: Action::Load {
                space: AddrSpace::Global,
                base: 0x100,
                stride: 0,
                size: 4,
            },
        }];
        let mut kernel =
            ScriptKernel::new("k", ScriptProgram::new(3, "k.cl", None, ops));
        let mut group = group_of(&mut kernel, 1);
        let mut global = VirtualMemory::new(AddrSpace::Global);

        let mut events = Vec::new();
        group
            .step_item(Dim::ZERO, &mut global, &mut events)
            .unwrap();
        assert!(matches!(
            events.as_slice(),
            [Event::MemoryError {
                read: true,
                space: AddrSpace::Global,
                address: 0x100,
                size: 4,
            }]
        ));
    }

    #[test]
    fn test_global_offset_applies_to_ids_only() {
        let ops = vec![Op {
            opcode: "store".to_string(),
            line: 1,
            action: Action::Store {
                space: AddrSpace::Global,
                base: 0x10,
                stride: 4,
            },
        }];
        let mut kernel =
            ScriptKernel::new("k", ScriptProgram::new(4, "k.cl", None, ops));
        let ndrange = NDRange::new(1, Dim::new(2, 1, 1), Dim::new(100, 0, 0), Dim::new(2, 1, 1));
        let mut group = kernel.create_group(Dim::ZERO, &ndrange);
        let mut global = VirtualMemory::new(AddrSpace::Global);
        global.alloc(8).unwrap();

        let item = group.work_item(Dim::new(1, 0, 0)).unwrap();
        diff::assert_eq!(have: item.global_id(), want: Dim::new(101, 0, 0));

        // stores still target the zero-based linear id
        step(group.as_mut(), Dim::new(1, 0, 0), &mut global);
        let mut word = [0u8; 4];
        global.load(0x14, &mut word).unwrap();
        diff::assert_eq!(have: u32::from_le_bytes(word), want: 1);
    }

    #[test]
    fn test_opcode_counters_aggregate_across_items() {
        let ops = vec![Op::compute("add", 1), Op::compute("mul", 2)];
        let mut kernel =
            ScriptKernel::new("k", ScriptProgram::new(5, "k.cl", None, ops));
        let mut group = group_of(&mut kernel, 3);
        let mut global = VirtualMemory::new(AddrSpace::Global);

        for x in 0..3 {
            let local_id = Dim::new(x, 0, 0);
            while step(group.as_mut(), local_id, &mut global) == State::Ready {}
        }
        diff::assert_eq!(
            have: kernel.instruction_counts(),
            want: vec![("add".to_string(), 3), ("mul".to_string(), 3)]
        );
    }
}
