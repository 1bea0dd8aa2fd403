//! The virtual device: drives work-groups through a pending, running, done
//! lifecycle, one work-item current at a time, and hosts the interactive
//! debugger and the runtime error router over that schedule.

mod commands;
mod diagnostics;

pub use diagnostics::{Event, RaceEntity, RaceKind};

use crate::config::Config;
use crate::dim::{Dim, NDRange};
use crate::error::FatalError;
use crate::kernel::Kernel;
use crate::memory::{AddrSpace, Memory, VirtualMemory};
use crate::work_group::WorkGroup;
use crate::work_item::{State, WorkItem};
use console::style;
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;

pub struct Device {
    interactive: bool,
    show_inst_counts: bool,
    quick_mode: bool,

    global_memory: Box<dyn Memory>,
    diag: Box<dyn io::Write>,

    /// Breakpoints per program identity, id to source line. Ids come from a
    /// counter shared across programs and stay stable until deleted.
    breakpoints: HashMap<u64, BTreeMap<u32, u64>>,
    next_breakpoint: u32,

    // per-invocation state
    ndrange: NDRange,
    num_groups: Dim,
    program: Option<u64>,
    kernel_name: Option<String>,
    source_lines: Vec<String>,
    pending_groups: VecDeque<Dim>,
    running_groups: VecDeque<Box<dyn WorkGroup>>,
    instantiated: HashSet<Dim>,
    current_group: Option<Box<dyn WorkGroup>>,
    current_item: Option<Dim>,
    list_position: u64,
    last_break_line: u64,
    force_break: bool,
    running: bool,
    pending_events: Vec<Event>,
    /// The instruction that was executing when a pending event was raised;
    /// the item's counter has already moved past it.
    reporting_instruction: Option<crate::work_item::Instruction>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("kernel", &self.kernel_name)
            .field("ndrange", &self.ndrange)
            .field("pending_groups", &self.pending_groups.len())
            .field("running_groups", &self.running_groups.len())
            .field("current_group", &self.current_group.as_ref().map(|g| g.group_id()))
            .field("current_item", &self.current_item)
            .finish_non_exhaustive()
    }
}

impl Device {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_global_memory(config, Box::new(VirtualMemory::new(AddrSpace::Global)))
    }

    #[must_use]
    pub fn with_global_memory(config: Config, global_memory: Box<dyn Memory>) -> Self {
        Self {
            interactive: config.interactive,
            show_inst_counts: config.show_inst_counts,
            quick_mode: config.quick_mode,
            global_memory,
            diag: Box::new(io::stderr()),
            breakpoints: HashMap::new(),
            next_breakpoint: 1,
            ndrange: NDRange::default(),
            num_groups: Dim::ONE,
            program: None,
            kernel_name: None,
            source_lines: Vec::new(),
            pending_groups: VecDeque::new(),
            running_groups: VecDeque::new(),
            instantiated: HashSet::new(),
            current_group: None,
            current_item: None,
            list_position: 0,
            last_break_line: 0,
            force_break: false,
            running: false,
            pending_events: Vec::new(),
            reporting_instruction: None,
        }
    }

    /// Redirect diagnostic blocks away from stderr.
    pub fn set_diagnostic_sink(&mut self, sink: Box<dyn io::Write>) {
        self.diag = sink;
    }

    #[must_use]
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    #[must_use]
    pub fn shows_instruction_counts(&self) -> bool {
        self.show_inst_counts
    }

    #[must_use]
    pub fn global_memory(&self) -> &dyn Memory {
        self.global_memory.as_ref()
    }

    pub fn global_memory_mut(&mut self) -> &mut dyn Memory {
        self.global_memory.as_mut()
    }

    #[must_use]
    pub fn current_work_group(&self) -> Option<&dyn WorkGroup> {
        self.current_group.as_deref()
    }

    #[must_use]
    pub fn current_work_item(&self) -> Option<&dyn WorkItem> {
        let local_id = self.current_item?;
        self.current_group.as_ref()?.work_item(local_id)
    }

    pub(crate) fn current_state(&self) -> Option<State> {
        self.current_work_item().map(WorkItem::state)
    }

    /// Source line of the current work-item, 0 when unavailable.
    #[must_use]
    pub fn current_line_number(&self) -> u64 {
        match self.current_work_item() {
            Some(item) if item.state() != State::Finished => item
                .current_instruction()
                .map_or(0, |instruction| instruction.line()),
            _ => 0,
        }
    }

    /// Execute a kernel invocation to completion, or until the interactive
    /// session terminates it.
    pub fn run(&mut self, kernel: &mut dyn Kernel, ndrange: NDRange) {
        if !self.begin_invocation(kernel, ndrange) {
            return;
        }

        let result = if self.interactive {
            self.command_loop(kernel)
        } else {
            let result = self.cmd_continue(kernel, commands::lookup("continue"), &[]);
            self.running = false;
            result
        };
        if let Err(err) = result {
            self.report_fatal(&err);
        }

        self.finish_invocation(kernel);
    }

    pub(crate) fn begin_invocation(&mut self, kernel: &mut dyn Kernel, ndrange: NDRange) -> bool {
        assert!(
            self.running_groups.is_empty(),
            "work-groups left over from a previous invocation"
        );
        self.ndrange = ndrange;

        if let Err(err) = kernel.allocate_constants(self.global_memory.as_mut()) {
            self.report_fatal_setup(&err, kernel.name());
            return false;
        }

        self.num_groups = self.ndrange.num_groups();
        self.pending_groups.clear();
        self.instantiated.clear();
        if self.quick_mode {
            // only the first and the last group; when they coincide the
            // second dequeue finds the group already scheduled and skips it
            if self.num_groups.size() > 0 {
                let last = Dim::new(
                    self.num_groups.x - 1,
                    self.num_groups.y - 1,
                    self.num_groups.z - 1,
                );
                self.pending_groups.push_back(Dim::ZERO);
                self.pending_groups.push_back(last);
            }
        } else {
            self.pending_groups.extend(self.num_groups);
        }
        log::debug!(
            "{}: launching {} with {} groups of {} work-items",
            style("device").yellow(),
            kernel.name(),
            self.pending_groups.len(),
            self.ndrange.local_size.size(),
        );

        kernel.reset_instruction_counts();
        self.program = Some(kernel.program().id());
        self.kernel_name = Some(kernel.name().to_string());
        self.source_lines = if self.interactive {
            kernel
                .program()
                .source()
                .map(|source| source.lines().map(String::from).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        self.list_position = 0;
        self.current_group = None;
        self.current_item = None;
        self.force_break = false;
        self.global_memory.synchronize();
        self.next_work_item(kernel);
        true
    }

    pub(crate) fn finish_invocation(&mut self, kernel: &mut dyn Kernel) {
        // items drop with their groups, groups before global memory
        self.running_groups.clear();
        self.current_group = None;
        self.current_item = None;

        kernel.deallocate_constants(self.global_memory.as_mut());
        self.kernel_name = None;

        self.global_memory.synchronize();

        if self.show_inst_counts {
            print!(
                "{}",
                format_instruction_counts(kernel.name(), &kernel.instruction_counts())
            );
        }
    }

    fn command_loop(&mut self, kernel: &mut dyn Kernel) -> Result<(), FatalError> {
        use std::io::Write as _;

        self.running = true;
        println!();
        self.cmd_info(kernel, commands::lookup("info"), &[])?;

        let mut line = String::new();
        while self.running {
            print!("(oclgrind) ");
            let _ = io::stdout().flush();

            line.clear();
            let eof = matches!(io::stdin().read_line(&mut line), Ok(0) | Err(_));
            if eof {
                println!("(quit)");
                self.cmd_quit(kernel, commands::lookup("quit"), &[])?;
                break;
            }

            let tokens: Vec<String> = line.split_whitespace().map(String::from).collect();
            let Some(first) = tokens.first() else {
                continue;
            };
            match commands::find(first) {
                Some(command) => (command.handler)(self, kernel, command, &tokens)?,
                None => println!("Unrecognized command '{first}'"),
            }
        }
        Ok(())
    }

    /// Advance the cursor to the next runnable work-item. Returns false when
    /// the invocation is complete.
    pub(crate) fn next_work_item(&mut self, kernel: &mut dyn Kernel) -> bool {
        self.current_item = None;
        loop {
            if let Some(group) = self.current_group.as_mut() {
                if let Some(local_id) = group.next_ready_item() {
                    self.current_item = Some(local_id);
                    return true;
                }

                // No items in the ready state. If some are waiting at a
                // barrier the whole group must have reached it; release them.
                if group.has_barrier() {
                    group.clear_barrier();
                    let local_id = group.next_ready_item();
                    assert!(local_id.is_some(), "cleared barrier released no work-item");
                    self.current_item = local_id;
                    return true;
                }

                // all items finished, destroy the group
                let finished = self.current_group.take().expect("current group");
                log::debug!(
                    "{}: work-group {} finished",
                    style("device").yellow(),
                    finished.group_id()
                );
            }

            if let Some(group) = self.running_groups.pop_front() {
                self.current_group = Some(group);
            } else {
                let mut created = None;
                while let Some(coords) = self.pending_groups.pop_front() {
                    if self.instantiated.insert(coords) {
                        created = Some(kernel.create_group(coords, &self.ndrange));
                        break;
                    }
                    log::trace!("skipping already-scheduled work-group {coords}");
                }
                match created {
                    Some(group) => {
                        log::debug!(
                            "{}: scheduling work-group {}",
                            style("device").yellow(),
                            group.group_id()
                        );
                        self.current_group = Some(group);
                    }
                    None => return false,
                }
            }

            let group = self.current_group.as_mut().expect("current group");
            if let Some(local_id) = group.next_ready_item() {
                self.current_item = Some(local_id);
                return true;
            }
            // the group turned out to have nothing runnable; next iteration
            // barrier-checks and destroys it
        }
    }

    /// Step the current work-item once and route any diagnostics it raised.
    pub(crate) fn step_current_item(&mut self) -> Result<State, FatalError> {
        let instruction = self
            .current_work_item()
            .and_then(|item| item.current_instruction());
        let local_id = self.current_item.expect("no current work-item to step");
        let group = self.current_group.as_mut().expect("current work-group");
        let state = group.step_item(
            local_id,
            self.global_memory.as_mut(),
            &mut self.pending_events,
        )?;
        if !self.pending_events.is_empty() {
            self.reporting_instruction = instruction;
            for event in std::mem::take(&mut self.pending_events) {
                self.report_event(event);
            }
            self.reporting_instruction = None;
        }
        Ok(state)
    }

    /// Advance the current work-item by one source line, or one instruction
    /// when no source is loaded.
    pub(crate) fn line_step(&mut self) -> Result<(), FatalError> {
        match self.current_state() {
            Some(State::Barrier) => {
                println!("Work-item is at a barrier.");
                return Ok(());
            }
            Some(State::Finished) => {
                println!("Work-item has finished execution.");
                return Ok(());
            }
            _ => {}
        }

        let prev_line = self.current_line_number();
        loop {
            let state = self.step_current_item()?;
            if state != State::Ready {
                break;
            }
            let curr_line = self.current_line_number();
            if self.source_lines.is_empty() || (curr_line != prev_line && curr_line != 0) {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn print_current_line(&self) {
        let Some(item) = self.current_work_item() else {
            return;
        };
        if item.state() == State::Finished {
            return;
        }

        let line = self.current_line_number();
        if !self.source_lines.is_empty() && line > 0 {
            self.print_source_line(line);
        } else {
            println!("Source line not available.");
            if let Some(instruction) = item.current_instruction() {
                println!("{instruction}");
            }
        }
    }

    pub(crate) fn print_source_line(&self, line: u64) {
        if line >= 1 && line <= self.source_lines.len() as u64 {
            println!("{line}\t{}", self.source_lines[line as usize - 1]);
        } else {
            println!("Invalid line number: {line}");
        }
    }
}

/// Post-run instruction count report: non-zero opcodes, debug intrinsics
/// dropped, sorted by descending count.
#[must_use]
pub fn format_instruction_counts(kernel_name: &str, counts: &[(String, u64)]) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "Instructions executed for kernel '{kernel_name}':");
    let rows = counts
        .iter()
        .filter(|(name, count)| *count > 0 && !name.starts_with("call llvm.dbg."))
        .sorted_by(|a, b| b.1.cmp(&a.1));
    for (name, count) in rows {
        let _ = writeln!(out, "{:>16} - {name}", thousands(*count));
    }
    let _ = writeln!(out);
    out
}

fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{format_instruction_counts, thousands, Device};
    use crate::config::Config;
    use crate::dim::{Dim, NDRange};
    use crate::kernel::Kernel;
    use crate::memory::AddrSpace;
    use crate::script::{Action, Op, ScriptKernel, ScriptProgram};
    use crate::work_item::State;
    use similar_asserts as diff;

    fn compute_ops(count: usize) -> Vec<Op> {
        (0..count)
            .map(|i| Op::compute("add", i as u64 + 1))
            .collect()
    }

    fn plain_kernel(ops: Vec<Op>) -> ScriptKernel {
        ScriptKernel::new("test_kernel", ScriptProgram::new(1, "test.cl", None, ops))
    }

    #[test]
    fn test_enumeration_order() {
        let mut kernel = plain_kernel(compute_ops(2));
        let mut device = Device::new(Config::default());
        device.run(
            &mut kernel,
            NDRange::new(2, Dim::new(4, 2, 1), Dim::ZERO, Dim::new(2, 1, 1)),
        );
        diff::assert_eq!(
            have: kernel.schedule(),
            want: vec![
                Dim::new(0, 0, 0),
                Dim::new(1, 0, 0),
                Dim::new(0, 1, 0),
                Dim::new(1, 1, 0),
            ]
        );
    }

    #[test]
    fn test_every_group_scheduled_exactly_once() {
        let mut kernel = plain_kernel(compute_ops(1));
        let mut device = Device::new(Config::default());
        device.run(
            &mut kernel,
            NDRange::new(3, Dim::new(4, 4, 2), Dim::ZERO, Dim::new(2, 2, 1)),
        );
        let schedule = kernel.schedule();
        assert_eq!(schedule.len(), 8);
        let distinct: std::collections::HashSet<_> = schedule.iter().copied().collect();
        assert_eq!(distinct.len(), 8);
    }

    #[test]
    fn test_quick_mode_corner_groups() {
        let mut kernel = plain_kernel(compute_ops(2));
        let config = Config {
            quick_mode: true,
            ..Config::default()
        };
        let mut device = Device::new(config);
        device.run(
            &mut kernel,
            NDRange::new(2, Dim::new(4, 2, 1), Dim::ZERO, Dim::new(2, 1, 1)),
        );
        diff::assert_eq!(
            have: kernel.schedule(),
            want: vec![Dim::new(0, 0, 0), Dim::new(1, 1, 0)]
        );
    }

    #[test]
    fn test_quick_mode_coinciding_corners_run_once() {
        let mut kernel = plain_kernel(compute_ops(2));
        let config = Config {
            quick_mode: true,
            ..Config::default()
        };
        let mut device = Device::new(config);
        device.run(
            &mut kernel,
            NDRange::new(1, Dim::new(4, 1, 1), Dim::ZERO, Dim::new(4, 1, 1)),
        );
        diff::assert_eq!(have: kernel.schedule(), want: vec![Dim::new(0, 0, 0)]);
    }

    #[test]
    fn test_barrier_releases_whole_group() {
        let ops = vec![
            Op::compute("mul", 1),
            Op::compute("add", 2),
            Op {
                opcode: "bar".to_string(),
                line: 3,
                action: Action::Barrier,
            },
            Op::compute("sub", 4),
        ];
        let mut kernel = plain_kernel(ops);
        let mut device = Device::new(Config::default());
        device.run(
            &mut kernel,
            NDRange::new(1, Dim::new(4, 1, 1), Dim::ZERO, Dim::new(4, 1, 1)),
        );
        // per item: two ops, the barrier, one op after it
        diff::assert_eq!(have: kernel.total_steps(), want: 4 * 4);
        assert!(kernel.schedule().len() == 1);
    }

    #[test]
    fn test_store_pattern_written() {
        let base = 0x10;
        let ops = vec![Op {
            opcode: "store".to_string(),
            line: 1,
            action: Action::Store {
                space: AddrSpace::Global,
                base,
                stride: 4,
            },
        }];
        let mut kernel = plain_kernel(ops);
        let mut device = Device::new(Config::default());
        let buffer = device.global_memory_mut().alloc(8 * 4).unwrap();
        assert_eq!(buffer, base);
        device.run(
            &mut kernel,
            NDRange::new(1, Dim::new(8, 1, 1), Dim::ZERO, Dim::new(4, 1, 1)),
        );
        for i in 0..8u32 {
            let mut word = [0u8; 4];
            device
                .global_memory()
                .load(base + u64::from(i) * 4, &mut word)
                .unwrap();
            assert_eq!(u32::from_le_bytes(word), i);
        }
    }

    #[test]
    fn test_fatal_constant_allocation_aborts_run() {
        let mut kernel = plain_kernel(compute_ops(4)).with_failing_constants();
        let mut device = Device::new(Config::default());
        let sink = super::commands::tests::SharedSink::default();
        device.set_diagnostic_sink(Box::new(sink.clone()));
        device.run(
            &mut kernel,
            NDRange::new(1, Dim::new(4, 1, 1), Dim::ZERO, Dim::new(2, 1, 1)),
        );
        assert!(kernel.schedule().is_empty(), "no group may be scheduled");
        let diag = sink.contents();
        assert!(diag.contains("OCLGRIND FATAL ERROR ("));
        assert!(diag.contains("When allocating kernel constants for 'test_kernel'"));
    }

    #[test]
    fn test_force_break_false_while_continue_progresses() {
        let mut kernel = plain_kernel(compute_ops(3));
        let mut device = Device::new(Config::default());
        device.run(
            &mut kernel,
            NDRange::new(1, Dim::new(2, 1, 1), Dim::ZERO, Dim::new(2, 1, 1)),
        );
        assert!(!device.force_break);
    }

    #[test]
    fn test_vacuous_group_is_skipped() {
        // zero-sized global range produces no groups at all
        let mut kernel = plain_kernel(compute_ops(1));
        let mut device = Device::new(Config::default());
        device.run(
            &mut kernel,
            NDRange::new(1, Dim::new(0, 1, 1), Dim::ZERO, Dim::new(1, 1, 1)),
        );
        assert!(kernel.schedule().is_empty());
        assert!(device.current_work_item().is_none());
    }

    #[test]
    fn test_next_work_item_round_robins_within_group() {
        let mut kernel = plain_kernel(compute_ops(2));
        let mut device = Device::new(Config::default());
        assert!(device.begin_invocation(
            &mut kernel,
            NDRange::new(1, Dim::new(4, 1, 1), Dim::ZERO, Dim::new(4, 1, 1)),
        ));
        let first = device.current_item.unwrap();
        diff::assert_eq!(have: first, want: Dim::new(0, 0, 0));

        // drain the first item, the cursor must move to the second
        while device.current_state() == Some(State::Ready) {
            device.step_current_item().unwrap();
        }
        assert!(device.next_work_item(&mut kernel));
        diff::assert_eq!(have: device.current_item.unwrap(), want: Dim::new(1, 0, 0));
        device.finish_invocation(&mut kernel);
    }

    #[test]
    fn test_instruction_count_report() {
        let counts = vec![
            ("add".to_string(), 1234567),
            ("br".to_string(), 12),
            ("call llvm.dbg.value".to_string(), 99),
            ("fmul".to_string(), 0),
            ("ret".to_string(), 40),
        ];
        let report = format_instruction_counts("vecadd", &counts);
        diff::assert_eq!(
            have: report,
            want: "Instructions executed for kernel 'vecadd':\n\
                   \x20      1,234,567 - add\n\
                   \x20             40 - ret\n\
                   \x20             12 - br\n\n"
                .to_string()
        );
    }

    #[test]
    fn test_thousands_grouping() {
        diff::assert_eq!(have: thousands(0), want: "0".to_string());
        diff::assert_eq!(have: thousands(999), want: "999".to_string());
        diff::assert_eq!(have: thousands(1000), want: "1,000".to_string());
        diff::assert_eq!(have: thousands(1234567890), want: "1,234,567,890".to_string());
    }

    #[test]
    fn test_constant_buffer_lifecycle() {
        let ops = vec![Op {
            opcode: "load".to_string(),
            line: 1,
            action: Action::Load {
                space: AddrSpace::Constant,
                base: 0x10,
                stride: 0,
                size: 4,
            },
        }];
        let mut kernel = plain_kernel(ops).with_constant_data(vec![1, 2, 3, 4]);
        let mut device = Device::new(Config::default());
        let sink = super::commands::tests::SharedSink::default();
        device.set_diagnostic_sink(Box::new(sink.clone()));
        device.run(
            &mut kernel,
            NDRange::new(1, Dim::new(2, 1, 1), Dim::ZERO, Dim::new(2, 1, 1)),
        );
        // the constant buffer was live during the run and freed afterwards
        assert!(sink.contents().is_empty(), "no diagnostics expected");
        assert!(!device.global_memory().is_valid(0x10, 4));
    }

    #[test]
    fn test_instruction_counts_reset_between_runs() {
        let mut kernel = plain_kernel(compute_ops(2));
        let mut device = Device::new(Config::default());
        let range = NDRange::new(1, Dim::new(2, 1, 1), Dim::ZERO, Dim::new(2, 1, 1));
        device.run(&mut kernel, range);
        device.run(&mut kernel, range);
        let counts: u64 = kernel.instruction_counts().iter().map(|(_, c)| c).sum();
        diff::assert_eq!(have: counts, want: 4);
    }
}
