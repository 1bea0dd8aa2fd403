//! The single sink for runtime error notifications. Every notification
//! writes a context-carrying block to the diagnostic stream and raises a
//! break request; the debugger then regains control at the next step.

use super::Device;
use crate::dim::Dim;
use crate::error::FatalError;
use crate::memory::AddrSpace;
use crate::work_item::Instruction;
use std::fmt::Write as _;
use std::io::Write as _;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display)]
pub enum RaceKind {
    #[strum(serialize = "Read-write")]
    ReadWrite,
    #[strum(serialize = "Write-write")]
    WriteWrite,
}

/// The other party of a data race, as a linear id when known.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RaceEntity {
    WorkItem(u64),
    WorkGroup(u64),
    Unknown,
}

/// A runtime diagnostic raised while stepping a work-item.
#[derive(Debug, Clone)]
pub enum Event {
    MemoryError {
        read: bool,
        space: AddrSpace,
        address: u64,
        size: u64,
    },
    DataRace {
        kind: RaceKind,
        space: AddrSpace,
        address: u64,
        entity: RaceEntity,
        last_instruction: Option<Instruction>,
    },
    Divergence {
        instruction: Instruction,
        kind: String,
        current: String,
        previous: String,
    },
    Error {
        title: String,
        info: String,
    },
}

/// Decode a linear id into coordinates. The y and z divisors are part of the
/// reporting convention race callers encode with; keep bit-exact.
pub(crate) fn delinearize(id: u64, bounds: Dim) -> Dim {
    let x = id % bounds.x;
    let y = (id - x) / bounds.y;
    let z = (id - y - x) / bounds.z;
    Dim::new(x, y, z)
}

impl Device {
    /// Report an out-of-bounds or otherwise invalid access.
    pub fn notify_memory_error(&mut self, read: bool, space: AddrSpace, address: u64, size: u64) {
        let mut block = String::new();
        let _ = writeln!(block);
        let _ = writeln!(
            block,
            "Invalid {} of size {size} at {space} memory address {address:x}",
            if read { "read" } else { "write" },
        );
        self.write_error_context(&mut block);
        let _ = writeln!(block);
        self.emit_diagnostic(&block);
        self.force_break = true;
    }

    /// Report a data race against another work-item or work-group.
    pub fn notify_data_race(
        &mut self,
        kind: RaceKind,
        space: AddrSpace,
        address: u64,
        entity: RaceEntity,
        last_instruction: Option<&Instruction>,
    ) {
        let mut block = String::new();
        let _ = writeln!(block);
        let _ = writeln!(block, "{kind} data race at {space} memory address {address:x}");
        self.write_error_context(&mut block);
        let _ = writeln!(block);

        match entity {
            RaceEntity::WorkItem(id) => {
                let other = delinearize(id, self.ndrange.global_size);
                let _ = writeln!(
                    block,
                    "\tRace occured with work-item ({},{},{})",
                    other.x, other.y, other.z
                );
            }
            RaceEntity::WorkGroup(id) => {
                let other = delinearize(id, self.num_groups);
                let _ = writeln!(
                    block,
                    "\tRace occured with work-group ({},{},{})",
                    other.x, other.y, other.z
                );
            }
            RaceEntity::Unknown => {
                let _ = writeln!(block, "\tRace occured with unknown entity");
            }
        }

        if let Some(instruction) = last_instruction {
            block.push('\t');
            self.write_instruction(&mut block, instruction);
        }
        let _ = writeln!(block);
        self.emit_diagnostic(&block);
        self.force_break = true;
    }

    /// Report control-flow disagreement between work-items.
    pub fn notify_divergence(
        &mut self,
        instruction: &Instruction,
        kind: &str,
        current: &str,
        previous: &str,
    ) {
        let mut block = String::new();
        let _ = writeln!(block);
        let _ = writeln!(block, "Work-group divergence detected ({kind}):");
        self.write_error_context(&mut block);
        if !current.is_empty() {
            let _ = writeln!(block, "\t{current}");
        }
        let _ = writeln!(block);

        let _ = writeln!(block, "Previous work-items executed this instruction:");
        block.push('\t');
        self.write_instruction(&mut block, instruction);
        if !previous.is_empty() {
            let _ = writeln!(block, "\t{previous}");
        }
        let _ = writeln!(block);
        self.emit_diagnostic(&block);
        self.force_break = true;
    }

    /// Report a generic runtime error.
    pub fn notify_error(&mut self, title: &str, info: &str) {
        let mut block = String::new();
        let _ = writeln!(block);
        let _ = writeln!(block, "{title}:");
        self.write_error_context(&mut block);
        if !info.is_empty() {
            let _ = writeln!(block, "\t{info}");
        }
        let _ = writeln!(block);
        self.emit_diagnostic(&block);
        self.force_break = true;
    }

    pub(crate) fn report_event(&mut self, event: Event) {
        match event {
            Event::MemoryError {
                read,
                space,
                address,
                size,
            } => self.notify_memory_error(read, space, address, size),
            Event::DataRace {
                kind,
                space,
                address,
                entity,
                last_instruction,
            } => self.notify_data_race(kind, space, address, entity, last_instruction.as_ref()),
            Event::Divergence {
                instruction,
                kind,
                current,
                previous,
            } => self.notify_divergence(&instruction, &kind, &current, &previous),
            Event::Error { title, info } => self.notify_error(&title, &info),
        }
    }

    pub(crate) fn report_fatal(&mut self, err: &FatalError) {
        let mut block = String::new();
        let _ = writeln!(block);
        let _ = writeln!(block, "OCLGRIND FATAL ERROR ({}:{})", err.file(), err.line());
        let _ = writeln!(block, "{err}");
        self.write_error_context(&mut block);
        let _ = writeln!(block);
        self.emit_diagnostic(&block);
    }

    pub(crate) fn report_fatal_setup(&mut self, err: &FatalError, kernel_name: &str) {
        let mut block = String::new();
        let _ = writeln!(block);
        let _ = writeln!(block, "OCLGRIND FATAL ERROR ({}:{})", err.file(), err.line());
        let _ = writeln!(block, "{err}");
        let _ = writeln!(block, "When allocating kernel constants for '{kernel_name}'");
        self.emit_diagnostic(&block);
    }

    fn write_error_context(&self, block: &mut String) {
        if let Some(item) = self.current_work_item() {
            let gid = item.global_id();
            let lid = item.local_id();
            let _ = writeln!(
                block,
                "\tWork-item:  Global({},{},{}) Local({},{},{})",
                gid.x, gid.y, gid.z, lid.x, lid.y, lid.z
            );
        }
        if let Some(group) = self.current_work_group() {
            let group_id = group.group_id();
            let _ = writeln!(
                block,
                "\tWork-group: ({},{},{})",
                group_id.x, group_id.y, group_id.z
            );
        }
        if let Some(name) = self.kernel_name.as_deref() {
            let _ = writeln!(block, "\tKernel:     {name}");
        }
        let instruction = self
            .reporting_instruction
            .clone()
            .or_else(|| self.current_work_item().and_then(|item| item.current_instruction()));
        if let Some(instruction) = instruction {
            block.push('\t');
            self.write_instruction(block, &instruction);
        }
    }

    fn write_instruction(&self, block: &mut String, instruction: &Instruction) {
        let _ = writeln!(block, "{}", instruction.text);
        match &instruction.loc {
            Some(loc) => {
                let _ = writeln!(block, "\tAt line {} of {}", loc.line, loc.file);
            }
            None => {
                let _ = writeln!(block, "\tDebugging information not available.");
            }
        }
    }

    pub(crate) fn emit_diagnostic(&mut self, block: &str) {
        let _ = self.diag.write_all(block.as_bytes());
        let _ = self.diag.flush();
    }
}
