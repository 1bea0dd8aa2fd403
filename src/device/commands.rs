//! Interactive debugger commands. Dispatch is table-driven: every command
//! names its long and short form, its help text, and (for the memory
//! commands) the address space it targets, all sharing one handler where the
//! behavior is the same.

use super::Device;
use crate::dim::{Dim, NDRange};
use crate::error::FatalError;
use crate::kernel::Kernel;
use crate::memory::{format_hex_rows, AddrSpace, Memory};
use crate::value::{print_typed_data, Pointer, Variable};
use crate::work_item::{Frame, State, WorkItem};
use std::io::{self, Write as _};

const LIST_LENGTH: u64 = 10;

pub(crate) type Handler =
    fn(&mut Device, &mut dyn Kernel, &CommandSpec, &[String]) -> Result<(), FatalError>;

pub(crate) struct CommandSpec {
    pub name: &'static str,
    pub short: &'static str,
    /// Target region for the memory commands.
    pub space: Option<AddrSpace>,
    pub help: &'static str,
    pub handler: Handler,
}

pub(crate) static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "backtrace",
        short: "bt",
        space: None,
        help: "Print function call stack.",
        handler: Device::cmd_backtrace,
    },
    CommandSpec {
        name: "break",
        short: "b",
        space: None,
        help: "Set a breakpoint (only functional when source is available).\n\
               With no arguments, sets a breakpoint at the current line.\n\
               Use a numeric argument to set a breakpoint at a specific line.",
        handler: Device::cmd_break,
    },
    CommandSpec {
        name: "continue",
        short: "c",
        space: None,
        help: "Continue kernel execution until next breakpoint.",
        handler: Device::cmd_continue,
    },
    CommandSpec {
        name: "delete",
        short: "d",
        space: None,
        help: "Delete a breakpoint.\nWith no arguments, deletes all breakpoints.",
        handler: Device::cmd_delete,
    },
    CommandSpec {
        name: "gmem",
        short: "gm",
        space: Some(AddrSpace::Global),
        help: "Examine contents of global memory.\n\
               With no arguments, dumps entire contents of memory.\n\
               'gmem address [size]'\n\
               address is hexadecimal and 4-byte aligned.",
        handler: Device::cmd_mem,
    },
    CommandSpec {
        name: "help",
        short: "h",
        space: None,
        help: "Display usage information for a command.",
        handler: Device::cmd_help,
    },
    CommandSpec {
        name: "info",
        short: "i",
        space: None,
        help: "Display information about current debugging context.\n\
               With no arguments, displays general information.\n\
               'info break' lists breakpoints.",
        handler: Device::cmd_info,
    },
    CommandSpec {
        name: "list",
        short: "l",
        space: None,
        help: "List source lines.\n\
               With no argument, lists 10 lines after previous listing.\n\
               Use - to list 10 lines before the previous listing\n\
               Use a numeric argument to list around a specific line number.",
        handler: Device::cmd_list,
    },
    CommandSpec {
        name: "next",
        short: "n",
        space: None,
        help: "Step forward, treating function calls as single instruction.",
        handler: Device::cmd_next,
    },
    CommandSpec {
        name: "lmem",
        short: "lm",
        space: Some(AddrSpace::Local),
        help: "Examine contents of local memory.\n\
               With no arguments, dumps entire contents of memory.\n\
               'lmem address [size]'\n\
               address is hexadecimal and 4-byte aligned.",
        handler: Device::cmd_mem,
    },
    CommandSpec {
        name: "pmem",
        short: "pm",
        space: Some(AddrSpace::Private),
        help: "Examine contents of private memory.\n\
               With no arguments, dumps entire contents of memory.\n\
               'pmem address [size]'\n\
               address is hexadecimal and 4-byte aligned.",
        handler: Device::cmd_mem,
    },
    CommandSpec {
        name: "print",
        short: "p",
        space: None,
        help: "Print the values of one or more variables.",
        handler: Device::cmd_print,
    },
    CommandSpec {
        name: "quit",
        short: "q",
        space: None,
        help: "Quit interactive debugger (and terminate current kernel invocation).",
        handler: Device::cmd_quit,
    },
    CommandSpec {
        name: "step",
        short: "s",
        space: None,
        help: "Step forward a single source line, or an instruction if no source available.",
        handler: Device::cmd_step,
    },
    CommandSpec {
        name: "workitem",
        short: "wi",
        space: None,
        help: "Switch to a different work-item.\n\
               Up to three (space separated) arguments allowed, \
               specifying the global ID of the work-item.",
        handler: Device::cmd_workitem,
    },
];

pub(crate) fn find(token: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|command| command.name == token || command.short == token)
}

pub(crate) fn lookup(name: &str) -> &'static CommandSpec {
    find(name).expect("command not in dispatch table")
}

// strict parses: the whole token must be consumed
fn parse_dec(token: &str) -> Option<u64> {
    token.parse().ok()
}

fn parse_hex(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}

fn frame_line(frame: &Frame) -> String {
    format!("{} at line {}", frame.signature, frame.line)
}

impl Device {
    pub(crate) fn cmd_backtrace(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        _args: &[String],
    ) -> Result<(), FatalError> {
        let Some(item) = self.current_work_item() else {
            return Ok(());
        };
        if item.state() == State::Finished {
            return Ok(());
        }

        let stack = item.call_stack();
        if let Some(frame) = item.current_frame() {
            println!("#{} {}", stack.len(), frame_line(&frame));
        }
        for (depth, frame) in stack.iter().enumerate().rev() {
            println!("#{depth} {}", frame_line(frame));
        }
        Ok(())
    }

    pub(crate) fn cmd_break(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        if self.source_lines.is_empty() {
            println!("Breakpoints only valid when source is available.");
            return Ok(());
        }

        let mut line = self.current_line_number();
        if args.len() > 1 {
            match parse_dec(&args[1]) {
                Some(number) if number >= 1 && number <= self.source_lines.len() as u64 + 1 => {
                    line = number;
                }
                _ => {
                    println!("Invalid line number.");
                    return Ok(());
                }
            }
        }

        if line != 0 {
            let program = self.program.expect("breakpoints require a current program");
            self.breakpoints
                .entry(program)
                .or_default()
                .insert(self.next_breakpoint, line);
            self.next_breakpoint += 1;
        } else {
            println!("Not currently on a line.");
        }
        Ok(())
    }

    /// Free-run until a breakpoint, an error break, or completion.
    pub(crate) fn cmd_continue(
        &mut self,
        kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        _args: &[String],
    ) -> Result<(), FatalError> {
        let mut can_break = false;
        self.force_break = false;
        self.running = true;
        while self.current_item.is_some() && self.running {
            // run the current work-item as far as possible
            while self.current_state() == Some(State::Ready) && self.running {
                self.step_current_item()?;

                if !self.interactive {
                    continue;
                }

                if self.force_break {
                    self.list_position = 0;
                    self.force_break = false;
                    return Ok(());
                }

                if self.breakpoints.is_empty() {
                    continue;
                }

                // do not re-fire until we have left the previous break line
                if !can_break {
                    if self.current_line_number() == self.last_break_line {
                        continue;
                    }
                    can_break = true;
                }

                let line = self.current_line_number();
                let hit = self.program.and_then(|program| {
                    self.breakpoints
                        .get(&program)?
                        .iter()
                        .find(|(_, &breakpoint_line)| breakpoint_line == line)
                        .map(|(&id, &breakpoint_line)| (id, breakpoint_line))
                });
                if let Some((id, breakpoint_line)) = hit {
                    let gid = self
                        .current_work_item()
                        .map_or(Dim::ZERO, WorkItem::global_id);
                    println!(
                        "Breakpoint {id} hit at line {breakpoint_line} by work-item ({},{},{})",
                        gid.x, gid.y, gid.z
                    );
                    self.print_current_line();
                    self.last_break_line = line;
                    self.list_position = 0;
                    return Ok(());
                }
            }

            self.next_work_item(kernel);
        }
        self.running = false;
        Ok(())
    }

    pub(crate) fn cmd_delete(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        if args.len() > 1 {
            let Some(id) = args[1].parse::<u32>().ok() else {
                println!("Invalid breakpoint number.");
                return Ok(());
            };
            let removed = self
                .program
                .and_then(|program| self.breakpoints.get_mut(&program))
                .and_then(|breakpoints| breakpoints.remove(&id));
            if removed.is_none() {
                println!("Breakpoint not found.");
            }
        } else {
            print!("Delete all breakpoints? (y/n) ");
            let _ = io::stdout().flush();
            let mut confirm = String::new();
            let _ = io::stdin().read_line(&mut confirm);
            if confirm.trim() == "y" {
                self.breakpoints.clear();
            }
        }
        Ok(())
    }

    pub(crate) fn cmd_help(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        if args.len() < 2 {
            println!("Command list:");
            for command in COMMANDS {
                println!("  {:<12} ({})", command.name, command.short);
            }
            println!("(type 'help command' for more information)");
            return Ok(());
        }

        match find(&args[1]) {
            Some(command) => println!("{}", command.help),
            None => println!("Unrecognized command '{}'", args[1]),
        }
        Ok(())
    }

    pub(crate) fn cmd_info(
        &mut self,
        kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        if args.len() > 1 {
            if args[1] == "break" {
                if let Some(breakpoints) =
                    self.program.and_then(|program| self.breakpoints.get(&program))
                {
                    for (id, line) in breakpoints {
                        println!("Breakpoint {id}: Line {line}");
                    }
                }
            } else {
                println!("Invalid info command: {}", args[1]);
            }
            return Ok(());
        }

        let NDRange {
            global_size: gs,
            global_offset: go,
            local_size: ls,
            ..
        } = self.ndrange;
        println!("Running kernel '{}'", kernel.name());
        println!("-> Global work size:   ({},{},{})", gs.x, gs.y, gs.z);
        println!("-> Global work offset: ({},{},{})", go.x, go.y, go.z);
        println!("-> Local work size:    ({},{},{})", ls.x, ls.y, ls.z);

        if let Some(item) = self.current_work_item() {
            let gid = item.global_id();
            println!();
            println!("Current work-item: ({},{},{})", gid.x, gid.y, gid.z);
            self.print_current_line();
        } else {
            println!("All work-items finished.");
        }
        Ok(())
    }

    pub(crate) fn cmd_list(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        if self.current_item.is_none() {
            println!("All work-items finished.");
            return Ok(());
        }
        if self.source_lines.is_empty() {
            println!("No source code available.");
            return Ok(());
        }
        let num_lines = self.source_lines.len() as u64;

        let mut start = 0;
        let mut forwards = true;
        if args.len() > 1 {
            if args[1] == "-" {
                forwards = false;
            } else {
                let Some(number) = parse_dec(&args[1]) else {
                    println!("Invalid line number.");
                    return Ok(());
                };
                start = if number > LIST_LENGTH / 2 {
                    number - LIST_LENGTH / 2
                } else {
                    1
                };
            }
        }

        if start == 0 {
            if forwards {
                start = if self.list_position != 0 {
                    self.list_position + LIST_LENGTH
                } else {
                    self.current_line_number() + 1
                };
                if start >= num_lines + 1 {
                    self.list_position = num_lines + 1;
                    return Ok(());
                }
            } else {
                let anchor = if self.list_position != 0 {
                    self.list_position
                } else {
                    self.current_line_number()
                };
                start = if anchor > LIST_LENGTH {
                    anchor - LIST_LENGTH
                } else {
                    1
                };
            }
        }

        for i in 0..LIST_LENGTH {
            if start + i >= num_lines + 1 {
                break;
            }
            self.print_source_line(start + i);
        }
        self.list_position = start;
        Ok(())
    }

    /// Shared handler for gmem/lmem/pmem; the target space comes from the
    /// dispatch table entry.
    pub(crate) fn cmd_mem(
        &mut self,
        _kernel: &mut dyn Kernel,
        command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        let space = command.space.expect("memory command without address space");
        let memory: &dyn Memory = match space {
            AddrSpace::Global => self.global_memory.as_ref(),
            AddrSpace::Local => match self.current_work_group() {
                Some(group) => group.local_memory(),
                None => {
                    println!("All work-items finished.");
                    return Ok(());
                }
            },
            AddrSpace::Private => match self.current_work_item() {
                Some(item) => item.private_memory(),
                None => {
                    println!("All work-items finished.");
                    return Ok(());
                }
            },
            AddrSpace::Constant => unreachable!("no command targets constant memory"),
        };

        if args.len() <= 1 {
            let _ = memory.dump(&mut io::stdout());
            return Ok(());
        }
        if args.len() > 3 {
            println!("Invalid number of arguments.");
            return Ok(());
        }

        let Some(address) = parse_hex(&args[1]).filter(|address| address % 4 == 0) else {
            println!("Invalid address.");
            return Ok(());
        };

        let mut size = 8;
        if args.len() == 3 {
            match parse_dec(&args[2]) {
                Some(value) if value != 0 => size = value,
                _ => {
                    println!("Invalid size");
                    return Ok(());
                }
            }
        }

        if !memory.is_valid(address, size) {
            println!("Invalid memory address.");
            return Ok(());
        }

        let mut data = vec![0u8; size as usize];
        if memory.load(address, &mut data).is_err() {
            println!("Invalid memory address.");
            return Ok(());
        }
        print!("{}\n\n", format_hex_rows(address, &data));
        Ok(())
    }

    pub(crate) fn cmd_next(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        _args: &[String],
    ) -> Result<(), FatalError> {
        if self.current_item.is_none() {
            println!("All work-items finished.");
            return Ok(());
        }

        // step until we return to the same call depth
        let prev_depth = self
            .current_work_item()
            .map_or(0, |item| item.call_stack().len());
        loop {
            self.line_step()?;
            if self.current_state() != Some(State::Ready) {
                break;
            }
            let depth = self
                .current_work_item()
                .map_or(0, |item| item.call_stack().len());
            if depth <= prev_depth {
                break;
            }
        }

        self.print_frame_if_changed(prev_depth);
        self.print_current_line();
        self.list_position = 0;
        Ok(())
    }

    pub(crate) fn cmd_print(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        if args.len() < 2 {
            println!("Variable name(s) required.");
            return Ok(());
        }
        if self.current_work_item().is_none() {
            println!("All work-items finished.");
            return Ok(());
        }

        for arg in &args[1..] {
            print!("{arg} = ");

            let Some(bracket) = arg.find('[') else {
                let item = self.current_work_item().expect("current work-item");
                match item.print_variable(arg) {
                    Some(value) => print!("{value}"),
                    None => print!("not found"),
                }
                println!();
                continue;
            };

            let Some(end) = arg.find(']') else {
                println!("missing ']'");
                return Ok(());
            };
            if end != arg.len() - 1 {
                println!("invalid variable");
                return Ok(());
            }
            let Some(index) = parse_dec(&arg[bracket + 1..end]) else {
                println!("invalid index");
                return Ok(());
            };

            let name = &arg[..bracket];
            let item = self.current_work_item().expect("current work-item");
            let Some(variable) = item.get_variable(name) else {
                println!("not found");
                return Ok(());
            };
            let Variable::Pointer(pointer) = variable else {
                println!("not a pointer");
                return Ok(());
            };

            match self.read_element(&pointer, index) {
                Ok(value) => println!("{value}"),
                Err(message) => println!("{message}"),
            }
        }
        Ok(())
    }

    /// Resolve `pointer[index]` and render the element with the typed
    /// printer.
    pub(crate) fn read_element(
        &self,
        pointer: &Pointer,
        index: u64,
    ) -> Result<String, &'static str> {
        let item = self.current_work_item().ok_or("not found")?;

        // stack allocations hold the element base behind a private slot
        let base = if pointer.indirect {
            let mut bytes = [0u8; 8];
            item.private_memory()
                .load(pointer.address, &mut bytes)
                .map_err(|_| "invalid memory address")?;
            u64::from_le_bytes(bytes)
        } else {
            pointer.address
        };

        let memory: &dyn Memory = match pointer.space {
            AddrSpace::Private => item.private_memory(),
            AddrSpace::Global | AddrSpace::Constant => self.global_memory.as_ref(),
            AddrSpace::Local => self
                .current_work_group()
                .ok_or("invalid memory address")?
                .local_memory(),
        };

        let elem_size = pointer.elem.size();
        let address = base + index * elem_size;
        if !memory.is_valid(address, elem_size) {
            return Err("invalid memory address");
        }
        let mut data = vec![0u8; elem_size as usize];
        memory
            .load(address, &mut data)
            .map_err(|_| "invalid memory address")?;
        Ok(print_typed_data(&pointer.elem, &data))
    }

    pub(crate) fn cmd_quit(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        _args: &[String],
    ) -> Result<(), FatalError> {
        self.interactive = false;
        self.running = false;
        self.breakpoints.clear();
        Ok(())
    }

    pub(crate) fn cmd_step(
        &mut self,
        _kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        _args: &[String],
    ) -> Result<(), FatalError> {
        if self.current_item.is_none() {
            println!("All work-items finished.");
            return Ok(());
        }

        let prev_depth = self
            .current_work_item()
            .map_or(0, |item| item.call_stack().len());
        self.line_step()?;

        self.print_frame_if_changed(prev_depth);
        self.print_current_line();
        self.list_position = 0;
        Ok(())
    }

    pub(crate) fn cmd_workitem(
        &mut self,
        kernel: &mut dyn Kernel,
        _command: &CommandSpec,
        args: &[String],
    ) -> Result<(), FatalError> {
        if args.len() > 4 {
            println!("Invalid global ID.");
            return Ok(());
        }
        let mut gid = Dim::ZERO;
        for (i, arg) in args.iter().skip(1).enumerate() {
            match parse_dec(arg) {
                Some(value) if value < self.ndrange.global_size[i] => gid[i] = value,
                _ => {
                    println!("Invalid global ID.");
                    return Ok(());
                }
            }
        }

        let Some(current) = self.current_group.as_ref() else {
            println!("All work-items finished.");
            return Ok(());
        };
        let group = gid / self.ndrange.local_size;

        let mut found = current.group_id() == group;

        // look through the running pool
        if !found {
            if let Some(position) = self
                .running_groups
                .iter()
                .position(|candidate| candidate.group_id() == group)
            {
                let target = self.running_groups.remove(position).expect("valid position");
                let previous = self.current_group.replace(target).expect("current group");
                self.running_groups.push_back(previous);
                found = true;
            }
        }

        // look through the pending pool
        if !found {
            if let Some(position) = self
                .pending_groups
                .iter()
                .position(|&coords| coords == group)
            {
                self.pending_groups.remove(position);
                self.instantiated.insert(group);
                let target = kernel.create_group(group, &self.ndrange);
                let previous = self.current_group.replace(target).expect("current group");
                self.running_groups.push_back(previous);
                found = true;
            }
        }

        if !found {
            println!("Work-item has already finished, unable to load state.");
            return Ok(());
        }

        self.current_item = Some(gid % self.ndrange.local_size);
        println!("Switched to work-item: ({},{},{})", gid.x, gid.y, gid.z);
        if self.current_state() == Some(State::Finished) {
            println!("Work-item has finished execution.");
        } else {
            self.print_current_line();
        }
        Ok(())
    }

    fn print_frame_if_changed(&self, prev_depth: usize) {
        let Some(item) = self.current_work_item() else {
            return;
        };
        if item.call_stack().len() != prev_depth && item.state() != State::Finished {
            if let Some(frame) = item.current_frame() {
                println!("{}", frame_line(&frame));
            }
        }
    }
}
