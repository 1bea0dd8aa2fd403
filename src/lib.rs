//! Simulates the execution of data-parallel compute kernels on a virtual
//! device, interleaving work-items through a shared interpreter while
//! checking memory accesses and synchronization.

pub mod config;
pub mod device;
pub mod dim;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod script;
pub mod value;
pub mod work_group;
pub mod work_item;

pub use config::Config;
pub use device::{Device, Event, RaceEntity, RaceKind};
pub use dim::{Dim, NDRange};
pub use error::FatalError;
pub use kernel::{Kernel, Program};
pub use memory::{AddrSpace, Memory, MemoryError, VirtualMemory};
pub use value::{Pointer, Type, Variable};
pub use work_group::WorkGroup;
pub use work_item::{Frame, Instruction, SourceLoc, State, StepCtx, WorkItem};
