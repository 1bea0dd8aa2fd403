use crate::device::Event;
use crate::dim::Dim;
use crate::error::FatalError;
use crate::memory::Memory;
use crate::work_item::{State, WorkItem};

/// A fixed set of work-items sharing local memory and a barrier.
///
/// Work-items are addressed by local-id handles rather than references; the
/// scheduler's cursor stores handles and resolves them per use.
pub trait WorkGroup: std::fmt::Debug {
    fn group_id(&self) -> Dim;

    /// Round-robin over items in the `Ready` state. Returns `None` when every
    /// item is at a barrier or finished. The order is deterministic for
    /// identical input.
    fn next_ready_item(&mut self) -> Option<Dim>;

    /// Whether any item is waiting at a barrier.
    fn has_barrier(&self) -> bool;

    /// Release the barrier: every `Barrier` item becomes `Ready` again.
    fn clear_barrier(&mut self);

    fn local_memory(&self) -> &dyn Memory;

    fn local_memory_mut(&mut self) -> &mut dyn Memory;

    fn work_item(&self, local_id: Dim) -> Option<&dyn WorkItem>;

    fn work_item_mut(&mut self, local_id: Dim) -> Option<&mut dyn WorkItem>;

    /// Step one item, assembling its context from the group's local memory.
    fn step_item(
        &mut self,
        local_id: Dim,
        global: &mut dyn Memory,
        events: &mut Vec<Event>,
    ) -> Result<State, FatalError>;
}
