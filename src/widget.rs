//! Generational widget handles
//!
//! The core never owns widgets; the widget layer does. What the core needs
//! is a way to reference widgets from long-lived state (timers, grabs, the
//! event queue, drag-and-drop hover tracking) without those references ever
//! dangling. [`WidgetArena`] hands out [`WidgetId`]s with a generation
//! counter per slot: once a widget is destroyed its slot generation is
//! bumped, and every stale id referring to it fails the
//! [`is_alive`](WidgetArena::is_alive) check from then on.

use std::fmt;

/// Handle to a widget registered with a [`Core`](crate::core::Core)
///
/// Ids are cheap to copy and safe to hold indefinitely; a destroyed
/// widget's id simply stops validating.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WidgetId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WidgetId({}v{})", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    alive: bool,
}

/// Allocator and liveness oracle for [`WidgetId`]s
#[derive(Debug, Default)]
pub struct WidgetArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl WidgetArena {
    /// Create an empty arena
    pub fn new() -> WidgetArena {
        Default::default()
    }

    /// Register a new widget and return its handle
    pub fn alloc(&mut self) -> WidgetId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            WidgetId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                alive: true,
            });
            WidgetId {
                index,
                generation: 0,
            }
        }
    }

    /// Release a widget's slot, invalidating all copies of its id
    ///
    /// Returns `false` if the id was already stale.
    pub fn free(&mut self, id: WidgetId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.alive && slot.generation == id.generation => {
                slot.alive = false;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
                true
            }
            _ => false,
        }
    }

    /// Check whether the widget behind `id` still exists
    #[inline]
    pub fn is_alive(&self, id: WidgetId) -> bool {
        self.slots
            .get(id.index as usize)
            .map(|slot| slot.alive && slot.generation == id.generation)
            .unwrap_or(false)
    }

    /// Number of currently registered widgets
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.alive).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_id_is_alive() {
        let mut arena = WidgetArena::new();
        let id = arena.alloc();
        assert!(arena.is_alive(id));
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn freed_id_goes_stale() {
        let mut arena = WidgetArena::new();
        let id = arena.alloc();
        assert!(arena.free(id));
        assert!(!arena.is_alive(id));
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut arena = WidgetArena::new();
        let id = arena.alloc();
        assert!(arena.free(id));
        assert!(!arena.free(id));
    }

    #[test]
    fn reused_slot_does_not_revive_old_id() {
        let mut arena = WidgetArena::new();
        let old = arena.alloc();
        arena.free(old);
        let new = arena.alloc();
        // same slot, new generation
        assert_ne!(old, new);
        assert!(!arena.is_alive(old));
        assert!(arena.is_alive(new));
    }
}
