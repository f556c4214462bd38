use std::fmt::{Display, Formatter};

/// Identifies a registration in an event loop. Handles are never reused: a slot that was freed and
///  re-occupied gets a new generation, so a stale handle does not accidentally address a different
///  descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational slot storage backing the registry.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return Handle { index, generation: slot.generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, value: Some(value) });
        Handle { index, generation: 0 }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots.get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let result = slot.value.take();
        if result.is_some() {
            self.free.push(handle.index);
        }
        result
    }

    /// the live handle at a given index, used to map mio tokens back to registrations
    pub fn handle_at(&self, index: usize) -> Option<Handle> {
        self.slots.get(index)
            .filter(|s| s.value.is_some())
            .map(|s| Handle { index: index as u32, generation: s.generation })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(index, s)| s.value.as_ref()
                .map(|v| (Handle { index: index as u32, generation: s.generation }, v)))
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
