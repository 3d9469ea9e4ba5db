//! # Generation-Checked Arena
//!
//! Storage for graph-owned objects. Values are addressed by a [`Handle`] made of
//! a slot index and the slot's generation at insertion time. Removing a value
//! bumps the slot's generation, so any handle taken before the removal stops
//! resolving instead of silently pointing at whatever reuses the slot.

/// Handle to a value stored in an [`Arena`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Handle {
  index: u32,
  generation: u32,
}

impl Handle {
  /// Slot index of the handle.
  #[inline]
  pub const fn index(self) -> u32 {
    self.index
  }

  /// Generation the handle was issued for.
  #[inline]
  pub const fn generation(self) -> u32 {
    self.generation
  }
}

#[derive(Debug)]
struct Slot<T> {
  generation: u32,
  value: Option<T>,
}

/// A generational arena.
#[derive(Debug)]
pub struct Arena<T> {
  slots: Vec<Slot<T>>,
  free: Vec<u32>,
  len: usize,
}

impl<T> Default for Arena<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Arena<T> {
  /// Creates an empty arena.
  pub fn new() -> Self {
    Self {
      slots: Vec::new(),
      free: Vec::new(),
      len: 0,
    }
  }

  /// Number of live values.
  pub fn len(&self) -> usize {
    self.len
  }

  /// Returns `true` if the arena holds no values.
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Stores `value` and returns its handle. Free slots are reused.
  pub fn insert(&mut self, value: T) -> Handle {
    self.len += 1;
    if let Some(index) = self.free.pop() {
      let slot = &mut self.slots[index as usize];
      debug_assert!(slot.value.is_none(), "free list points at an occupied slot");
      slot.value = Some(value);
      return Handle {
        index,
        generation: slot.generation,
      };
    }
    let index = self.slots.len() as u32;
    self.slots.push(Slot {
      generation: 0,
      value: Some(value),
    });
    Handle {
      index,
      generation: 0,
    }
  }

  /// Removes and returns the value behind `handle`, or `None` if the handle is stale.
  pub fn remove(&mut self, handle: Handle) -> Option<T> {
    let slot = self.slots.get_mut(handle.index as usize)?;
    if slot.generation != handle.generation {
      return None;
    }
    let value = slot.value.take()?;
    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(handle.index);
    self.len -= 1;
    Some(value)
  }

  /// Returns `true` if `handle` still refers to a live value.
  pub fn contains(&self, handle: Handle) -> bool {
    self.get(handle).is_some()
  }

  /// Resolves `handle`.
  pub fn get(&self, handle: Handle) -> Option<&T> {
    self
      .slots
      .get(handle.index as usize)
      .filter(|slot| slot.generation == handle.generation)
      .and_then(|slot| slot.value.as_ref())
  }

  /// Resolves `handle` mutably.
  pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
    self
      .slots
      .get_mut(handle.index as usize)
      .filter(|slot| slot.generation == handle.generation)
      .and_then(|slot| slot.value.as_mut())
  }

  /// Iterates over live values with their handles, in slot order.
  pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
    self.slots.iter().enumerate().filter_map(|(index, slot)| {
      slot.value.as_ref().map(|value| {
        (
          Handle {
            index: index as u32,
            generation: slot.generation,
          },
          value,
        )
      })
    })
  }

  /// Iterates mutably over live values with their handles, in slot order.
  pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
    self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
      let generation = slot.generation;
      slot.value.as_mut().map(|value| {
        (
          Handle {
            index: index as u32,
            generation,
          },
          value,
        )
      })
    })
  }
}
