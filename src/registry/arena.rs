//! Slot storage addressed by generation-checked indices
//!
//! Removing a value bumps its slot's generation, so an index handed out before the removal
//! never matches whatever gets stored in the slot next.

/// Index into an [`Arena`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Index {
    /// Position in the slot list
    slot: u32,
    /// Generation the slot had when the value was inserted
    generation: u32,
}
impl Index {
    /// Position in the arena's slot list
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Generation this index is valid for
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A single slot
#[derive(Debug)]
struct Slot<T> {
    /// Current generation of the slot
    generation: u32,
    /// Value, `None` while the slot is free
    value: Option<T>,
}

/// Generational arena
#[derive(Debug)]
pub struct Arena<T> {
    /// All slots ever allocated
    slots: Vec<Slot<T>>,
    /// Free slots, reused last-in first-out
    free: Vec<u32>,
    /// Number of occupied slots
    len: usize,
}
impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}
impl<T> Arena<T> {
    /// Creates an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the index it can be found at
    pub fn insert(&mut self, value: T) -> Index {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return Index {
                slot,
                generation: entry.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Index {
            slot,
            generation: 0,
        }
    }

    /// Looks up a value, `None` if the index is stale
    pub fn get(&self, index: Index) -> Option<&T> {
        self.slots
            .get(index.slot as usize)
            .filter(|entry| entry.generation == index.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Looks up a value mutably, `None` if the index is stale
    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        self.slots
            .get_mut(index.slot as usize)
            .filter(|entry| entry.generation == index.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    /// Whether `index` still refers to a stored value
    pub fn contains(&self, index: Index) -> bool {
        self.get(index).is_some()
    }

    /// Takes a value out, invalidating every copy of `index`
    pub fn remove(&mut self, index: Index) -> Option<T> {
        let entry = self.slots.get_mut(index.slot as usize)?;
        if entry.generation != index.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(index.slot);
        self.len -= 1;
        Some(value)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over stored values and their indices
    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    Index {
                        slot: slot as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }

    /// Indices of every stored value
    pub fn indices(&self) -> Vec<Index> {
        self.iter().map(|(index, _)| index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Arena;

    #[test]
    /// Reused slots don't answer to indices from before the removal
    fn test_stale_index() {
        let mut arena = Arena::new();
        let first = arena.insert("first");
        assert_eq!(arena.get(first), Some(&"first"));

        assert_eq!(arena.remove(first), Some("first"));
        assert_eq!(arena.get(first), None);
        assert!(arena.is_empty());

        let second = arena.insert("second");
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(second), Some(&"second"));
    }

    #[test]
    /// Iteration only yields live values
    fn test_iter() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);
        arena.remove(b);

        let live: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, [1, 3]);
        assert_eq!(arena.indices(), [a, c]);
        assert_eq!(arena.len(), 2);

        *arena.get_mut(c).unwrap() = 30;
        assert_eq!(arena.get(c), Some(&30));
        assert!(arena.contains(a));
        assert!(!arena.contains(b));
    }
}
