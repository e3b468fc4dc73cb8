use std::marker::PhantomData;

/// A generational key into a [`SlotMap`]. Keys of removed entries never resolve again,
/// even after their slot has been reused.
pub struct SlotKey<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlotKey<T> {
    pub fn index(&self) -> u32 { self.index }
    pub fn generation(&self) -> u32 { self.generation }
}

// Manual impls so that `T` is not required to be Clone/Eq/etc.
impl<T> Clone for SlotKey<T> {
    fn clone(&self) -> Self { *self }
}
impl<T> Copy for SlotKey<T> {}
impl<T> PartialEq for SlotKey<T> {
    fn eq(&self, other: &Self) -> bool { self.index == other.index && self.generation == other.generation }
}
impl<T> Eq for SlotKey<T> {}
impl<T> std::hash::Hash for SlotKey<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}
impl<T> std::fmt::Debug for SlotKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}v{}", self.index, self.generation) }
}

struct Slot<V> {
    generation: u32,
    value: Option<V>,
}

/// An arena that hands out opaque generational keys.
/// Like the rest of util, the inner lock is only ever held for the duration of a map operation.
pub struct SlotMap<V> {
    inner: std::sync::RwLock<Inner<V>>,
}

struct Inner<V> {
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
    len: usize,
}

impl<V> Default for SlotMap<V> {
    fn default() -> Self { Self::new() }
}

impl<V> SlotMap<V> {
    pub fn new() -> Self { Self { inner: std::sync::RwLock::new(Inner { slots: Vec::new(), free: Vec::new(), len: 0 }) } }

    pub fn insert(&self, value: V) -> SlotKey<V> {
        let mut inner = self.inner.write().expect("Failed to lock the slot map");
        inner.len += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.value = Some(value);
            return SlotKey { index, generation: slot.generation, _marker: PhantomData };
        }
        let index = inner.slots.len() as u32;
        inner.slots.push(Slot { generation: 0, value: Some(value) });
        SlotKey { index, generation: 0, _marker: PhantomData }
    }

    pub fn remove(&self, key: SlotKey<V>) -> Option<V> {
        let mut inner = self.inner.write().expect("Failed to lock the slot map");
        let slot = inner.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(key.index);
        inner.len -= 1;
        value
    }

    pub fn contains_key(&self, key: SlotKey<V>) -> bool {
        let inner = self.inner.read().expect("Failed to lock the slot map");
        inner.slots.get(key.index as usize).is_some_and(|s| s.generation == key.generation && s.value.is_some())
    }

    pub fn len(&self) -> usize { self.inner.read().expect("Failed to lock the slot map").len }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<V: Clone> SlotMap<V> {
    pub fn get(&self, key: SlotKey<V>) -> Option<V> {
        let inner = self.inner.read().expect("Failed to lock the slot map");
        let slot = inner.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.clone()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().expect("Failed to lock the slot map").slots.iter().filter_map(|s| s.value.clone()).collect()
    }
}
