//! Process-wide table of live handles.
//!
//! A handle given to C is a token, not a pointer: the low bits select a slot
//! and the high bits carry the slot's generation. Destroying a handle bumps
//! the generation, so a stale or forged token never resolves.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tokio::runtime::Runtime as TokioRuntime;
use usm::ServiceManager;

const INDEX_BITS: u32 = 16;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
/// Largest generation that still fits above the index bits.
const MAX_GENERATION: usize = usize::MAX >> INDEX_BITS;

/// A manager together with the runtime its calls block on.
#[derive(Clone)]
pub(crate) struct HandleEntry {
    pub manager: Arc<ServiceManager>,
    pub tokio_rt: Arc<TokioRuntime>,
}

struct Slot {
    generation: usize,
    entry: Option<HandleEntry>,
}

#[derive(Default)]
pub(crate) struct HandleRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

static HANDLES: LazyLock<Mutex<HandleRegistry>> =
    LazyLock::new(|| Mutex::new(HandleRegistry::default()));

/// Addresses of service arrays handed out and not yet freed.
static LIVE_ARRAYS: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(Default::default);

/// Addresses of standalone strings handed out and not yet freed.
static LIVE_STRINGS: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(Default::default);

impl HandleRegistry {
    /// Store `entry` and return its token, or `None` when every slot is taken.
    pub fn insert(&mut self, entry: HandleEntry) -> Option<usize> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                // Index 0 is never issued so no token is zero.
                if self.slots.len() >= INDEX_MASK {
                    return None;
                }
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.entry = Some(entry);
        Some((slot.generation << INDEX_BITS) | (index + 1))
    }

    pub fn get(&self, token: usize) -> Option<HandleEntry> {
        let index = self.index_of(token)?;
        self.slots[index].entry.clone()
    }

    /// Invalidate `token`, returning its entry if it was live.
    pub fn remove(&mut self, token: usize) -> Option<HandleEntry> {
        let index = self.index_of(token)?;
        let slot = &mut self.slots[index];
        let entry = slot.entry.take()?;
        // A generation that would overflow retires the slot for good.
        if slot.generation < MAX_GENERATION {
            slot.generation += 1;
            self.free.push(index);
        }
        Some(entry)
    }

    fn index_of(&self, token: usize) -> Option<usize> {
        let index = (token & INDEX_MASK).checked_sub(1)?;
        let generation = token >> INDEX_BITS;
        let slot = self.slots.get(index)?;
        (slot.generation == generation && slot.entry.is_some()).then_some(index)
    }
}

pub(crate) fn register(entry: HandleEntry) -> Option<usize> {
    HANDLES.lock().insert(entry)
}

pub(crate) fn lookup(token: usize) -> Option<HandleEntry> {
    HANDLES.lock().get(token)
}

pub(crate) fn unregister(token: usize) -> Option<HandleEntry> {
    HANDLES.lock().remove(token)
}

pub(crate) fn track_array(addr: usize) {
    LIVE_ARRAYS.lock().insert(addr);
}

/// Forget a service array. `false` means it was never issued or is already freed.
pub(crate) fn release_array(addr: usize) -> bool {
    LIVE_ARRAYS.lock().remove(&addr)
}

pub(crate) fn track_string(addr: usize) {
    LIVE_STRINGS.lock().insert(addr);
}

/// Forget a returned string. `false` means it was never issued or is already freed.
pub(crate) fn release_string(addr: usize) -> bool {
    LIVE_STRINGS.lock().remove(&addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use usm::UsmConfig;
    use usm::process::NativeController;

    fn entry() -> HandleEntry {
        let manager =
            ServiceManager::new(UsmConfig::default(), Arc::new(NativeController::new())).unwrap();
        HandleEntry {
            manager: Arc::new(manager),
            tokio_rt: Arc::new(
                tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap(),
            ),
        }
    }

    #[test]
    fn test_tokens_are_nonzero_and_resolve() {
        let mut registry = HandleRegistry::default();
        let a = registry.insert(entry()).unwrap();
        let b = registry.insert(entry()).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert!(registry.get(a).is_some());
        assert!(registry.get(b).is_some());
    }

    #[test]
    fn test_removed_token_is_dead_even_after_slot_reuse() {
        let mut registry = HandleRegistry::default();
        let old = registry.insert(entry()).unwrap();
        assert!(registry.remove(old).is_some());
        assert!(registry.get(old).is_none());
        assert!(registry.remove(old).is_none());

        let new = registry.insert(entry()).unwrap();
        assert_ne!(old, new);
        assert_eq!(old & INDEX_MASK, new & INDEX_MASK);
        assert!(registry.get(old).is_none());
        assert!(registry.get(new).is_some());
    }

    #[test]
    fn test_array_release_is_single_shot() {
        track_array(0x1000);
        assert!(release_array(0x1000));
        assert!(!release_array(0x1000));
        assert!(!release_array(0x2000));
    }

    #[test]
    fn test_string_release_is_single_shot() {
        track_string(0x3000);
        assert!(!release_array(0x3000));
        assert!(release_string(0x3000));
        assert!(!release_string(0x3000));
    }

    #[test]
    fn test_forged_tokens_do_not_resolve() {
        let mut registry = HandleRegistry::default();
        let token = registry.insert(entry()).unwrap();
        assert!(registry.get(0).is_none());
        assert!(registry.get(token + 1).is_none());
        assert!(registry.get(token + (1 << INDEX_BITS)).is_none());
        assert!(registry.get(usize::MAX).is_none());
    }
}
