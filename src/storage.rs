//! Persistence seam for the saved-locations list.

use anyhow::Result;

use crate::nav::SavedLocation;

/// Backing store for the saved-locations list. The firmware binary plugs in
/// an NVS-backed implementation; tests use [`MemoryStore`].
///
/// Saves are deferred: mutations only mark the list dirty, and the main loop
/// writes the whole list once per loop at most, outside callback context.
pub trait LocationStore {
    fn load(&mut self) -> Result<Vec<SavedLocation>>;
    fn save(&mut self, locations: &[SavedLocation]) -> Result<()>;
}

/// In-memory store for host-side tests and bring-up without flash.
#[derive(Debug, Default)]
pub struct MemoryStore {
    locations: Vec<SavedLocation>,
    save_count: u32,
}

impl MemoryStore {
    pub fn new(locations: Vec<SavedLocation>) -> Self {
        Self {
            locations,
            save_count: 0,
        }
    }

    /// How many times `save` ran; lets tests assert persistence is deferred.
    pub fn save_count(&self) -> u32 {
        self.save_count
    }
}

impl LocationStore for MemoryStore {
    fn load(&mut self) -> Result<Vec<SavedLocation>> {
        Ok(self.locations.clone())
    }

    fn save(&mut self, locations: &[SavedLocation]) -> Result<()> {
        self.locations = locations.to_vec();
        self.save_count += 1;
        Ok(())
    }
}
