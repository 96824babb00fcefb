// NVS-backed persistence for the saved-locations list.
//
// The whole list is stored as one JSON blob under a single key. Writes go
// through the LocationStore trait so the service core stays host-testable.

use anyhow::{Context, Result};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use log::{info, warn};

use crate::nav::SavedLocation;
use crate::storage::LocationStore;

const NVS_NAMESPACE: &str = "nav_config";
const LOCATIONS_KEY: &str = "locations";

// Sized for a few dozen entries with 32-byte names; NVS blobs cap out well
// above this.
const LOAD_BUFFER_SIZE: usize = 4096;

pub struct NvsLocationStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsLocationStore {
    /// Opens the navigation namespace on the provided NVS partition. The
    /// partition is shared with the BT stack, so the caller hands in a clone
    /// instead of this module taking the singleton.
    pub fn new(nvs_partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)
            .context("failed to open NVS namespace for saved locations")?;
        info!("location storage initialized");
        Ok(Self { nvs })
    }

    pub fn clear(&mut self) -> Result<()> {
        self.nvs
            .remove(LOCATIONS_KEY)
            .context("failed to clear saved locations")?;
        info!("saved locations cleared from storage");
        Ok(())
    }
}

impl LocationStore for NvsLocationStore {
    fn load(&mut self) -> Result<Vec<SavedLocation>> {
        let mut buffer = [0u8; LOAD_BUFFER_SIZE];
        let json = self
            .nvs
            .get_str(LOCATIONS_KEY, &mut buffer)
            .context("failed to read saved locations from NVS")?;
        let Some(json) = json else {
            info!("no saved locations in storage, starting empty");
            return Ok(Vec::new());
        };
        match serde_json::from_str(json) {
            Ok(locations) => Ok(locations),
            Err(e) => {
                // A corrupt blob should not brick the device; start over.
                warn!("stored locations are unreadable ({}), starting empty", e);
                Ok(Vec::new())
            }
        }
    }

    fn save(&mut self, locations: &[SavedLocation]) -> Result<()> {
        let json =
            serde_json::to_string(locations).context("failed to serialize saved locations")?;
        self.nvs
            .set_str(LOCATIONS_KEY, &json)
            .context("failed to write saved locations to NVS")?;
        info!("persisted {} saved locations", locations.len());
        Ok(())
    }
}
