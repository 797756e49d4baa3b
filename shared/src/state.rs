// brightness_state.json: original brightness of every monitor that is
// currently dimmed. A non-empty file at startup means the previous run ended
// without restoring.

use crate::store::{read_json, write_json, StoreError};
use log::warn;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct BrightnessStateFile {
    path: PathBuf,
}

impl BrightnessStateFile {
    pub fn in_dir(dir: &Path) -> Self {
        Self::at(dir.join("brightness_state.json"))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or corrupt state reads as "nothing to restore".
    pub fn load_state(&self) -> HashMap<String, u32> {
        match read_json(&self.path) {
            Ok(Some(state)) => state,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("Ignoring brightness state: {}", e);
                HashMap::new()
            }
        }
    }

    pub fn save_state(&self, state: &HashMap<String, u32>) -> Result<(), StoreError> {
        write_json(&self.path, state)
    }
}
