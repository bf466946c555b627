//! Operator-supplied game-specific message

use crate::codec::{truncate_utf8, MAX_GAME_DATA_LEN};
use parking_lot::RwLock;
use tracing::{info, warn};

/// Latest game data string, read once per outgoing packet
#[derive(Debug, Default)]
pub struct GameData {
    value: RwLock<String>,
}

impl GameData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored string wholesale
    pub fn set(&self, data: &str) {
        let bounded = truncate_utf8(data, MAX_GAME_DATA_LEN);
        if bounded.len() < data.len() {
            warn!("Game data truncated from {} to {} bytes", data.len(), bounded.len());
        }
        *self.value.write() = bounded.to_string();
        info!("Game data set to '{}'", bounded);
    }

    pub fn get(&self) -> String {
        self.value.read().clone()
    }
}
