//! DIRECT transport variant: no wire session. Media and messages are
//! injected and extracted through the payload channel.

use serde::{Deserialize, Serialize};

/// Creation data of a direct transport.
#[derive(Debug, Copy, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectTransportOptions {
    /// Maximum allowed size for messages.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,
}

fn default_max_message_size() -> u32 {
    262_144
}

impl Default for DirectTransportOptions {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct DirectTransportData {
    pub(crate) max_message_size: u32,
}
