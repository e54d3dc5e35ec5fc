pub mod config_file;
pub mod supervisor;

use serde::{Deserialize, Serialize};

pub use config_file::{ConfigSynchronizer, ProxyDefaults};
pub use supervisor::{ProcessSupervisor, SupervisorOptions};

// Proxy status structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub port: u16,
}

impl ProxyStatus {
    pub fn new(port: u16) -> Self {
        Self { running: false, port }
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// OpenAI-compatible base URL handed to agents.
    pub fn api_endpoint(&self) -> String {
        format!("{}/v1", self.endpoint())
    }
}

impl Default for ProxyStatus {
    fn default() -> Self {
        Self::new(crate::settings::DEFAULT_PORT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessPhase {
    Stopped,
    Starting,
    Running,
}
