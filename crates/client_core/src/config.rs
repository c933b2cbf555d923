use std::{path::PathBuf, time::Duration};

use shared::{
    domain::ProcessKind,
    protocol::{ENV_SERVER_IP, ENV_USERNAME},
};

use crate::launcher::LaunchSpec;

/// Line the room server logs once its sockets are bound.
pub const DEFAULT_SERVER_READY_MARKER: &str = "Сервер запущен на порту";
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub server_program: PathBuf,
    pub client_program: PathBuf,
    /// `None` disables the marker; the server is then Running right after spawn.
    pub server_ready_marker: Option<String>,
    pub settle_delay: Duration,
    pub grace_period: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_program: PathBuf::from(format!("server{}", std::env::consts::EXE_SUFFIX)),
            client_program: PathBuf::from(format!("client{}", std::env::consts::EXE_SUFFIX)),
            server_ready_marker: Some(DEFAULT_SERVER_READY_MARKER.to_string()),
            settle_delay: DEFAULT_SETTLE_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl BridgeConfig {
    pub fn server_spec(&self) -> LaunchSpec {
        let spec = LaunchSpec::new(ProcessKind::Server, &self.server_program);
        match &self.server_ready_marker {
            Some(marker) => spec.ready_marker(marker.clone(), self.settle_delay),
            None => spec,
        }
    }

    /// Endpoint and identity travel in the environment so stdin carries protocol traffic only.
    pub fn client_spec(&self, endpoint: &str, username: &str) -> LaunchSpec {
        LaunchSpec::new(ProcessKind::Client, &self.client_program)
            .env(ENV_SERVER_IP, endpoint)
            .env(ENV_USERNAME, username)
    }
}
