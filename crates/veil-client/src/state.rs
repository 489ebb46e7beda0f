//! Connection state

use std::fmt;

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// A connect or disconnect is underway
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Disconnecting)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Why the last connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectReason {
    #[default]
    None,
    UserRequested,
    /// The proxy process died while connected
    ProcessExited,
    /// Settings changed and require a reconnect
    SettingsChanged,
}

impl DisconnectReason {
    pub fn description(&self) -> &'static str {
        match self {
            DisconnectReason::None => "none",
            DisconnectReason::UserRequested => "user requested",
            DisconnectReason::ProcessExited => "proxy process exited",
            DisconnectReason::SettingsChanged => "settings changed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Disconnected.is_transitioning());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(DisconnectReason::ProcessExited.to_string(), "proxy process exited");
    }
}
