use serde::Serialize;

/// Session lifecycle. Only the channel state machine moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Draining,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Disconnected => "DISCONNECTED",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Handshaking => "HANDSHAKING",
            ChannelState::Ready => "READY",
            ChannelState::Draining => "DRAINING",
        }
    }

    pub fn is_ready(self) -> bool {
        self == ChannelState::Ready
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
