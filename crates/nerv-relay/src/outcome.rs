use nerv_core::error::ReasonCode;

/// Result of a send. Sends never fail with an error; every refusal is a
/// value here plus a telemetry signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport.
    Sent,
    /// Held in the outbox until the channel is READY.
    Queued,
    /// Delivered to local subscribers only (local mode).
    Delivered,
    /// Refused before anything happened (structure, capacity).
    Rejected(ReasonCode),
    /// Accepted for inspection and then discarded (channel state).
    Dropped(ReasonCode),
}

impl SendOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, SendOutcome::Sent | SendOutcome::Queued | SendOutcome::Delivered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SendOutcome::Sent => "sent",
            SendOutcome::Queued => "queued",
            SendOutcome::Delivered => "delivered",
            SendOutcome::Rejected(_) => "rejected",
            SendOutcome::Dropped(_) => "dropped",
        }
    }

    pub fn reason(self) -> Option<ReasonCode> {
        match self {
            SendOutcome::Rejected(r) | SendOutcome::Dropped(r) => Some(r),
            _ => None,
        }
    }
}
