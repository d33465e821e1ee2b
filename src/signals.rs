use tokio::sync::broadcast;

/// Fleet-level events for observers such as a remediation hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetSignal {
    /// Consecutive probe failures just reached the target's retry limit.
    TargetDown {
        name: String,
        consecutive_failures: u32,
    },
    /// A target that was failing answered a probe again.
    TargetRecovered { name: String },
    Reconciled {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

pub type SignalSender = broadcast::Sender<FleetSignal>;

pub fn signal_channel(capacity: usize) -> SignalSender {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    tx
}

/// Sends without caring whether anyone is listening.
pub fn emit(sender: &SignalSender, signal: FleetSignal) {
    let _ = sender.send(signal);
}
