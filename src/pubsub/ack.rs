use std::fmt;

/// What a handler wants done with the delivery it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; remove it from the queue.
    Ack,
    /// Not processed now; put it back for redelivery.
    NackRequeue,
    /// Rejected; dead-letter it, or drop it if the queue has no dead-letter exchange.
    NackDiscard,
}

impl AckDecision {
    /// `None` for an ack, otherwise whether the nack asks for a requeue.
    pub fn requeue(self) -> Option<bool> {
        match self {
            AckDecision::Ack => None,
            AckDecision::NackRequeue => Some(true),
            AckDecision::NackDiscard => Some(false),
        }
    }
}

impl fmt::Display for AckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckDecision::Ack => "ack",
            AckDecision::NackRequeue => "nack-requeue",
            AckDecision::NackDiscard => "nack-discard",
        })
    }
}
