//! Confirmation state of a stored transaction.

/// Where a stored transaction sits in the confirmation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    /// Failed validation; the height field carries the error code.
    Invalid = 0,
    /// Stored without any validation context.
    Stored = 1,
    /// In the memory pool; the height field carries the fork rules it was
    /// validated under.
    Pooled = 2,
    /// Present in a secondary confirmation index, not yet fully confirmed.
    Indexed = 3,
    /// Confirmed at the recorded height and position.
    Confirmed = 4,
}

impl TransactionState {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::Stored),
            2 => Some(Self::Pooled),
            3 => Some(Self::Indexed),
            4 => Some(Self::Confirmed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_byte() {
        for state in [
            TransactionState::Invalid,
            TransactionState::Stored,
            TransactionState::Pooled,
            TransactionState::Indexed,
            TransactionState::Confirmed,
        ] {
            assert_eq!(TransactionState::from_u8(state as u8), Some(state));
        }
        assert_eq!(TransactionState::from_u8(5), None);
    }
}
