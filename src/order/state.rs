//! Order lifecycle bookkeeping.
//!
//! An order only moves forward: pending, ready, processing, then one of the
//! terminal states. A poll that reports an earlier state than one already
//! observed means the CA and this client disagree about the order, which is
//! not recoverable by waiting.

use crate::{
    api::OrderStatus,
    error::{Error, Result},
};

/// Position of a state along the order lifecycle. Terminal states share the
/// top rank; reaching either one ends polling.
fn rank(status: OrderStatus) -> u8 {
    match status {
        OrderStatus::Pending => 0,
        OrderStatus::Ready => 1,
        OrderStatus::Processing => 2,
        OrderStatus::Valid | OrderStatus::Invalid => 3,
    }
}

pub(crate) fn is_terminal(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Valid | OrderStatus::Invalid)
}

/// Folds a freshly observed state into the current one.
///
/// Returns the observed state when it is the same or later than `current`,
/// and an error when the CA reports a regression.
pub(crate) fn advance(current: OrderStatus, observed: OrderStatus) -> Result<OrderStatus> {
    if rank(observed) >= rank(current) {
        Ok(observed)
    } else {
        Err(Error::MalformedResponse(format!(
            "order state went backwards: {current:?} -> {observed:?}",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 5] = [
        OrderStatus::Pending,
        OrderStatus::Ready,
        OrderStatus::Processing,
        OrderStatus::Valid,
        OrderStatus::Invalid,
    ];

    #[test]
    fn same_state_is_allowed() {
        for status in ALL {
            assert_eq!(advance(status, status).unwrap(), status);
        }
    }

    #[test]
    fn forward_moves_are_allowed() {
        for current in ALL {
            for observed in ALL {
                if rank(observed) >= rank(current) {
                    assert_eq!(advance(current, observed).unwrap(), observed);
                }
            }
        }
    }

    #[test]
    fn regressions_are_rejected() {
        for current in ALL {
            for observed in ALL {
                if rank(observed) < rank(current) {
                    assert!(advance(current, observed).is_err());
                }
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(is_terminal(OrderStatus::Valid));
        assert!(is_terminal(OrderStatus::Invalid));
        assert!(!is_terminal(OrderStatus::Pending));
        assert!(!is_terminal(OrderStatus::Ready));
        assert!(!is_terminal(OrderStatus::Processing));
    }

    #[test]
    fn ready_after_processing_to_valid_path() {
        let mut state = OrderStatus::Pending;
        for observed in [
            OrderStatus::Pending,
            OrderStatus::Ready,
            OrderStatus::Processing,
            OrderStatus::Processing,
            OrderStatus::Valid,
        ] {
            state = advance(state, observed).unwrap();
        }
        assert_eq!(state, OrderStatus::Valid);
    }
}
