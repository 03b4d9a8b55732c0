use crate::config::PollBudget;
use crate::driver::Delay;
use crate::Error;

/// Outcome of a polling loop that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Polled {
    /// The condition held after this many attempts.
    Ready(usize),
    /// The budget was used up without the condition holding.
    Exhausted,
}

/// Checks `attempt` until it reports readiness or the budget is used up.
///
/// `delay` is invoked with the budget's interval between two consecutive
/// attempts, never after the last one. An error returned by `attempt` aborts
/// the loop immediately.
pub(crate) fn poll_until(
    budget: &PollBudget,
    delay: &dyn Delay,
    mut attempt: impl FnMut(usize) -> Result<bool, Error>,
) -> Result<Polled, Error> {
    for n in 1..=budget.attempts {
        if attempt(n)? {
            return Ok(Polled::Ready(n));
        }

        if n < budget.attempts {
            delay.delay(budget.interval);
        }
    }

    Ok(Polled::Exhausted)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fake::RecordingDelay;

    const BUDGET: PollBudget = PollBudget {
        attempts: 4,
        interval: Duration::from_millis(25),
    };

    #[test]
    fn ready_on_first_attempt_does_not_wait() {
        let delay = RecordingDelay::new();

        let polled = poll_until(&BUDGET, &delay, |_| Ok(true)).unwrap();

        assert_eq!(polled, Polled::Ready(1));
        assert_eq!(delay.count(), 0);
    }

    #[test]
    fn waits_between_attempts() {
        let delay = RecordingDelay::new();

        let polled = poll_until(&BUDGET, &delay, |n| Ok(n == 3)).unwrap();

        assert_eq!(polled, Polled::Ready(3));
        assert_eq!(delay.total(), Duration::from_millis(50));
    }

    #[test]
    fn exhausts_after_budget() {
        let delay = RecordingDelay::new();
        let mut attempts = 0;

        let polled = poll_until(&BUDGET, &delay, |_| {
            attempts += 1;
            Ok(false)
        })
        .unwrap();

        assert_eq!(polled, Polled::Exhausted);
        assert_eq!(attempts, 4);
        assert_eq!(delay.count(), 3);
    }

    #[test]
    fn error_aborts_immediately() {
        let delay = RecordingDelay::new();
        let mut attempts = 0;

        let result = poll_until(&BUDGET, &delay, |_| {
            attempts += 1;
            Err(Error::GlobalError(-1))
        });

        assert!(matches!(result, Err(Error::GlobalError(-1))));
        assert_eq!(attempts, 1);
        assert_eq!(delay.count(), 0);
    }
}
