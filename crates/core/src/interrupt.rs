//! Non-local exits out of engine steps, and the replay block that absorbs restarts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Interrupt {
    /// The game was force-relaunched; whatever was in flight must be replayed from a safe point.
    #[error("game restarted")]
    Restart,
    /// Cooperative stop requested by the operator.
    #[error("stop requested")]
    Stop,
    /// Unusable action in quest data. The stop flag is already raised.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

pub type Step<T> = Result<T, Interrupt>;

type Op<'a, S> = Box<dyn FnMut(&mut S) -> Step<()> + 'a>;

/// An ordered block of operations replayed from its first entry whenever one
/// of them raises [`Interrupt::Restart`].
pub struct Sequence<'a, S> {
    ops: Vec<Op<'a, S>>,
}

impl<'a, S> Sequence<'a, S> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn then<F>(mut self, op: F) -> Self
    where
        F: FnMut(&mut S) -> Step<()> + 'a,
    {
        self.ops.push(Box::new(op));
        self
    }

    /// Runs every op in order. `Stop` and `Fatal` propagate.
    pub fn run(mut self, state: &mut S) -> Step<()> {
        'replay: loop {
            for op in self.ops.iter_mut() {
                match op(state) {
                    Ok(()) => {}
                    Err(Interrupt::Restart) => continue 'replay,
                    Err(other) => return Err(other),
                }
            }
            return Ok(());
        }
    }
}

impl<S> Default for Sequence<'_, S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_replays_from_first_op() {
        let mut log: Vec<&'static str> = Vec::new();
        let mut failed_once = false;
        Sequence::new()
            .then(|log: &mut Vec<&'static str>| {
                log.push("open");
                Ok(())
            })
            .then(|log: &mut Vec<&'static str>| {
                log.push("search");
                Ok(())
            })
            .then(|log: &mut Vec<&'static str>| {
                log.push("confirm");
                if failed_once {
                    Ok(())
                } else {
                    failed_once = true;
                    Err(Interrupt::Restart)
                }
            })
            .then(|log: &mut Vec<&'static str>| {
                log.push("leave");
                Ok(())
            })
            .run(&mut log)
            .unwrap();

        assert_eq!(log, ["open", "search", "confirm", "open", "search", "confirm", "leave"]);
    }

    #[test]
    fn stop_propagates_without_replay() {
        let mut calls = 0u32;
        let result = Sequence::new()
            .then(|calls: &mut u32| {
                *calls += 1;
                Ok(())
            })
            .then(|_: &mut u32| Err(Interrupt::Stop))
            .run(&mut calls);
        assert!(matches!(result, Err(Interrupt::Stop)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn fatal_propagates() {
        let result = Sequence::new()
            .then(|_: &mut ()| Err(Interrupt::Fatal(anyhow::anyhow!("bad fallback"))))
            .run(&mut ());
        assert!(matches!(result, Err(Interrupt::Fatal(_))));
    }
}
