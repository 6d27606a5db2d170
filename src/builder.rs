//! Rebuild pipeline for purgeable content.
//!
//! Purged content is never restored from a copy; it is defined as the
//! replay of an ordered chain of build steps against a zeroed buffer. Steps
//! appended later run later, so the most recent modification wins. Because
//! every replay starts from zero, steps must be deterministic: equivalent
//! invocations must produce identical bytes.

use crate::error::{Error, Result};

/// A single reconstruction step.
///
/// A step rewrites (part of) the content buffer and reports success. Steps
/// always see the full content region and run under the owning object's
/// write lock, never concurrently with each other or with readers.
///
/// Any `Fn(&mut [u8]) -> bool + Send + Sync` closure is a step; state that
/// C-style callbacks would pass as an opaque parameter is simply captured.
pub trait BuildStep: Send + Sync {
    /// Apply this step to the content buffer.
    ///
    /// Returning `false` aborts the replay.
    fn apply(&self, data: &mut [u8]) -> bool;
}

impl<F> BuildStep for F
where
    F: Fn(&mut [u8]) -> bool + Send + Sync,
{
    fn apply(&self, data: &mut [u8]) -> bool {
        self(data)
    }
}

/// Ordered chain of build steps whose replay defines the content.
///
/// Steps are appended at the tail and replayed head-to-tail.
#[derive(Default)]
pub struct BuilderChain {
    steps: Vec<Box<dyn BuildStep>>,
}

impl BuilderChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Link a step at the tail of the chain.
    pub fn append(&mut self, step: Box<dyn BuildStep>) {
        self.steps.push(step);
    }

    /// Number of steps in the chain.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the chain holds no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Replay every step in order against `data`.
    ///
    /// Stops at the first failing step; earlier steps' writes are left in
    /// place (the caller zeroes and retries on the next rebuild).
    pub fn build_all(&self, data: &mut [u8]) -> Result<()> {
        for (step, node) in self.steps.iter().enumerate() {
            if !node.apply(data) {
                tracing::warn!("rebuild step {} of {} failed", step, self.steps.len());
                return Err(Error::BuildFailed { step });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BuilderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderChain")
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_chain_builds() {
        let chain = BuilderChain::new();
        let mut buf = [0u8; 16];
        assert!(chain.build_all(&mut buf).is_ok());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_steps_run_in_append_order() {
        let mut chain = BuilderChain::new();
        chain.append(Box::new(|data: &mut [u8]| {
            data.fill(0x11);
            true
        }));
        chain.append(Box::new(|data: &mut [u8]| {
            data[0] = 0x22;
            true
        }));
        assert_eq!(chain.len(), 2);

        let mut buf = [0u8; 8];
        chain.build_all(&mut buf).unwrap();
        // The later step overwrote the earlier one where they overlap.
        assert_eq!(buf[0], 0x22);
        assert_eq!(buf[1], 0x11);
    }

    #[test]
    fn test_replay_aborts_on_failure() {
        let ran_after_failure = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&ran_after_failure);
        let mut chain = BuilderChain::new();
        chain.append(Box::new(|data: &mut [u8]| {
            data.fill(0xAA);
            true
        }));
        chain.append(Box::new(|_: &mut [u8]| false));
        chain.append(Box::new(move |_: &mut [u8]| {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        }));

        let mut buf = [0u8; 8];
        let err = chain.build_all(&mut buf).unwrap_err();
        assert!(matches!(err, Error::BuildFailed { step: 1 }));
        // The failing step did not stop the earlier one's writes, and the
        // step behind it never ran.
        assert_eq!(buf[0], 0xAA);
        assert_eq!(ran_after_failure.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_closure_captures_state() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&calls);
        let mut chain = BuilderChain::new();
        chain.append(Box::new(move |_: &mut [u8]| {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        }));

        let mut buf = [0u8; 4];
        chain.build_all(&mut buf).unwrap();
        chain.build_all(&mut buf).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
