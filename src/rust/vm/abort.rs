// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::{
    atomic::{
        AtomicU32,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Values of the shared abort word polled by a running VM.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    None = 0,
    /// Return control to the scheduler at the next checkpoint, then carry on.
    Yield = 1,
    SilentTerminate = 2,
    Timeout = 3,
    Manually = 4,
}

/// Abort word shared between a VM group and everyone that may want to stop it.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicU32>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl AbortReason {
    /// Whether this reason ends the script rather than just pausing it.
    pub fn is_terminating(self) -> bool {
        !matches!(self, AbortReason::None | AbortReason::Yield)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::None => "none",
            AbortReason::Yield => "yield",
            AbortReason::SilentTerminate => "silent-terminate",
            AbortReason::Timeout => "timeout",
            AbortReason::Manually => "manually",
        }
    }
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> AbortReason {
        AbortReason::from(self.0.load(Ordering::Acquire))
    }

    /// Overwrites the flag.
    pub fn set(&self, reason: AbortReason) {
        self.0.store(reason as u32, Ordering::Release);
    }

    /// Raises a terminating reason unless one is already set.
    pub fn raise(&self, reason: AbortReason) {
        debug_assert!(reason.is_terminating());
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            if AbortReason::from(current).is_terminating() {
                None
            } else {
                Some(reason as u32)
            }
        });
    }

    /// Requests a yield. Returns `false` if another reason is already pending.
    pub fn set_yield(&self) -> bool {
        let none: u32 = AbortReason::None as u32;
        match self
            .0
            .compare_exchange(none, AbortReason::Yield as u32, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == AbortReason::Yield as u32,
        }
    }

    /// Withdraws a pending yield request, leaving any other reason in place.
    pub fn clear_yield(&self) {
        let _ = self.0.compare_exchange(
            AbortReason::Yield as u32,
            AbortReason::None as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u32> for AbortReason {
    fn from(value: u32) -> Self {
        match value {
            0 => AbortReason::None,
            1 => AbortReason::Yield,
            2 => AbortReason::SilentTerminate,
            3 => AbortReason::Timeout,
            _ => AbortReason::Manually,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        AbortFlag,
        AbortReason,
    };
    use ::anyhow::Result;

    #[test]
    fn test_yield_does_not_mask_termination() -> Result<()> {
        let flag: AbortFlag = AbortFlag::new();
        crate::ensure_eq!(flag.set_yield(), true);
        crate::ensure_eq!(flag.get(), AbortReason::Yield);

        flag.raise(AbortReason::Timeout);
        crate::ensure_eq!(flag.get(), AbortReason::Timeout);

        // Neither a later timeout nor a yield request replaces a pending termination.
        flag.raise(AbortReason::Manually);
        crate::ensure_eq!(flag.set_yield(), false);
        flag.clear_yield();
        crate::ensure_eq!(flag.get(), AbortReason::Timeout);
        Ok(())
    }

    #[test]
    fn test_clear_yield() -> Result<()> {
        let flag: AbortFlag = AbortFlag::new();
        flag.set_yield();
        flag.clear_yield();
        crate::ensure_eq!(flag.get(), AbortReason::None);
        crate::ensure_eq!(AbortReason::None.is_terminating(), false);
        crate::ensure_eq!(AbortReason::SilentTerminate.is_terminating(), true);
        Ok(())
    }
}
