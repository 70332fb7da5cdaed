//! One transfer session per device
//!
//! The registry belongs to a [`crate::Host`]; a serial number stays
//! registered for as long as its [`SessionGuard`] lives.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{DfuError, Result};

/// Set of serial numbers with an active session
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `serial`, failing with `SessionBusy` if it is already claimed
    pub fn acquire(&self, serial: &str) -> Result<SessionGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(serial.to_string()) {
            return Err(DfuError::SessionBusy {
                serial: serial.to_string(),
            });
        }
        log::trace!("session: {} claimed", serial);
        Ok(SessionGuard {
            registry: self.clone(),
            serial: serial.to_string(),
        })
    }

    /// Whether `serial` has an active session
    pub fn is_active(&self, serial: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(serial)
    }
}

/// Releases its serial number when dropped
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    serial: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.serial);
        log::trace!("session: {} released", self.serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_per_serial() {
        let registry = SessionRegistry::new();
        let guard = registry.acquire("SN1").unwrap();
        assert!(matches!(registry.acquire("SN1"), Err(DfuError::SessionBusy { .. })));
        let _other = registry.acquire("SN2").unwrap();
        drop(guard);
        assert!(!registry.is_active("SN1"));
        assert!(registry.acquire("SN1").is_ok());
    }
}
