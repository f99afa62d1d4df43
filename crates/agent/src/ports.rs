//! Per-project port leasing from a bounded range.

use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
    sync::Mutex,
};

use octo_protocol::{PORT_RANGE_MAX, PORT_RANGE_MIN};

#[derive(Debug, thiserror::Error)]
#[error("no free ports in the configured range")]
pub struct PortExhausted;

pub struct PortAllocator {
    range: RangeInclusive<u16>,
    leases: Mutex<HashMap<String, u16>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_range() -> Self {
        Self::new(PORT_RANGE_MIN..=PORT_RANGE_MAX)
    }

    /// The held lease if any, otherwise the lowest free port.
    pub fn allocate(&self, project_id: &str) -> Result<u16, PortExhausted> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&port) = leases.get(project_id) {
            return Ok(port);
        }
        let used: HashSet<u16> = leases.values().copied().collect();
        for port in self.range.clone() {
            if !used.contains(&port) {
                leases.insert(project_id.to_string(), port);
                return Ok(port);
            }
        }
        Err(PortExhausted)
    }

    pub fn release(&self, project_id: &str) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.remove(project_id);
    }

    pub fn lease(&self, project_id: &str) -> Option<u16> {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.get(project_id).copied()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port() {
        let allocator = PortAllocator::new(5000..=5002);
        assert_eq!(allocator.allocate("a").unwrap(), 5000);
        assert_eq!(allocator.allocate("b").unwrap(), 5001);
        assert_eq!(allocator.allocate("c").unwrap(), 5002);
    }

    #[test]
    fn reallocation_returns_held_lease() {
        let allocator = PortAllocator::new(5000..=5002);
        assert_eq!(allocator.allocate("a").unwrap(), 5000);
        assert_eq!(allocator.allocate("a").unwrap(), 5000);
        assert_eq!(allocator.lease("a"), Some(5000));
    }

    #[test]
    fn exhaustion_then_release_recovers() {
        let allocator = PortAllocator::new(5000..=5001);
        allocator.allocate("a").unwrap();
        allocator.allocate("b").unwrap();
        assert!(allocator.allocate("c").is_err());

        allocator.release("a");
        assert!(allocator.lease("a").is_none());
        assert_eq!(allocator.allocate("c").unwrap(), 5000);
    }
}
