use crate::optime::OpTimeWithHash;
use std::sync::Mutex;
use tracing::debug;

/// Pick the host to clone from.
pub trait SyncSourceSelector: Send + Sync {
    /// `None` when no usable sync source is known right now.
    fn choose_new_sync_source(&self, last_fetched: &OpTimeWithHash) -> Option<String>;
}

/// Rotate through a fixed list of hosts, one per call.
#[derive(Debug)]
pub struct StaticSyncSourceSelector {
    hosts: Vec<String>,
    next: Mutex<usize>,
}

impl StaticSyncSourceSelector {
    pub fn new(hosts: Vec<String>) -> Self {
        StaticSyncSourceSelector {
            hosts,
            next: Mutex::new(0),
        }
    }
}

impl SyncSourceSelector for StaticSyncSourceSelector {
    fn choose_new_sync_source(&self, last_fetched: &OpTimeWithHash) -> Option<String> {
        if self.hosts.is_empty() {
            return None;
        }
        let mut next = self.next.lock().unwrap();
        let host = self.hosts[*next % self.hosts.len()].clone();
        *next = (*next + 1) % self.hosts.len();
        debug!(%host, %last_fetched, "Chose sync source.");
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_hosts() {
        let selector =
            StaticSyncSourceSelector::new(vec!["a:27017".to_string(), "b:27017".to_string()]);
        let last = OpTimeWithHash::null();
        assert_eq!(selector.choose_new_sync_source(&last).unwrap(), "a:27017");
        assert_eq!(selector.choose_new_sync_source(&last).unwrap(), "b:27017");
        assert_eq!(selector.choose_new_sync_source(&last).unwrap(), "a:27017");
    }

    #[test]
    fn test_no_hosts() {
        let selector = StaticSyncSourceSelector::new(vec![]);
        assert!(selector
            .choose_new_sync_source(&OpTimeWithHash::null())
            .is_none());
    }
}
