//! Availability Snapshot: cached view of what one peer can serve, updated only from
//! status and pull responses.

use uuid::Uuid;

use crate::identity::DeviceId;

/// Facts carried by one status or pull response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub identity: Option<DeviceId>,
    /// Server instance token; counters from different instances are unrelated.
    pub instance: Option<Uuid>,
    pub content_type: Option<String>,
    pub items_count: u64,
}

/// How a report compares with what was cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Nothing cached yet.
    Unknown,
    Unchanged,
    /// Counter moved forward within the same server instance.
    Advanced,
    /// Counter went backwards or the server restarted: definitely changed.
    Reset,
}

impl Change {
    /// Whether pulling again could return something new.
    pub fn is_changed(self) -> bool {
        !matches!(self, Change::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("response came from {got}, expected {expected}")]
pub struct IdentityMismatch {
    pub expected: DeviceId,
    pub got: DeviceId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    identity: Option<DeviceId>,
    instance: Option<Uuid>,
    content_type: Option<String>,
    items_count: Option<u64>,
}

impl Availability {
    pub fn new(identity: Option<DeviceId>) -> Self {
        Self {
            identity,
            ..Self::default()
        }
    }

    pub fn identity(&self) -> Option<DeviceId> {
        self.identity
    }

    pub fn instance(&self) -> Option<Uuid> {
        self.instance
    }

    /// Content type last reported as available; `None` when empty or unknown.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn items_count(&self) -> Option<u64> {
        self.items_count
    }

    /// Count and instance to send with a conditional pull, when both are known.
    pub fn since(&self) -> Option<(u64, Uuid)> {
        Some((self.items_count?, self.instance?))
    }

    /// Compare a report with the cache without changing it.
    pub fn compare(&self, report: &StatusReport) -> Change {
        let Some(prev) = self.items_count else {
            return Change::Unknown;
        };
        let restarted = matches!(
            (self.instance, report.instance),
            (Some(a), Some(b)) if a != b
        );
        if restarted || report.items_count < prev {
            Change::Reset
        } else if report.items_count > prev {
            Change::Advanced
        } else {
            Change::Unchanged
        }
    }

    /// Fold a report into the cache. A report from a different device is rejected untouched.
    pub fn observe(&mut self, report: StatusReport) -> Result<Change, IdentityMismatch> {
        if let (Some(expected), Some(got)) = (self.identity, report.identity) {
            if expected != got {
                return Err(IdentityMismatch { expected, got });
            }
        }
        let change = self.compare(&report);
        if self.identity.is_none() {
            self.identity = report.identity;
        }
        if report.instance.is_some() {
            self.instance = report.instance;
        }
        self.content_type = report.content_type;
        self.items_count = Some(report.items_count);
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(count: u64, instance: Uuid) -> StatusReport {
        StatusReport {
            identity: None,
            instance: Some(instance),
            content_type: Some("text/plain; charset=utf-8".into()),
            items_count: count,
        }
    }

    #[test]
    fn counter_progression() {
        let inst = Uuid::new_v4();
        let mut a = Availability::new(None);
        assert_eq!(a.observe(report(0, inst)).unwrap(), Change::Unknown);
        assert_eq!(a.observe(report(0, inst)).unwrap(), Change::Unchanged);
        assert_eq!(a.observe(report(1, inst)).unwrap(), Change::Advanced);
        assert_eq!(a.items_count(), Some(1));
        assert_eq!(a.since(), Some((1, inst)));
    }

    #[test]
    fn decrease_means_changed() {
        let inst = Uuid::new_v4();
        let mut a = Availability::new(None);
        a.observe(report(5, inst)).unwrap();
        let change = a.observe(report(2, inst)).unwrap();
        assert_eq!(change, Change::Reset);
        assert!(change.is_changed());
    }

    #[test]
    fn restart_with_equal_count_is_changed() {
        let mut a = Availability::new(None);
        a.observe(report(1, Uuid::new_v4())).unwrap();
        assert_eq!(a.observe(report(1, Uuid::new_v4())).unwrap(), Change::Reset);
    }

    #[test]
    fn foreign_identity_rejected() {
        let me = DeviceId::generate();
        let mut a = Availability::new(Some(me));
        a.observe(report(3, Uuid::new_v4())).unwrap();
        let mut r = report(9, Uuid::new_v4());
        r.identity = Some(DeviceId::generate());
        assert!(a.observe(r).is_err());
        assert_eq!(a.items_count(), Some(3));
    }

    #[test]
    fn identity_learned_from_first_report() {
        let mut a = Availability::new(None);
        let id = DeviceId::generate();
        let mut r = report(0, Uuid::new_v4());
        r.identity = Some(id);
        a.observe(r).unwrap();
        assert_eq!(a.identity(), Some(id));
    }
}
