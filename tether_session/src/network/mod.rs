//! Network path observation.
//!
//! [`NetworkObserver`] turns a stream of raw path observations into
//! "a new validated network is available" signals. The platform source of
//! those observations lives in [`monitor`].

pub mod monitor;

pub use monitor::{MonitorOptions, route_monitor};

/// One report from the platform about the active network path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkObservation {
    pub network_id: String,
    pub validated: bool,
}

impl NetworkObservation {
    pub fn new(network_id: impl Into<String>, validated: bool) -> Self {
        Self {
            network_id: network_id.into(),
            validated,
        }
    }
}

/// Debounces capability reports into validated-network transitions.
///
/// While unbound every observation is ignored. Unbinding forgets the
/// current path, so a fresh bind starts with no memory.
#[derive(Debug, Default)]
pub struct NetworkObserver {
    bound: bool,
    current: Option<String>,
    validated: bool,
}

impl NetworkObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self) {
        self.bound = true;
    }

    pub fn unbind(&mut self) {
        self.bound = false;
        self.current = None;
        self.validated = false;
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Feed one observation. Returns `true` when the network change
    /// notification should fire.
    pub fn observe(&mut self, observation: &NetworkObservation) -> bool {
        if !self.bound {
            return false;
        }

        match self.current.as_deref() {
            None => {
                // The first report after binding only records the path.
                self.current = Some(observation.network_id.clone());
                self.validated = observation.validated;
                return false;
            }
            Some(current) if current != observation.network_id => {
                self.current = Some(observation.network_id.clone());
                self.validated = false;
            }
            Some(_) => {}
        }

        // Validation latches per path; only a new path resets it.
        if !self.validated && observation.validated {
            self.validated = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fire_count(observer: &mut NetworkObserver, sequence: &[(&str, bool)]) -> usize {
        sequence
            .iter()
            .filter(|(id, validated)| observer.observe(&NetworkObservation::new(*id, *validated)))
            .count()
    }

    fn bound() -> NetworkObserver {
        let mut observer = NetworkObserver::new();
        observer.bind();
        observer
    }

    #[test]
    fn test_validation_on_same_path_fires_once() {
        let mut observer = bound();
        let fired = fire_count(
            &mut observer,
            &[("wlan0", false), ("wlan0", true), ("wlan0", true)],
        );
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_first_report_never_fires() {
        let mut observer = bound();
        assert_eq!(fire_count(&mut observer, &[("wlan0", true)]), 0);
    }

    #[test]
    fn test_migration_fires_once_new_path_validates() {
        let mut observer = bound();
        let fired = fire_count(
            &mut observer,
            &[("netA", true), ("netB", false), ("netB", true)],
        );
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_migration_to_validated_path_fires_immediately() {
        let mut observer = bound();
        let fired = fire_count(&mut observer, &[("wlan0", true), ("wwan0", true)]);
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_each_migrated_path_fires_once_validated() {
        let mut observer = bound();
        let fired = fire_count(
            &mut observer,
            &[
                ("netA", false),
                ("netA", true),
                ("netB", false),
                ("netB", true),
                ("netB", true),
            ],
        );
        assert_eq!(fired, 2);
    }

    #[test]
    fn test_validation_latches_on_same_path() {
        let mut observer = bound();
        let fired = fire_count(
            &mut observer,
            &[("eth0", false), ("eth0", true), ("eth0", false), ("eth0", true)],
        );
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_unbound_observer_ignores_everything() {
        let mut observer = NetworkObserver::new();
        assert_eq!(fire_count(&mut observer, &[("eth0", false), ("eth0", true)]), 0);
    }

    #[test]
    fn test_unbind_forgets_path() {
        let mut observer = bound();
        fire_count(&mut observer, &[("eth0", false)]);

        observer.unbind();
        observer.bind();

        // eth0 is new again, so a validated report is only recorded.
        assert_eq!(fire_count(&mut observer, &[("eth0", true)]), 0);
    }
}
