use super::unit::ServiceUnit;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Healthy,
    Failed,
}

/// Start ordering and failure propagation between units.
///
/// A unit may start once every unit it `requires` is healthy, and must be
/// stopped when any unit it is `part_of` fails.
#[derive(Debug, Default)]
pub struct DependencyGate {
    health: HashMap<String, Health>,
}

impl DependencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, unit: &str, health: Health) {
        self.health.insert(normalize(unit), health);
    }

    pub fn health(&self, unit: &str) -> Health {
        self.health
            .get(&normalize(unit))
            .copied()
            .unwrap_or(Health::Unknown)
    }

    /// Requirements of `unit` that are not healthy yet.
    pub fn blocking<'a>(&self, unit: &'a ServiceUnit) -> Vec<&'a str> {
        unit.requires
            .iter()
            .filter(|dep| self.health(dep) != Health::Healthy)
            .map(String::as_str)
            .collect()
    }

    pub fn ready(&self, unit: &ServiceUnit) -> bool {
        self.blocking(unit).is_empty()
    }

    pub fn must_stop(&self, unit: &ServiceUnit) -> bool {
        unit.part_of
            .iter()
            .any(|dep| self.health(dep) == Health::Failed)
    }
}

fn normalize(unit: &str) -> String {
    if unit.contains('.') {
        unit.to_string()
    } else {
        format!("{}.service", unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ResourceLimits, RestartPolicy};

    fn workload() -> ServiceUnit {
        ServiceUnit::build(
            "workload",
            "/usr/local/bin/run",
            vec!["docker.service".into()],
            RestartPolicy::default(),
            ResourceLimits::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_waits_for_requirement() {
        let mut gate = DependencyGate::new();
        let unit = workload();
        assert!(!gate.ready(&unit));
        assert_eq!(gate.blocking(&unit), vec!["docker.service"]);

        gate.observe("docker", Health::Healthy);
        assert!(gate.ready(&unit));
        assert!(!gate.must_stop(&unit));
    }

    #[test]
    fn test_failure_propagates() {
        let mut gate = DependencyGate::new();
        let unit = workload();
        gate.observe("docker.service", Health::Healthy);
        gate.observe("docker.service", Health::Failed);
        assert!(gate.must_stop(&unit));
        assert!(!gate.ready(&unit));
    }
}
