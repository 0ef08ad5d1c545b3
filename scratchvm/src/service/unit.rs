use scratchvm_shared::errors::{ScratchError, ScratchResult};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

/// Restart-on-failure rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Wait between a failed exit and the next start.
    pub delay: Duration,
    pub max_restarts: u32,
    /// Rolling window `max_restarts` is counted over.
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_restarts: 3,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// `LimitNOFILE`
    pub max_open_files: Option<u64>,
    /// `TasksMax`
    pub max_tasks: Option<u64>,
}

/// A supervised daemon definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnit {
    /// Unit name without the `.service` suffix.
    pub name: String,
    pub description: String,
    pub working_directory: Option<String>,
    pub command: String,
    pub after: Vec<String>,
    pub requires: Vec<String>,
    pub part_of: Vec<String>,
    pub restart: RestartPolicy,
    pub limits: ResourceLimits,
    pub wanted_by: Vec<String>,
}

impl ServiceUnit {
    /// Define a unit that starts after, requires, and is stopped together
    /// with each of `depends_on`.
    pub fn build(
        name: &str,
        command: &str,
        depends_on: Vec<String>,
        restart: RestartPolicy,
        limits: ResourceLimits,
    ) -> ScratchResult<Self> {
        let name = name.strip_suffix(".service").unwrap_or(name);
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        {
            return Err(ScratchError::Validation(format!(
                "invalid unit name '{}'",
                name
            )));
        }
        if command.trim().is_empty() {
            return Err(ScratchError::Validation(format!(
                "unit {} has an empty command",
                name
            )));
        }
        if command.contains('\n') {
            return Err(ScratchError::Validation(format!(
                "unit {} command spans several lines",
                name
            )));
        }
        if restart.max_restarts == 0 {
            return Err(ScratchError::Validation(format!(
                "unit {}: max restarts must be positive",
                name
            )));
        }
        if restart.window.is_zero() {
            return Err(ScratchError::Validation(format!(
                "unit {}: restart window must be positive",
                name
            )));
        }
        if restart.delay >= restart.window {
            return Err(ScratchError::Validation(format!(
                "unit {}: restart delay {:?} must be shorter than the window {:?}",
                name, restart.delay, restart.window
            )));
        }
        if let Some(dep) = depends_on.iter().find(|d| d.trim().is_empty() || d.contains(' ')) {
            return Err(ScratchError::Validation(format!(
                "unit {}: invalid dependency '{}'",
                name, dep
            )));
        }

        let mut after = vec!["network-online.target".to_string()];
        after.extend(depends_on.iter().cloned());

        Ok(Self {
            name: name.to_string(),
            description: format!("{} workload", name),
            working_directory: None,
            command: command.trim().to_string(),
            after,
            requires: depends_on.clone(),
            part_of: depends_on,
            restart,
            limits,
            wanted_by: vec!["multi-user.target".to_string()],
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn file_name(&self) -> String {
        format!("{}.service", self.name)
    }

    /// Render as a systemd unit file.
    ///
    /// `StartLimitBurst` counts starts, not restarts, so the initial start
    /// is added on top of `max_restarts`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        let _ = writeln!(out, "Description={}", self.description);
        if !self.after.is_empty() {
            let _ = writeln!(out, "After={}", self.after.join(" "));
        }
        if !self.requires.is_empty() {
            let _ = writeln!(out, "Requires={}", self.requires.join(" "));
        }
        if !self.part_of.is_empty() {
            let _ = writeln!(out, "PartOf={}", self.part_of.join(" "));
        }
        let _ = writeln!(out, "StartLimitIntervalSec={}", self.restart.window.as_secs().max(1));
        let _ = writeln!(out, "StartLimitBurst={}", self.restart.max_restarts + 1);

        out.push_str("\n[Service]\n");
        out.push_str("Type=simple\n");
        if let Some(dir) = &self.working_directory {
            let _ = writeln!(out, "WorkingDirectory={}", dir);
        }
        let _ = writeln!(out, "ExecStart={}", self.command);
        out.push_str("Restart=on-failure\n");
        let _ = writeln!(out, "RestartSec={}", format_seconds(self.restart.delay));
        if let Some(n) = self.limits.max_open_files {
            let _ = writeln!(out, "LimitNOFILE={}", n);
        }
        if let Some(n) = self.limits.max_tasks {
            let _ = writeln!(out, "TasksMax={}", n);
        }

        if !self.wanted_by.is_empty() {
            out.push_str("\n[Install]\n");
            let _ = writeln!(out, "WantedBy={}", self.wanted_by.join(" "));
        }
        out
    }
}

fn format_seconds(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> ServiceUnit {
        ServiceUnit::build(
            "scratch-workload",
            "/usr/bin/docker compose up",
            vec!["docker.service".into()],
            RestartPolicy::default(),
            ResourceLimits {
                max_open_files: Some(65536),
                max_tasks: None,
            },
        )
        .unwrap()
        .with_working_directory("/opt/workload")
    }

    #[test]
    fn test_render_sections() {
        let text = unit().render();
        assert!(text.starts_with("[Unit]\n"));
        assert!(text.contains("After=network-online.target docker.service\n"));
        assert!(text.contains("Requires=docker.service\n"));
        assert!(text.contains("PartOf=docker.service\n"));
        assert!(text.contains("StartLimitIntervalSec=60\n"));
        assert!(text.contains("StartLimitBurst=4\n"));
        assert!(text.contains("WorkingDirectory=/opt/workload\n"));
        assert!(text.contains("ExecStart=/usr/bin/docker compose up\n"));
        assert!(text.contains("Restart=on-failure\n"));
        assert!(text.contains("RestartSec=5\n"));
        assert!(text.contains("LimitNOFILE=65536\n"));
        assert!(text.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_subsecond_delay() {
        let mut u = unit();
        u.restart.delay = Duration::from_millis(250);
        assert!(u.render().contains("RestartSec=250ms\n"));
    }

    #[test]
    fn test_build_rejects_bad_restart_policy() {
        for policy in [
            RestartPolicy {
                max_restarts: 0,
                ..Default::default()
            },
            RestartPolicy {
                window: Duration::ZERO,
                ..Default::default()
            },
            RestartPolicy {
                delay: Duration::from_secs(90),
                ..Default::default()
            },
        ] {
            let err = ServiceUnit::build("w", "/bin/true", vec![], policy, ResourceLimits::default())
                .unwrap_err();
            assert_eq!(err.kind(), "ValidationError");
        }
    }

    #[test]
    fn test_build_rejects_bad_names_and_commands() {
        let p = RestartPolicy::default();
        let l = ResourceLimits::default();
        assert!(ServiceUnit::build("", "/bin/true", vec![], p, l).is_err());
        assert!(ServiceUnit::build("a b", "/bin/true", vec![], p, l).is_err());
        assert!(ServiceUnit::build("w", "  ", vec![], p, l).is_err());
        assert!(ServiceUnit::build("w", "a\nb", vec![], p, l).is_err());
        assert!(ServiceUnit::build("w", "/bin/true", vec!["".into()], p, l).is_err());
    }

    #[test]
    fn test_service_suffix_is_stripped() {
        let u = ServiceUnit::build(
            "w.service",
            "/bin/true",
            vec![],
            RestartPolicy::default(),
            ResourceLimits::default(),
        )
        .unwrap();
        assert_eq!(u.name, "w");
        assert_eq!(u.file_name(), "w.service");
        assert!(!u.render().contains("Requires="));
    }
}
