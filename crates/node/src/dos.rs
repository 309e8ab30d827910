//! DOS / health scoreboard.
//!
//! Detectors raise the score and record a reason; remediation clears it.
//! The node refuses new installs while `dos_state >= threshold`. There is
//! no decay and no weighting: this is a gate, not a reputation system.
//!
//! Each detector keeps its own contribution so clearing one (for example
//! after duplicate containers are gone) leaves the others in place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use skyfleet_common::config::DosSection;

/// An installed application as the duplicate detector sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub name: String,
    /// Content hash of the local specification; empty when unknown.
    pub hash: String,
}

/// Serializable view of the scoreboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DosSnapshot {
    pub dos_state: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dos_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dos_mount_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dos_duplicate_app_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DosState {
    policy: DosSection,
    general: u32,
    mount: u32,
    duplicate: u32,
    dos_message: Option<String>,
    dos_mount_message: Option<String>,
    dos_duplicate_app_message: Option<String>,
}

impl DosState {
    pub fn new(policy: DosSection) -> Self {
        Self {
            policy,
            general: 0,
            mount: 0,
            duplicate: 0,
            dos_message: None,
            dos_mount_message: None,
            dos_duplicate_app_message: None,
        }
    }

    pub fn dos_state(&self) -> u32 {
        self.general.saturating_add(self.mount).saturating_add(self.duplicate)
    }

    pub fn threshold(&self) -> u32 {
        self.policy.threshold
    }

    pub fn is_dos(&self) -> bool {
        self.dos_state() >= self.policy.threshold
    }

    pub fn raise(&mut self, amount: u32, reason: impl Into<String>) {
        self.general = self.general.saturating_add(amount);
        self.dos_message = Some(reason.into());
    }

    /// A container failed to mount its volume. Repeated failures accumulate.
    pub fn report_mount_failure(&mut self, app: &str, detail: &str) {
        self.mount = self.mount.saturating_add(self.policy.mount_failure_increment);
        self.dos_mount_message = Some(format!("Mount of {} failed: {}", app, detail));
    }

    /// Conflicting specifications are installed under one name.
    pub fn report_duplicate_app(&mut self, name: &str) {
        self.duplicate = self.policy.duplicate_app_increment;
        self.dos_duplicate_app_message =
            Some(format!("Application {} is installed more than once with different specifications", name));
    }

    /// Scan installed apps for names equal up to case with different hashes.
    ///
    /// Reports every conflicting name and returns them sorted; with no
    /// conflict left the duplicate contribution is cleared.
    pub fn check_duplicate_local_apps(&mut self, installed: &[InstalledApp]) -> Vec<String> {
        let mut by_name: HashMap<String, Vec<&InstalledApp>> = HashMap::new();
        for app in installed {
            by_name.entry(app.name.to_ascii_lowercase()).or_default().push(app);
        }
        let mut duplicates: Vec<String> = by_name
            .into_iter()
            .filter(|(_, apps)| apps.iter().any(|a| a.hash != apps[0].hash))
            .map(|(name, _)| name)
            .collect();
        duplicates.sort();

        if duplicates.is_empty() {
            self.clear_duplicates();
        } else {
            self.report_duplicate_app(&duplicates.join(", "));
        }
        duplicates
    }

    pub fn clear_duplicates(&mut self) {
        self.duplicate = 0;
        self.dos_duplicate_app_message = None;
    }

    pub fn clear_mount_failures(&mut self) {
        self.mount = 0;
        self.dos_mount_message = None;
    }

    pub fn clear(&mut self) {
        self.general = 0;
        self.dos_message = None;
        self.clear_mount_failures();
        self.clear_duplicates();
    }

    pub fn snapshot(&self) -> DosSnapshot {
        DosSnapshot {
            dos_state: self.dos_state(),
            dos_message: self.dos_message.clone(),
            dos_mount_message: self.dos_mount_message.clone(),
            dos_duplicate_app_message: self.dos_duplicate_app_message.clone(),
        }
    }
}

impl Default for DosState {
    fn default() -> Self {
        Self::new(DosSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, hash: &str) -> InstalledApp {
        InstalledApp { name: name.to_string(), hash: hash.to_string() }
    }

    #[test]
    fn test_raise_and_clear() {
        let mut dos = DosState::default();
        assert!(!dos.is_dos());
        dos.raise(60, "first");
        dos.raise(40, "second");
        assert!(dos.is_dos());
        assert_eq!(dos.snapshot().dos_message.as_deref(), Some("second"));
        dos.clear();
        assert_eq!(dos.snapshot(), DosSnapshot::default());
    }

    #[test]
    fn test_mount_failures_accumulate() {
        let mut dos = DosState::new(DosSection { threshold: 100, mount_failure_increment: 50, duplicate_app_increment: 100 });
        dos.report_mount_failure("web", "no such device");
        assert!(!dos.is_dos());
        dos.report_mount_failure("web", "no such device");
        assert!(dos.is_dos());
        assert!(dos.snapshot().dos_mount_message.expect("msg").contains("web"));
    }

    #[test]
    fn test_duplicate_detection_case_insensitive() {
        let mut dos = DosState::default();
        let found = dos.check_duplicate_local_apps(&[app("Web", "h1"), app("web", "h2"), app("db", "h3")]);
        assert_eq!(found, vec!["web".to_string()]);
        assert!(dos.is_dos());

        // Same hash under two casings is not a conflict
        let found = dos.check_duplicate_local_apps(&[app("Web", "h1"), app("web", "h1")]);
        assert!(found.is_empty());
        assert!(!dos.is_dos());
        assert!(dos.snapshot().dos_duplicate_app_message.is_none());
    }

    #[test]
    fn test_clearing_one_detector_keeps_others() {
        let mut dos = DosState::default();
        dos.report_mount_failure("a", "x");
        dos.report_duplicate_app("b");
        dos.clear_duplicates();
        assert_eq!(dos.dos_state(), 100);
        assert!(dos.snapshot().dos_mount_message.is_some());
    }
}
