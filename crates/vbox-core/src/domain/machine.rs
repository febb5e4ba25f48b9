//! Machine lifecycle vocabulary.
//!
//! These types describe *what* the user wants (a clone of some source VM in a
//! given power state) and *what* the remote system reports back (an observed
//! [`MachineState`]).  They are shared by the orchestrator, every protocol
//! adapter, and the declarative resource layer.
//!
//! # Observed vs. desired state (for beginners)
//!
//! A VirtualBox machine has many internal states (`Starting`, `Saving`,
//! `Teleporting`, ...).  Adapters fold those into the five-value
//! [`MachineState`].  The user, however, only ever asks for one of two
//! targets: [`DesiredState::Started`] or [`DesiredState::Stopped`].  The
//! orchestrator converges from the former towards the latter and then reports
//! whatever it observes afterwards, never the requested target.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Timeout applied when no (or an unusable) wait timeout is configured.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

// ── Observed state ────────────────────────────────────────────────────────────

/// Version-normalised machine status as observed on the remote system.
///
/// Read-only: only power actions cause transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    /// Unknown or transient (e.g. `Starting`, `Saving`).
    Null,
    PoweredOff,
    Running,
    Saved,
    Paused,
}

impl MachineState {
    /// Canonical spelling used in resource records and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Null => "Null",
            MachineState::PoweredOff => "PoweredOff",
            MachineState::Running => "Running",
            MachineState::Saved => "Saved",
            MachineState::Paused => "Paused",
        }
    }

    /// Whether this observed state already satisfies `desired`.
    pub fn satisfies(self, desired: DesiredState) -> bool {
        matches!(
            (self, desired),
            (MachineState::Running, DesiredState::Started)
                | (MachineState::PoweredOff, DesiredState::Stopped)
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Desired state ─────────────────────────────────────────────────────────────

/// The only two power targets a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Started,
    #[default]
    Stopped,
}

impl DesiredState {
    pub fn as_str(self) -> &'static str {
        match self {
            DesiredState::Started => "started",
            DesiredState::Stopped => "stopped",
        }
    }

    /// Lenient parsing used by the resource layer.
    ///
    /// Accepts `started|running|on` and `stopped|poweredoff|powered_off|off`
    /// in any case.
    pub fn from_alias(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "started" | "running" | "on" => Ok(DesiredState::Started),
            "stopped" | "poweredoff" | "powered_off" | "off" => Ok(DesiredState::Stopped),
            _ => Err(ValidationError::InvalidDesiredState(s.to_string())),
        }
    }

    /// The desired state an imported machine should be given so that the
    /// next plan is a no-op.
    pub fn matching(observed: MachineState) -> Self {
        if observed == MachineState::Running {
            DesiredState::Started
        } else {
            DesiredState::Stopped
        }
    }
}

impl FromStr for DesiredState {
    type Err = ValidationError;

    /// Strict parsing: only `started` and `stopped` (trimmed, case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "started" => Ok(DesiredState::Started),
            "stopped" => Ok(DesiredState::Stopped),
            _ => Err(ValidationError::InvalidDesiredState(s.to_string())),
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Session type ──────────────────────────────────────────────────────────────

/// Front-end used when launching the VM process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Headless,
    Gui,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Headless => "headless",
            SessionType::Gui => "gui",
        }
    }
}

impl FromStr for SessionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "headless" => Ok(SessionType::Headless),
            "gui" => Ok(SessionType::Gui),
            _ => Err(ValidationError::InvalidSessionType(s.to_string())),
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Clone mode and options ────────────────────────────────────────────────────

/// Which snapshots of the source are carried into the clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CloneMode {
    #[default]
    MachineState,
    MachineAndChildStates,
    AllStates,
}

impl CloneMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CloneMode::MachineState => "MachineState",
            CloneMode::MachineAndChildStates => "MachineAndChildStates",
            CloneMode::AllStates => "AllStates",
        }
    }
}

impl FromStr for CloneMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MachineState" => Ok(CloneMode::MachineState),
            "MachineAndChildStates" => Ok(CloneMode::MachineAndChildStates),
            "AllStates" => Ok(CloneMode::AllStates),
            _ => Err(ValidationError::InvalidCloneMode(s.to_string())),
        }
    }
}

impl fmt::Display for CloneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags modifying how the clone is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CloneOption {
    Link,
    #[serde(rename = "KeepAllMACs")]
    KeepAllMacs,
    #[serde(rename = "KeepNATMACs")]
    KeepNatMacs,
    KeepDiskNames,
    #[serde(rename = "KeepHwUUIDs")]
    KeepHwUuids,
}

impl CloneOption {
    pub fn as_str(self) -> &'static str {
        match self {
            CloneOption::Link => "Link",
            CloneOption::KeepAllMacs => "KeepAllMACs",
            CloneOption::KeepNatMacs => "KeepNATMACs",
            CloneOption::KeepDiskNames => "KeepDiskNames",
            CloneOption::KeepHwUuids => "KeepHwUUIDs",
        }
    }

    /// Parses a list of option names, dropping duplicates while keeping the
    /// first-seen order.
    pub fn parse_list<S: AsRef<str>>(items: &[S]) -> Result<Vec<CloneOption>, ValidationError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let option: CloneOption = item.as_ref().parse()?;
            if !out.contains(&option) {
                out.push(option);
            }
        }
        Ok(out)
    }
}

impl FromStr for CloneOption {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Link" => Ok(CloneOption::Link),
            "KeepAllMACs" => Ok(CloneOption::KeepAllMacs),
            "KeepNATMACs" => Ok(CloneOption::KeepNatMacs),
            "KeepDiskNames" => Ok(CloneOption::KeepDiskNames),
            "KeepHwUUIDs" => Ok(CloneOption::KeepHwUuids),
            _ => Err(ValidationError::InvalidCloneOption(s.to_string())),
        }
    }
}

impl fmt::Display for CloneOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Requests and results ──────────────────────────────────────────────────────

/// A request to clone `source` into a new machine called `name` and bring it
/// to `desired_state`.
///
/// Immutable once submitted: changing `name`, `source`, `mode` or `options`
/// means destroying and recreating the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneRequest {
    pub name: String,
    /// Source machine name or UUID.
    pub source: String,
    pub mode: CloneMode,
    pub options: Vec<CloneOption>,
    pub desired_state: DesiredState,
    pub session_type: SessionType,
    /// Applies to every long-running step individually. Zero means default.
    pub timeout: Duration,
}

impl CloneRequest {
    /// Creates a request with every optional field at its default.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            mode: CloneMode::default(),
            options: Vec::new(),
            desired_state: DesiredState::default(),
            session_type: SessionType::default(),
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Rejects empty names and sources.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Required`] naming the offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Required("name"));
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::Required("source"));
        }
        Ok(())
    }

    /// The timeout to actually use for each long-running step.
    pub fn effective_timeout(&self) -> Duration {
        effective_timeout(self.timeout)
    }
}

/// Basic facts about a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Durable identity (UUID).
    pub id: String,
    pub name: String,
    pub state: MachineState,
}

/// Replaces a zero timeout with [`DEFAULT_WAIT_TIMEOUT`].
pub fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_WAIT_TIMEOUT
    } else {
        timeout
    }
}

// ── Duration strings ──────────────────────────────────────────────────────────

/// Parses a duration string such as `"30m"`, `"1h30m"`, `"1h 30m"` or
/// `"90s"`.
///
/// Accepts the `humantime` units (`ms`, `s`, `m`/`min`, `h`, `d`, ...).
/// Returns `None` for anything unparsable, including negative values and
/// numbers without a unit.
pub fn parse_duration(input: &str) -> Option<Duration> {
    humantime::parse_duration(input.trim()).ok()
}

/// Lenient wait-timeout parsing.
///
/// Empty, unparsable, or non-positive values fall back to
/// [`DEFAULT_WAIT_TIMEOUT`] instead of failing.
pub fn parse_wait_timeout(input: &str) -> Duration {
    match parse_duration(input) {
        Some(d) if !d.is_zero() => d,
        _ => DEFAULT_WAIT_TIMEOUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_state_strict_parse_accepts_only_two_targets() {
        assert_eq!("started".parse::<DesiredState>(), Ok(DesiredState::Started));
        assert_eq!(" Stopped ".parse::<DesiredState>(), Ok(DesiredState::Stopped));
        assert!("running".parse::<DesiredState>().is_err());
        assert!("".parse::<DesiredState>().is_err());
    }

    #[test]
    fn test_desired_state_aliases() {
        for alias in ["started", "Running", "ON"] {
            assert_eq!(DesiredState::from_alias(alias), Ok(DesiredState::Started));
        }
        for alias in ["stopped", "PoweredOff", "powered_off", "off"] {
            assert_eq!(DesiredState::from_alias(alias), Ok(DesiredState::Stopped));
        }
        assert_eq!(
            DesiredState::from_alias("paused"),
            Err(ValidationError::InvalidDesiredState("paused".to_string()))
        );
    }

    #[test]
    fn test_desired_state_matching_observed_state() {
        assert_eq!(DesiredState::matching(MachineState::Running), DesiredState::Started);
        assert_eq!(DesiredState::matching(MachineState::Saved), DesiredState::Stopped);
        assert_eq!(DesiredState::matching(MachineState::PoweredOff), DesiredState::Stopped);
    }

    #[test]
    fn test_machine_state_satisfies_only_exact_targets() {
        assert!(MachineState::Running.satisfies(DesiredState::Started));
        assert!(MachineState::PoweredOff.satisfies(DesiredState::Stopped));
        assert!(!MachineState::Paused.satisfies(DesiredState::Started));
        assert!(!MachineState::Saved.satisfies(DesiredState::Stopped));
    }

    #[test]
    fn test_clone_request_defaults() {
        let req = CloneRequest::new("web-1", "golden");

        assert_eq!(req.mode, CloneMode::MachineState);
        assert_eq!(req.desired_state, DesiredState::Stopped);
        assert_eq!(req.session_type, SessionType::Headless);
        assert_eq!(req.timeout, DEFAULT_WAIT_TIMEOUT);
        assert!(req.options.is_empty());
    }

    #[test]
    fn test_clone_request_rejects_blank_name_and_source() {
        let req = CloneRequest::new("   ", "golden");
        assert_eq!(req.validate(), Err(ValidationError::Required("name")));

        let req = CloneRequest::new("web-1", "");
        assert_eq!(req.validate(), Err(ValidationError::Required("source")));
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let mut req = CloneRequest::new("a", "b");
        req.timeout = Duration::ZERO;
        assert_eq!(req.effective_timeout(), DEFAULT_WAIT_TIMEOUT);
    }

    #[test]
    fn test_clone_option_list_dedupes_and_rejects_unknown() {
        let opts = CloneOption::parse_list(&["Link", "KeepNATMACs", "Link"]).unwrap();
        assert_eq!(opts, vec![CloneOption::Link, CloneOption::KeepNatMacs]);

        let err = CloneOption::parse_list(&["KeepEverything"]).unwrap_err();
        assert_eq!(err, ValidationError::InvalidCloneOption("KeepEverything".into()));
    }

    #[test]
    fn test_clone_mode_is_case_sensitive() {
        assert_eq!("AllStates".parse::<CloneMode>(), Ok(CloneMode::AllStates));
        assert!("allstates".parse::<CloneMode>().is_err());
    }

    #[test]
    fn test_parse_duration_units_and_compounds() {
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration(" 1h 30m "), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("-5m"), None);
    }

    #[test]
    fn test_wait_timeout_falls_back_leniently() {
        let cases = [
            ("45s", Duration::from_secs(45)),
            ("1h 30m", Duration::from_secs(5400)),
            ("nonsense", DEFAULT_WAIT_TIMEOUT),
            ("", DEFAULT_WAIT_TIMEOUT),
            ("   ", DEFAULT_WAIT_TIMEOUT),
            ("0s", DEFAULT_WAIT_TIMEOUT),
            ("0", DEFAULT_WAIT_TIMEOUT),
            ("-5m", DEFAULT_WAIT_TIMEOUT),
            ("-1h", DEFAULT_WAIT_TIMEOUT),
            ("5", DEFAULT_WAIT_TIMEOUT),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_wait_timeout(input), expected, "input {input:?}");
        }
    }
}
