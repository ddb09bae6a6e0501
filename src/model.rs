//! Core data model.
//!
//! A task descriptor is the durable record of one unit of work. It lives next to
//! its payload as `{id}.task`, a file of append-only `key=value` lines. Later
//! lines override earlier ones, so the status history of a task can be read back
//! at any intermediate state with nothing more than line splitting.

use std::path::Path;

use chrono::{DateTime, Utc};

/// Extension of a visible descriptor file.
pub const DESCRIPTOR_EXT: &str = "task";

/// Suffix of a descriptor that a worker has claimed.
pub const CLAIMED_SUFFIX: &str = ".task.claimed";

// ---------------------------------------------------------------------------
// Task ID
// ---------------------------------------------------------------------------

/// Task identity: the payload's base filename without its extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from a payload path. Returns `None` for paths without a
    /// usable UTF-8 stem.
    pub fn from_payload(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        if stem.is_empty() || stem.starts_with('.') {
            return None;
        }
        Some(Self(stem.to_string()))
    }

    /// Derive the id from a descriptor file name (`a.task` or `a.task.claimed`).
    pub fn from_descriptor_name(name: &str) -> Option<Self> {
        let stem = name
            .strip_suffix(CLAIMED_SUFFIX)
            .or_else(|| name.strip_suffix(".task"))?;
        if stem.is_empty() || stem.starts_with('.') {
            return None;
        }
        Some(Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn descriptor_name(&self) -> String {
        format!("{}.{DESCRIPTOR_EXT}", self.0)
    }

    pub fn claimed_name(&self) -> String {
        format!("{}{CLAIMED_SUFFIX}", self.0)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Waiting in the queue directory for a worker.
    Queued,
    /// Transformed successfully and archived. Terminal.
    Completed,
    /// Exhausted its attempts and moved to the dead-letter area. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!((self, to), (Queued, Completed) | (Queued, Failed))
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Completed => "completed",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Task Descriptor
// ---------------------------------------------------------------------------

/// The on-disk record of one task, as parsed at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub id: TaskId,

    /// Filename of the payload in the queue directory (`image_file`).
    pub payload_name: String,

    pub status: Status,

    /// Set at creation (`timestamp`).
    pub queued_at: DateTime<Utc>,

    /// Set on the terminal transition (`processed_at` or `failed_at`).
    pub terminal_at: Option<DateTime<Utc>>,

    /// Set only on Completed (`output_file`).
    pub output_name: Option<String>,

    /// Failed attempts recorded so far.
    pub attempts: u32,

    pub last_error: Option<String>,

    /// Why the task was dead-lettered.
    pub reason: Option<String>,

    /// Payload name in the archive when it had to be renamed on arrival.
    pub archive_name: Option<String>,
}

impl TaskDescriptor {
    /// A fresh Queued descriptor.
    pub fn new(id: TaskId, payload_name: impl Into<String>, queued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload_name: payload_name.into(),
            status: Status::Queued,
            queued_at,
            terminal_at: None,
            output_name: None,
            attempts: 0,
            last_error: None,
            reason: None,
            archive_name: None,
        }
    }

    /// The lines written when the descriptor is created.
    pub fn initial_lines(&self) -> Lines {
        Lines::new()
            .push("image_file", &self.payload_name)
            .push("timestamp", format_timestamp(self.queued_at))
            .push("status", Status::Queued.to_string())
    }

    /// Parse descriptor text. `id` comes from the descriptor's file name.
    pub fn parse(id: TaskId, text: &str) -> Result<Self, String> {
        let mut payload_name = None;
        let mut queued_at = None;
        let mut status: Option<Status> = None;
        let mut terminal_at = None;
        let mut output_name = None;
        let mut attempts = 0;
        let mut last_error = None;
        let mut reason = None;
        let mut archive_name = None;

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {} is not key=value: {line:?}", n + 1))?;

            match key {
                "image_file" => {
                    if value.is_empty() || value.contains(['/', '\\']) || value.starts_with('.') {
                        return Err(format!("invalid image_file: {value:?}"));
                    }
                    payload_name = Some(value.to_string());
                }
                "timestamp" => queued_at = Some(parse_timestamp(value)?),
                "status" => {
                    let next: Status = value.parse()?;
                    if let Some(prev) = status
                        && prev.is_terminal()
                    {
                        return Err(format!("status {next} recorded after terminal {prev}"));
                    }
                    status = Some(next);
                }
                "processed_at" | "failed_at" => terminal_at = Some(parse_timestamp(value)?),
                "output_file" => output_name = Some(value.to_string()),
                "attempts" => {
                    attempts = value
                        .parse()
                        .map_err(|_| format!("invalid attempts: {value:?}"))?;
                }
                "last_error" => last_error = Some(value.to_string()),
                "reason" => reason = Some(value.to_string()),
                "archive_file" => archive_name = Some(value.to_string()),
                // Unknown keys are tolerated.
                _ => {}
            }
        }

        Ok(Self {
            id,
            payload_name: payload_name.ok_or("missing required key image_file")?,
            status: status.ok_or("missing required key status")?,
            queued_at: queued_at.ok_or("missing required key timestamp")?,
            terminal_at,
            output_name,
            attempts,
            last_error,
            reason,
            archive_name,
        })
    }

    /// Name the payload carries in the archive.
    pub fn archived_payload_name(&self) -> &str {
        self.archive_name.as_deref().unwrap_or(&self.payload_name)
    }
}

// ---------------------------------------------------------------------------
// Lines
// ---------------------------------------------------------------------------

/// A batch of `key=value` lines to append to a descriptor.
#[derive(Debug, Clone, Default)]
pub struct Lines(Vec<(&'static str, String)>);

impl Lines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a line. Newlines in the value are flattened to spaces.
    pub fn push(mut self, key: &'static str, value: impl AsRef<str>) -> Self {
        let value = value.as_ref().replace(['\r', '\n'], " ");
        self.0.push((key, value));
        self
    }

    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Unix seconds with a microsecond fraction, e.g. `1700000000.250000`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

/// Accepts fractional Unix seconds or RFC 3339.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if s.contains('T') {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp {s:?}: {e}"));
    }
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("invalid timestamp: {s:?}"))?;
    if !secs.is_finite() {
        return Err(format!("invalid timestamp: {s:?}"));
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
        .ok_or_else(|| format!("timestamp out of range: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn initial_lines_parse_back_as_queued() {
        let desc = TaskDescriptor::new(TaskId::new("a"), "a.jpg", ts(1_700_000_000));
        let parsed = TaskDescriptor::parse(TaskId::new("a"), &desc.initial_lines().render())
            .unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn completed_history_parses() {
        let text = "image_file=a.jpg\ntimestamp=1700000000.5\nstatus=queued\n\
                    processed_at=1700000010.0\nstatus=completed\noutput_file=inverted_a.jpg\n";
        let desc = TaskDescriptor::parse(TaskId::new("a"), text).unwrap();
        assert_eq!(desc.status, Status::Completed);
        assert_eq!(desc.output_name.as_deref(), Some("inverted_a.jpg"));
        assert_eq!(desc.terminal_at, Some(ts(1_700_000_010)));
        assert_eq!(desc.queued_at.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn retry_lines_keep_status_queued_and_last_value_wins() {
        let text = "image_file=a.jpg\ntimestamp=1700000000.0\nstatus=queued\n\
                    attempts=1\nlast_error=boom\nattempts=2\nlast_error=bang\n";
        let desc = TaskDescriptor::parse(TaskId::new("a"), text).unwrap();
        assert_eq!(desc.status, Status::Queued);
        assert_eq!(desc.attempts, 2);
        assert_eq!(desc.last_error.as_deref(), Some("bang"));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let text = "image_file=a.png\nowner=ops\ntimestamp=1700000000\nstatus=queued\n";
        assert!(TaskDescriptor::parse(TaskId::new("a"), text).is_ok());
    }

    #[test]
    fn missing_image_file_is_corrupt() {
        let err = TaskDescriptor::parse(
            TaskId::new("a"),
            "timestamp=1700000000.0\nstatus=queued\n",
        )
        .unwrap_err();
        assert!(err.contains("image_file"), "{err}");
    }

    #[test]
    fn status_after_terminal_is_corrupt() {
        let text = "image_file=a.jpg\ntimestamp=1700000000.0\nstatus=queued\n\
                    status=failed\nstatus=completed\n";
        assert!(TaskDescriptor::parse(TaskId::new("a"), text).is_err());
    }

    #[test]
    fn line_without_separator_is_corrupt() {
        let text = "image_file=a.jpg\ngarbage\n";
        assert!(TaskDescriptor::parse(TaskId::new("a"), text).is_err());
    }

    #[test]
    fn payload_name_with_path_is_rejected() {
        let text = "image_file=../etc/passwd\ntimestamp=1700000000.0\nstatus=queued\n";
        assert!(TaskDescriptor::parse(TaskId::new("a"), text).is_err());
    }

    #[test]
    fn rfc3339_timestamps_are_accepted() {
        let parsed = parse_timestamp("2023-11-14T22:13:20Z").unwrap();
        assert_eq!(parsed, ts(1_700_000_000));
    }

    #[test]
    fn lines_flatten_newlines() {
        let rendered = Lines::new().push("last_error", "bad\nthing").render();
        assert_eq!(rendered, "last_error=bad thing\n");
    }

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(Status::Queued.can_transition_to(Status::Completed));
        assert!(Status::Queued.can_transition_to(Status::Failed));
        assert!(!Status::Completed.can_transition_to(Status::Failed));
        assert!(!Status::Failed.can_transition_to(Status::Queued));
    }

    #[test]
    fn task_id_from_names() {
        assert_eq!(
            TaskId::from_payload(Path::new("/in/photo.final.jpg")),
            Some(TaskId::new("photo.final"))
        );
        assert_eq!(TaskId::from_payload(Path::new("/in/.hidden")), None);
        assert_eq!(
            TaskId::from_descriptor_name("a.task.claimed"),
            Some(TaskId::new("a"))
        );
        assert_eq!(TaskId::from_descriptor_name("a.jpg"), None);
    }
}
