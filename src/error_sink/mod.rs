//! Last-resort failure log.
//!
//! Appends one delimited block per failure to a file chosen by the current
//! date. Recording never fails from the caller's point of view.

use std::error::Error;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, SecondsFormat};

use crate::config::AppConfig;
use crate::storage::expand_home_path;

pub const DATE_PLACEHOLDER: &str = "{date}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorSection {
    /// Failures that escape the process supervisor.
    Process,
    /// Failures that stop the queue consumer loop.
    QueueLoop,
}

impl ErrorSection {
    fn delimiters(self) -> (&'static str, &'static str) {
        match self {
            Self::Process => ("----------", "=========="),
            Self::QueueLoop => ("======", "======"),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::QueueLoop => "queue_loop",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ErrorSink {
    path_template: String,
}

impl ErrorSink {
    pub fn new(path_template: impl Into<String>) -> Self {
        Self {
            path_template: path_template.into(),
        }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self::new(app_config.error_log.path_template.clone())
    }

    pub fn record(&self, section: ErrorSection, error: &dyn Error) {
        self.record_at(section, error, Local::now());
    }

    pub fn record_at(&self, section: ErrorSection, error: &dyn Error, at: DateTime<Local>) {
        let block = render_block(section, error, at);
        let _ = self.append(at.date_naive(), &block);
    }

    pub fn path_for(&self, date: NaiveDate) -> Option<PathBuf> {
        let rendered = self
            .path_template
            .replace(DATE_PLACEHOLDER, &date.format("%Y-%m-%d").to_string());
        expand_home_path(&rendered).ok()
    }

    fn append(&self, date: NaiveDate, block: &str) -> io::Result<()> {
        let path = self
            .path_for(date)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(block.as_bytes())
    }
}

fn render_block(section: ErrorSection, error: &dyn Error, at: DateTime<Local>) -> String {
    let (open, close) = section.delimiters();
    let mut block = String::new();

    let _ = writeln!(block, "{open}");
    let _ = writeln!(
        block,
        "{} [{}]",
        at.to_rfc3339_opts(SecondsFormat::Millis, false),
        section.label()
    );
    let _ = writeln!(block, "{error}");
    let _ = writeln!(block);
    let _ = writeln!(block, "{error:?}");
    let mut cause = error.source();
    while let Some(inner) = cause {
        let _ = writeln!(block, "caused by: {inner}");
        cause = inner.source();
    }
    let _ = writeln!(block, "{close}");
    block
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use chrono::{Local, TimeZone};

    use super::{ErrorSection, ErrorSink};

    #[derive(Debug)]
    struct Outer(Inner);

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "queue connection lost")
        }
    }

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "socket reset")
        }
    }

    impl std::error::Error for Inner {}

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    fn unique_dir(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "auditbridge-error-sink-{label}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn writes_dated_file_with_distinct_sections() {
        let dir = unique_dir("sections");
        let sink = ErrorSink::new(format!("{}/errors-{{date}}.log", dir.display()));
        let at = Local
            .with_ymd_and_hms(2026, 3, 14, 9, 26, 53)
            .single()
            .expect("fixed local time should be unambiguous");

        sink.record_at(ErrorSection::QueueLoop, &Outer(Inner), at);
        sink.record_at(ErrorSection::Process, &Outer(Inner), at);

        let path = dir.join("errors-2026-03-14.log");
        let content = std::fs::read_to_string(&path).expect("dated log file should exist");
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "======");
        assert!(lines[1].starts_with("2026-03-14T09:26:53.000"));
        assert!(lines[1].ends_with("[queue_loop]"));
        assert_eq!(lines[2], "queue connection lost");
        assert!(content.contains("caused by: socket reset"));
        assert!(lines.contains(&"----------"));
        assert!(content.contains("[process]"));
        assert_eq!(lines.last(), Some(&"=========="));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unwritable_destination_is_swallowed() {
        let dir = unique_dir("unwritable");
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("blocker file should be writable");

        let sink = ErrorSink::new(format!("{}/nested/errors-{{date}}.log", blocker.display()));
        sink.record(ErrorSection::Process, &Outer(Inner));

        assert!(!blocker.join("nested").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn template_without_placeholder_is_used_verbatim() {
        let sink = ErrorSink::new("/var/log/auditbridge/errors.log");
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 2).expect("valid date");
        assert_eq!(
            sink.path_for(date),
            Some(std::path::PathBuf::from("/var/log/auditbridge/errors.log"))
        );
    }
}
