use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::session::{Session, SessionExporter};
use crate::trial::TrialResult;

pub const CSV_HEADER: [&str; 12] = [
    "participant",
    "blockName",
    "trialIndex",
    "sf",
    "ori",
    "label",
    "correctKey",
    "resp",
    "corr",
    "rt",
    "timeout",
    "trialStartUTC",
];

/// Written in place of a response when none was given.
pub const NO_RESPONSE: &str = "NA";

pub fn iso_millis(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn result_row(participant: &str, r: &TrialResult) -> Vec<String> {
    vec![
        participant.to_string(),
        r.trial.block.as_str().to_string(),
        r.index.to_string(),
        r.trial.stripes.to_string(),
        format!("{:.3}", r.trial.orientation),
        r.trial.label.as_str().to_string(),
        r.trial.label.expected_response().as_str().to_string(),
        r.response
            .map(|resp| resp.as_str().to_string())
            .unwrap_or_else(|| NO_RESPONSE.to_string()),
        u8::from(r.correct).to_string(),
        r.reaction_time
            .map(|rt| format!("{:.3}", rt.as_secs_f64()))
            .unwrap_or_default(),
        u8::from(r.timeout_flag()).to_string(),
        iso_millis(&r.started_at),
    ]
}

/// Header row followed by one row per executed trial.
pub fn session_rows(session: &Session) -> Vec<Vec<String>> {
    let mut rows = vec![CSV_HEADER.iter().map(|s| s.to_string()).collect()];
    rows.extend(
        session
            .results()
            .iter()
            .map(|r| result_row(session.participant(), r)),
    );
    rows
}

fn csv_field(value: &str) -> String {
    if value.contains(['"', ',', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn rows_to_csv(rows: &[Vec<String>]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|v| csv_field(v))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn export_filename(participant: &str, at: &DateTime<Utc>) -> String {
    let who = if participant.is_empty() {
        "unknown".to_string()
    } else {
        participant.replace(['/', '\\'], "_")
    };
    let stamp = iso_millis(at).replace([':', '.'], "-");
    format!("gabor_{}_{}.csv", who, stamp)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Writes the session log as one CSV file into `out_dir`.
#[derive(Debug)]
pub struct CsvExporter {
    out_dir: PathBuf,
    written: Option<PathBuf>,
}

impl CsvExporter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            written: None,
        }
    }

    pub fn written(&self) -> Option<&Path> {
        self.written.as_deref()
    }
}

impl SessionExporter for CsvExporter {
    fn export(&mut self, session: &Session) -> Result<()> {
        let path = self
            .out_dir
            .join(export_filename(session.participant(), &Utc::now()));
        let csv = rows_to_csv(&session_rows(session));
        atomic_write_bytes(&path, csv.as_bytes())?;
        info!(path = %path.display(), rows = session.results().len(), "session log written");
        self.written = Some(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOutcome;
    use crate::trial::{Block, Label, Outcome, Response, Trial};
    use chrono::TimeZone;
    use std::time::Duration;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 9, 8, 7)
            .single()
            .expect("valid timestamp")
            + chrono::Duration::milliseconds(42)
    }

    fn result(outcome: Outcome) -> TrialResult {
        let responded = outcome == Outcome::Responded;
        TrialResult {
            trial: Trial {
                block: Block::InformationIntegration,
                stripes: 5,
                orientation: -8.12345,
                label: Label::B,
            },
            index: 12,
            response: responded.then_some(Response::B),
            correct: responded,
            reaction_time: responded.then_some(Duration::from_micros(734_600)),
            outcome,
            started_at: started(),
        }
    }

    #[test]
    fn responded_row_formats_all_columns() {
        let row = result_row("P01", &result(Outcome::Responded));
        assert_eq!(
            row,
            vec![
                "P01",
                "II",
                "12",
                "5",
                "-8.123",
                "B",
                "b",
                "b",
                "1",
                "0.735",
                "0",
                "2024-03-05T09:08:07.042Z"
            ]
        );
    }

    #[test]
    fn timeout_and_abort_rows_use_blank_markers() {
        for outcome in [Outcome::TimedOut, Outcome::Aborted] {
            let row = result_row("P01", &result(outcome));
            assert_eq!(row[7], NO_RESPONSE);
            assert_eq!(row[8], "0");
            assert_eq!(row[9], "");
            assert_eq!(row[10], "1");
        }
    }

    #[test]
    fn csv_quotes_only_when_needed() {
        let rows = vec![
            vec!["plain".to_string(), "a,b".to_string()],
            vec!["say \"hi\"".to_string(), "line\nbreak".to_string()],
        ];
        assert_eq!(
            rows_to_csv(&rows),
            "plain,\"a,b\"\n\"say \"\"hi\"\"\",\"line\nbreak\""
        );
    }

    #[test]
    fn filename_is_filesystem_safe() {
        assert_eq!(
            export_filename("P01", &started()),
            "gabor_P01_2024-03-05T09-08-07-042Z.csv"
        );
        assert_eq!(
            export_filename("", &started()),
            "gabor_unknown_2024-03-05T09-08-07-042Z.csv"
        );
        assert!(!export_filename("a/b", &started()).contains('/'));
    }

    #[test]
    fn exporter_writes_header_and_rows() {
        let dir = std::env::temp_dir().join(format!(
            "gabor_export_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let mut session = Session::new("P,02");
        session.record(result(Outcome::Responded));
        session.record(result(Outcome::TimedOut));
        let mut exporter = CsvExporter::new(&dir);
        session
            .finalize(SessionOutcome::Completed, &mut exporter)
            .expect("finalize");

        let path = exporter.written().expect("written path").to_path_buf();
        let data = fs::read_to_string(&path).expect("read csv");
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert!(lines[1].starts_with("\"P,02\",II,12,"));
        let _ = fs::remove_dir_all(dir);
    }
}
