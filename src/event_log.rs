use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

const LOG_FILE_NAME: &str = "sbauth.log";
const ROTATED_LOG_FILE_NAME: &str = "sbauth.log.1";
const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Changes to stored accounts and instances worth keeping a trail of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    AccountSaved {
        identity: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_fingerprint: Option<String>,
        current: bool,
    },
    AccountSwitched {
        identity: String,
    },
    AccountUpdated {
        identity: String,
    },
    AccountIncomplete {
        identity: String,
        error: String,
    },
    AccountsDeduplicated {
        removed: Vec<String>,
        renamed: Vec<(String, String)>,
    },
    InstanceChecked {
        input: String,
        wellknown: String,
        api: String,
    },
}

impl AuditEvent {
    pub fn account_saved(identity: &str, token: &str, current: bool) -> Self {
        Self::AccountSaved {
            identity: identity.to_string(),
            token_fingerprint: token_fingerprint(token),
            current,
        }
    }
}

#[derive(Serialize)]
struct AuditLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// JSON-lines audit trail under the log directory. Every event is also
/// emitted through `tracing`; a failed file write is only traced.
pub struct EventLog {
    log_dir: PathBuf,
    max_bytes: u64,
}

impl EventLog {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            max_bytes: MAX_LOG_BYTES,
        }
    }

    pub fn record(&self, event: &AuditEvent) {
        tracing::info!(target: "sbauth::audit", ?event, "audit event");
        if let Err(err) = self.append(event) {
            tracing::debug!(dir = %self.log_dir.display(), error = %err, "audit log write failed");
        }
    }

    fn append(&self, event: &AuditEvent) -> io::Result<()> {
        let line = serde_json::to_string(&AuditLine {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
        })
        .map_err(io::Error::other)?;

        fs::create_dir_all(&self.log_dir)?;
        let path = self.log_dir.join(LOG_FILE_NAME);
        let mut file = open_private_append(&path)?;
        let size = file.metadata()?.len();
        if size > 0 && size + line.len() as u64 + 1 > self.max_bytes {
            drop(file);
            fs::rename(&path, self.log_dir.join(ROTATED_LOG_FILE_NAME))?;
            file = open_private_append(&path)?;
        }
        writeln!(file, "{}", line)
    }
}

fn open_private_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

/// Loggable stand-in for a credential.
pub fn token_fingerprint(token: &str) -> Option<String> {
    let raw = token.trim();
    if raw.is_empty() {
        return None;
    }
    let digest = Sha256::digest(raw.as_bytes());
    Some(hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn read_lines(temp: &TempDir, name: &str) -> Vec<Value> {
        fs::read_to_string(temp.path().join("logs").join(name))
            .expect("read log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn events_are_written_as_tagged_json_lines() {
        let temp = TempDir::new().expect("temp dir");
        let log = EventLog::new(temp.path().join("logs"));

        log.record(&AuditEvent::account_saved("a@b.chttps://h", "tok", true));
        log.record(&AuditEvent::AccountsDeduplicated {
            removed: vec!["x".to_string()],
            renamed: vec![("https://h/".to_string(), "https://h".to_string())],
        });

        let lines = read_lines(&temp, LOG_FILE_NAME);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "account_saved");
        assert_eq!(lines[0]["identity"], "a@b.chttps://h");
        assert_eq!(lines[0]["current"], true);
        assert_eq!(lines[0]["token_fingerprint"].as_str().map(str::len), Some(16));
        assert!(lines[0]["timestamp"].as_str().expect("timestamp").ends_with('Z'));
        assert_eq!(lines[1]["renamed"][0][1], "https://h");
    }

    #[test]
    fn blank_token_has_no_fingerprint_field() {
        let temp = TempDir::new().expect("temp dir");
        let log = EventLog::new(temp.path().join("logs"));

        log.record(&AuditEvent::account_saved("id", "  ", false));

        let lines = read_lines(&temp, LOG_FILE_NAME);
        assert!(lines[0].get("token_fingerprint").is_none());
    }

    #[test]
    fn oversized_log_is_rotated() {
        let temp = TempDir::new().expect("temp dir");
        let mut log = EventLog::new(temp.path().join("logs"));
        log.max_bytes = 10;

        log.record(&AuditEvent::AccountSwitched {
            identity: "first".to_string(),
        });
        log.record(&AuditEvent::AccountSwitched {
            identity: "second".to_string(),
        });

        let rotated = read_lines(&temp, ROTATED_LOG_FILE_NAME);
        let current = read_lines(&temp, LOG_FILE_NAME);
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0]["identity"], "first");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["identity"], "second");
    }

    #[test]
    fn token_fingerprint_hides_the_token() {
        let fingerprint = token_fingerprint("secret-token").expect("fingerprint");
        assert_eq!(fingerprint.len(), 16);
        assert!(!fingerprint.contains("secret"));
        assert_eq!(token_fingerprint("  "), None);
    }
}
