use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_DELAY_MS: u64 = 25;
const MAX_DELAY_MS: u64 = 500;

/// Error returned when a polled condition never held.
#[derive(Debug)]
pub struct WaitError {
    what: String,
    attempts: u32,
    waited: Duration,
    last_seen: Option<String>,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timed out after {} attempts over {:?} waiting for {}. Last seen: {}",
            self.attempts,
            self.waited,
            self.what,
            self.last_seen
                .as_deref()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .unwrap_or("<nothing>")
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `probe` with exponential backoff until it yields a value.
///
/// `probe` returns `Ok(value)` when done, or `Err(observation)` to keep
/// waiting; the last observation ends up in the error message.
pub fn wait_until<T, F>(what: &str, timeout: Duration, mut probe: F) -> Result<T, WaitError>
where
    F: FnMut() -> Result<T, Option<String>>,
{
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);
    let mut attempts = 0;
    let mut last_seen = None;

    loop {
        attempts += 1;
        match probe() {
            Ok(value) => return Ok(value),
            Err(seen) => last_seen = seen.or(last_seen),
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
    }

    Err(WaitError {
        what: what.to_string(),
        attempts,
        waited: start.elapsed(),
        last_seen,
    })
}

/// Poll a file until its content satisfies `predicate`.
pub fn wait_for_file_content<P, F>(path: P, predicate: F, timeout: Duration) -> Result<String, WaitError>
where
    P: AsRef<Path>,
    F: Fn(&str) -> bool,
{
    let path = path.as_ref();
    wait_until(&path.display().to_string(), timeout, || match fs::read_to_string(path) {
        Ok(content) if predicate(&content) => Ok(content),
        Ok(content) => Err(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(None),
        Err(err) => Err(Some(err.to_string())),
    })
}

/// Poll until `path` no longer exists.
pub fn wait_for_removal(path: &Path, timeout: Duration) -> Result<(), WaitError> {
    let what: PathBuf = path.to_path_buf();
    wait_until(&format!("removal of {}", what.display()), timeout, || {
        if path.exists() {
            Err(fs::read_to_string(path).ok())
        } else {
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wait_for_file_content_returns_existing_content() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("value.txt");
        fs::write(&file, "ready").unwrap();

        let content =
            wait_for_file_content(&file, |text| text.contains("ready"), Duration::from_secs(1))
                .expect("should read file immediately");
        assert_eq!(content, "ready");
    }

    #[test]
    fn wait_for_file_content_reports_last_content() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("value.txt");
        fs::write(&file, "starting").unwrap();

        let err = wait_for_file_content(&file, |text| text == "ready", Duration::from_millis(100))
            .unwrap_err();
        assert!(err.to_string().contains("starting"));
    }

    #[test]
    fn wait_for_removal_sees_deleted_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("daemon.pid");
        fs::write(&file, "1").unwrap();

        let path = file.clone();
        let remover = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            fs::remove_file(path).unwrap();
        });
        wait_for_removal(&file, Duration::from_secs(2)).unwrap();
        remover.join().unwrap();
    }
}
