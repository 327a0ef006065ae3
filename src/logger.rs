use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Transfer journal for sync passes
pub trait Logger: Send + Sync {
    fn start(&self, _dir: &Path, _server: &str) {}
    fn upload_done(&self, _name: &str, _bytes: u64) {}
    fn download_done(&self, _name: &str, _bytes: u64) {}
    fn error(&self, _context: &str, _name: &str, _msg: &str) {}
    fn done(&self, _uploaded: u64, _downloaded: u64, _skipped: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, dir: &Path, server: &str) {
        self.line(&format!("START dir={} server={}", dir.display(), server));
    }
    fn upload_done(&self, name: &str, bytes: u64) {
        self.line(&format!("UPLOAD file={name} bytes={bytes}"));
    }
    fn download_done(&self, name: &str, bytes: u64) {
        self.line(&format!("DOWNLOAD file={name} bytes={bytes}"));
    }
    fn error(&self, context: &str, name: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} file={name} msg={msg}"));
    }
    fn done(&self, uploaded: u64, downloaded: u64, skipped: u64, seconds: f64) {
        self.line(&format!(
            "DONE uploaded={uploaded} downloaded={downloaded} skipped={skipped} seconds={seconds:.3}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_journal_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/sync.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.start(Path::new("clientdata"), "127.0.0.1:30450");
        logger.upload_done("a.txt", 12);
        logger.error("download", "b.txt", "file does not exist");
        logger.done(1, 0, 1, 0.25);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with('[') && lines[0].contains("] START dir=clientdata"));
        assert!(lines[1].ends_with("UPLOAD file=a.txt bytes=12"));
        assert!(lines[2].ends_with("ERROR ctx=download file=b.txt msg=file does not exist"));
        assert!(lines[3].ends_with("DONE uploaded=1 downloaded=0 skipped=1 seconds=0.250"));
    }
}
