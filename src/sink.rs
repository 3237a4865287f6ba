use crate::fetch::TorrentMetadata;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Destination for completed fetches. Implementations must return
/// promptly; the coordinator calls this inline. An `Err` means the entry
/// was rejected; it is logged and never retried.
pub trait MetadataSink: Send + Sync {
    fn insert(&self, meta: &TorrentMetadata) -> anyhow::Result<()>;
}

/// Appends one JSON object per torrent to a local file.
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output dir {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open output file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MetadataSink for JsonlSink {
    fn insert(&self, meta: &TorrentMetadata) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(meta)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap();
        file.write_all(&line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infohash::InfoHash;

    #[test]
    fn writes_one_json_line_per_insert() {
        let dir = std::env::temp_dir().join(format!(
            "trawler-sink-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        let path = dir.join("torrents.jsonl");
        let sink = JsonlSink::open(&path).unwrap();

        let meta = TorrentMetadata {
            hash: InfoHash::new([0x01; 20]),
            name: "example".into(),
            total_size: 42,
            piece_length: 16384,
            files: vec![],
        };
        sink.insert(&meta).unwrap();
        sink.insert(&meta).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["name"], "example");
        assert_eq!(parsed["hash"], "01".repeat(20));
        std::fs::remove_dir_all(&dir).ok();
    }
}
