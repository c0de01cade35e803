//! Best-effort parsing of `rsync --stats` output.

use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files: Option<u64>,
    pub files_transferred: Option<u64>,
    pub bytes_transferred: Option<u64>,
}

/// Leading number of a stats value, ignoring thousands separators.
fn leading_number(value: &str) -> Option<u64> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

impl TransferStats {
    pub fn parse(stdout: &str) -> Self {
        let mut stats = Self::default();
        for line in stdout.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "Number of files" => stats.files = leading_number(value),
                "Number of regular files transferred" => {
                    stats.files_transferred = leading_number(value)
                }
                "Total transferred file size" => stats.bytes_transferred = leading_number(value),
                _ => {}
            }
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_else(|| "?".into());
        write!(
            f,
            "{} files, {} transferred, {} bytes transferred",
            show(self.files),
            show(self.files_transferred),
            show(self.bytes_transferred)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "
Number of files: 1,234 (reg: 1,100, dir: 134)
Number of created files: 5 (reg: 5)
Number of deleted files: 0
Number of regular files transferred: 17
Total file size: 9,876,543 bytes
Total transferred file size: 65,536 bytes
Literal data: 65,536 bytes
";

    #[test]
    fn test_parse_stats() {
        let stats = TransferStats::parse(OUTPUT);
        assert_eq!(stats.files, Some(1234));
        assert_eq!(stats.files_transferred, Some(17));
        assert_eq!(stats.bytes_transferred, Some(65_536));
        assert_eq!(stats.to_string(), "1234 files, 17 transferred, 65536 bytes transferred");
    }

    #[test]
    fn test_parse_unrelated_output() {
        let stats = TransferStats::parse("sending incremental file list\n");
        assert!(stats.is_empty());
    }
}
