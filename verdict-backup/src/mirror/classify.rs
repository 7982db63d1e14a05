//! Classification of mirror tool output lines.
//!
//! The mirror tool runs with `--out-format` set to [`ITEM_FORMAT`], which
//! prints the itemized change flags, a fixed-width checksum field and the
//! destination-relative path. Only three shapes matter for the manifest:
//!
//! ```text
//! *deleting   sum:                                 photos/old.txt
//! hf+++++++++ sum:                                 photos/copy.jpg => photos/orig.jpg
//! >f+++++++++ sum:0cc175b9c0f1b6a831c399e269772661 photos/new.txt
//! ```
//!
//! Everything else (directories, symlinks, statistics, warnings) is `Other`.

/// Output format handed to the mirror tool.
pub const ITEM_FORMAT: &str = "%i sum:%C %n%L";

const SUM_MARKER: &str = "sum:";

/// Width of the checksum field. The configured checksum algorithm must be a
/// 128-bit digest printed as 32 hex characters.
pub const CHECKSUM_WIDTH: usize = 32;

const HARD_LINK_ARROW: &str = " => ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// The path was removed from the destination.
    Delete(String),
    /// The path was created as a hard link to another transferred path.
    HardLink(String),
    /// The path was written with new content.
    Update { path: String, checksum: String },
    /// The path was written but the tool printed no checksum for it.
    Unhashed(String),
    /// Anything that does not touch the manifest.
    Other,
}

/// Classify one output line (without its trailing newline).
pub fn classify_line(line: &str) -> LineKind {
    let line = line.trim_end_matches(['\r', '\n']);
    let line = line.rsplit('\r').next().unwrap_or(line);

    if line.starts_with("*deleting") {
        return match split_item(line) {
            Some((_, path)) if !path.is_empty() => LineKind::Delete(path.to_string()),
            _ => LineKind::Other,
        };
    }

    if line.starts_with("hf") {
        return match split_item(line) {
            Some((_, rest)) => {
                let path = rest.split_once(HARD_LINK_ARROW).map_or(rest, |(p, _)| p);
                if path.is_empty() {
                    LineKind::Other
                } else {
                    LineKind::HardLink(path.to_string())
                }
            }
            None => LineKind::Other,
        };
    }

    if line.starts_with(">f") {
        return match split_item(line) {
            Some((checksum, path)) if !path.is_empty() => {
                if checksum.is_empty() {
                    LineKind::Unhashed(path.to_string())
                } else {
                    LineKind::Update {
                        path: path.to_string(),
                        checksum: checksum.to_ascii_lowercase(),
                    }
                }
            }
            _ => LineKind::Other,
        };
    }

    LineKind::Other
}

/// Split an item line into (checksum, path) around the fixed-width field after
/// the marker. A blank field yields an empty checksum.
fn split_item(line: &str) -> Option<(&str, &str)> {
    let start = line.find(SUM_MARKER)? + SUM_MARKER.len();
    let rest = &line[start..];
    let field = rest.get(..CHECKSUM_WIDTH)?;
    let path = rest.get(CHECKSUM_WIDTH..)?.strip_prefix(' ')?;

    let field = field.trim();
    if !field.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((field, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLANK: &str = "                                ";

    #[test]
    fn test_received_file() {
        let line = ">f+++++++++ sum:0CC175B9C0F1B6A831C399E269772661 photos/new file.txt";
        assert_eq!(
            classify_line(line),
            LineKind::Update {
                path: "photos/new file.txt".into(),
                checksum: "0cc175b9c0f1b6a831c399e269772661".into(),
            }
        );
    }

    #[test]
    fn test_updated_file_any_reason() {
        for flags in [">f.st......", ">fcs.......", ">f..t......"] {
            let line = format!("{flags} sum:92eb5ffee6ae2fec3ad71c777531578f photos/a");
            assert!(matches!(classify_line(&line), LineKind::Update { .. }), "{flags}");
        }
    }

    #[test]
    fn test_deleted_file() {
        let line = format!("*deleting   sum:{BLANK} photos/old.txt");
        assert_eq!(classify_line(&line), LineKind::Delete("photos/old.txt".into()));
    }

    #[test]
    fn test_hard_link() {
        let line = format!("hf+++++++++ sum:{BLANK} photos/copy.jpg => photos/orig.jpg");
        assert_eq!(classify_line(&line), LineKind::HardLink("photos/copy.jpg".into()));
    }

    #[test]
    fn test_received_without_checksum() {
        let line = format!(">f+++++++++ sum:{BLANK} photos/x");
        assert_eq!(classify_line(&line), LineKind::Unhashed("photos/x".into()));
    }

    #[test]
    fn test_path_with_leading_space_kept() {
        let line = ">f+++++++++ sum:0cc175b9c0f1b6a831c399e269772661  photos/ odd";
        assert_eq!(
            classify_line(line),
            LineKind::Update {
                path: " photos/ odd".into(),
                checksum: "0cc175b9c0f1b6a831c399e269772661".into(),
            }
        );
    }

    #[test]
    fn test_other_lines() {
        for line in [
            "sending incremental file list",
            "cd+++++++++ sum:                                 photos/",
            "cL+++++++++ sum:                                 photos/link -> target",
            "Number of files: 3 (reg: 3)",
            "",
            ">f truncated",
            "rsync: [sender] link_stat \"/x\" failed: No such file or directory (2)",
        ] {
            assert_eq!(classify_line(line), LineKind::Other, "{line:?}");
        }
    }

    #[test]
    fn test_progress_carriage_return_prefix() {
        let line = "    1.02K 100%    0.00kB/s    0:00:00\r>f+++++++++ sum:0cc175b9c0f1b6a831c399e269772661 photos/a";
        assert!(matches!(classify_line(line), LineKind::Update { .. }));
    }
}
