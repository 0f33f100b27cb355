//! ddrescue-compatible mapfile parsing and serialisation.
//!
//! Layout of a mapfile:
//!
//! ```text
//! # Mapfile. Created by blkcache
//! ## blkcache: device_size=16384
//! # current_pos  current_status
//! 0x00000000 ?
//! #      pos        size  status
//! 0x00000000 0x00001000 +
//! 0x00001000 0x00000200 B
//! ```
//!
//! Comment lines other than the regenerated headers are preserved across
//! rewrites, as are `## blkcache: key=value` metadata lines and status
//! characters this tool does not recognise.

use std::fs;
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::map::StatusMap;
use crate::status::{BlockStatus, CurrentStatus};

/// Result alias for mapfile operations.
pub type MapResult<T> = Result<T, MapError>;

/// Errors raised while loading or storing a mapfile.
#[derive(Debug, Error)]
pub enum MapError {
    /// The mapfile violates the format or does not match the device.
    #[error("corrupt mapfile at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number of the offending input.
        line: usize,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn corrupt(line: usize, reason: impl Into<String>) -> MapError {
    MapError::Corrupt {
        line,
        reason: reason.into(),
    }
}

/// Regenerated header lines are skipped on load and re-emitted on save.
fn is_regenerated_header(line: &str) -> bool {
    (line.contains("current_pos") && line.contains("current_status"))
        || (line.contains("pos") && line.contains("size") && line.contains("status"))
        || line.contains("Created by blkcache")
}

fn parse_hex(token: &str, line: usize, what: &str) -> MapResult<u64> {
    let digits = token.strip_prefix("0x").unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|_| corrupt(line, format!("bad {what} `{token}`")))
}

fn parse_status_char(token: &str, line: usize) -> MapResult<char> {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(corrupt(line, format!("bad status token `{token}`"))),
    }
}

/// Parse mapfile text into a [`StatusMap`] covering `device_size` bytes.
pub fn parse(text: &str, device_size: u64) -> MapResult<StatusMap> {
    let mut map = StatusMap::new(device_size);
    let mut saw_position_line = false;
    let mut covered = 0u64;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(meta) = line.strip_prefix("## blkcache:") {
            let (key, value) = meta
                .split_once('=')
                .ok_or_else(|| corrupt(lineno, "metadata line without `=`"))?;
            map.metadata
                .insert(key.trim().to_string(), value.trim().to_string());
            continue;
        }

        if line.starts_with('#') {
            if !is_regenerated_header(line) {
                map.comments.push(line.to_string());
            }
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();

        if !saw_position_line {
            // First data line is `current_pos current_status [current_pass]`.
            if fields.len() < 2 || fields.len() > 3 {
                return Err(corrupt(lineno, "malformed current-position line"));
            }
            map.current_pos = parse_hex(fields[0], lineno, "current_pos")?;
            map.current_status = CurrentStatus::from_char(parse_status_char(fields[1], lineno)?);
            map.current_pass = match fields.get(2) {
                Some(token) => Some(
                    token
                        .parse::<u64>()
                        .map_err(|_| corrupt(lineno, format!("bad pass `{token}`")))?,
                ),
                None => None,
            };
            saw_position_line = true;
            continue;
        }

        if fields.len() != 3 {
            return Err(corrupt(lineno, "expected `pos size status`"));
        }
        let start = parse_hex(fields[0], lineno, "pos")?;
        let len = parse_hex(fields[1], lineno, "size")?;
        let status = BlockStatus::from_char(parse_status_char(fields[2], lineno)?);

        if len == 0 {
            return Err(corrupt(lineno, "zero-length range"));
        }
        if start != covered {
            return Err(corrupt(
                lineno,
                format!("range starts at {start:#x}, expected {covered:#x}"),
            ));
        }
        let end = start
            .checked_add(len)
            .ok_or_else(|| corrupt(lineno, "range end overflows"))?;
        if end > device_size {
            return Err(corrupt(
                lineno,
                format!("range ends at {end:#x}, past device size {device_size:#x}"),
            ));
        }

        map.set(start, end, status);
        covered = end;
    }

    if covered != device_size {
        return Err(corrupt(
            text.lines().count(),
            format!("map covers {covered:#x} of {device_size:#x} bytes"),
        ));
    }

    Ok(map)
}

/// Load a mapfile from `path`; an absent file yields a fresh all-untried
/// map, matching a cache that has never been touched.
pub fn load(path: &Path, device_size: u64) -> MapResult<StatusMap> {
    if !path.exists() {
        debug!(path = %path.display(), "no mapfile, starting fresh");
        return Ok(StatusMap::new(device_size));
    }
    let text = fs::read_to_string(path)?;
    let map = parse(&text, device_size)?;
    debug!(
        path = %path.display(),
        runs = map.run_count(),
        cached = map.cached_bytes(),
        "loaded mapfile"
    );
    Ok(map)
}

/// Serialise `map` to `writer` in ddrescue mapfile format.
pub fn save(map: &StatusMap, writer: &mut impl Write) -> std::io::Result<()> {
    for comment in &map.comments {
        writeln!(writer, "{comment}")?;
    }
    for (key, value) in &map.metadata {
        writeln!(writer, "## blkcache: {key}={value}")?;
    }
    if map.comments.is_empty() {
        writeln!(writer, "# Mapfile. Created by blkcache")?;
    }

    writeln!(writer, "# current_pos  current_status")?;
    match map.current_pass {
        Some(pass) => writeln!(
            writer,
            "0x{:08x} {} {}",
            map.current_pos, map.current_status, pass
        )?,
        None => writeln!(writer, "0x{:08x} {}", map.current_pos, map.current_status)?,
    }

    writeln!(writer, "#      pos        size  status")?;
    for run in map.runs(0, map.size()) {
        writeln!(writer, "0x{:08x} 0x{:08x} {}", run.start, run.len(), run.status)?;
    }
    Ok(())
}

/// Serialise `map` to an owned string.
pub fn to_string(map: &StatusMap) -> String {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    save(map, &mut out).expect("in-memory serialisation");
    String::from_utf8(out).expect("mapfile output is ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::BlockStatus::*;

    #[test]
    fn test_parse_minimal() {
        let text = "\
# Mapfile. Created by blkcache
# current_pos  current_status
0x00000000 ?
#      pos        size  status
0x00000000 0x00004000 ?
";
        let map = parse(text, 0x4000).unwrap();
        assert_eq!(map.run_count(), 1);
        assert_eq!(map.status_at(0), Untried);
        assert_eq!(map.current_status, CurrentStatus::CopyNonTried);
    }

    #[test]
    fn test_parse_mixed_statuses() {
        let text = "\
0x00001000 - 1
0x00000000 0x00001000 +
0x00001000 0x00000200 B
0x00001200 0x00002e00 ?
";
        let map = parse(text, 0x4000).unwrap();
        assert_eq!(map.current_pos, 0x1000);
        assert_eq!(map.current_status, CurrentStatus::RetryingBad);
        assert_eq!(map.current_pass, Some(1));
        assert_eq!(map.status_at(0xfff), Finished);
        assert_eq!(map.status_at(0x1000), BadSector);
        assert_eq!(map.status_at(0x1200), Untried);
    }

    #[test]
    fn test_parse_preserves_comments_and_metadata() {
        let text = "\
# Rescue Logfile. ddrescue version 1.27
## blkcache: block_size=4096
## blkcache: format_version=1.0
# current_pos  current_status
0x00000000 ?
#      pos        size  status
0x00000000 0x00004000 ?
";
        let map = parse(text, 0x4000).unwrap();
        assert_eq!(map.comments, vec!["# Rescue Logfile. ddrescue version 1.27"]);
        assert_eq!(map.metadata.get("block_size").unwrap(), "4096");
        assert_eq!(map.metadata.get("format_version").unwrap(), "1.0");
    }

    #[test]
    fn test_parse_preserves_unknown_status() {
        let text = "\
0x00000000 ?
0x00000000 0x00002000 X
0x00002000 0x00002000 +
";
        let map = parse(text, 0x4000).unwrap();
        assert_eq!(map.status_at(0), Other('X'));
        let out = to_string(&map);
        assert!(out.contains("0x00000000 0x00002000 X"));
    }

    #[test]
    fn test_parse_rejects_gap() {
        let text = "\
0x00000000 ?
0x00000000 0x00001000 +
0x00002000 0x00002000 ?
";
        assert!(matches!(
            parse(text, 0x4000),
            Err(MapError::Corrupt { line: 3, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_overlap() {
        let text = "\
0x00000000 ?
0x00000000 0x00002000 +
0x00001000 0x00003000 ?
";
        assert!(matches!(parse(text, 0x4000), Err(MapError::Corrupt { .. })));
    }

    #[test]
    fn test_parse_rejects_zero_length_range() {
        let text = "\
0x00000000 ?
0x00000000 0x00000000 +
";
        assert!(matches!(parse(text, 0x4000), Err(MapError::Corrupt { .. })));
    }

    #[test]
    fn test_parse_rejects_short_coverage() {
        let text = "\
0x00000000 ?
0x00000000 0x00001000 +
";
        assert!(matches!(parse(text, 0x4000), Err(MapError::Corrupt { .. })));
    }

    #[test]
    fn test_parse_rejects_oversized_coverage() {
        let text = "\
0x00000000 ?
0x00000000 0x00008000 +
";
        assert!(matches!(parse(text, 0x4000), Err(MapError::Corrupt { .. })));
    }

    #[test]
    fn test_parse_rejects_bad_hex() {
        let text = "\
0x00000000 ?
0xZZZZ 0x00004000 +
";
        assert!(matches!(parse(text, 0x4000), Err(MapError::Corrupt { .. })));
    }

    #[test]
    fn test_parse_rejects_multichar_status() {
        let text = "\
0x00000000 ?
0x00000000 0x00004000 ++
";
        assert!(matches!(parse(text, 0x4000), Err(MapError::Corrupt { .. })));
    }

    #[test]
    fn test_parse_accepts_ddrescue_whitespace() {
        // ddrescue pads columns with runs of spaces
        let text = "\
# Rescue Logfile.
# current_pos  current_status
0x24F35400     +
#      pos        size  status
0x00000000  0x00002000  +
0x00002000  0x00002000  -
";
        let map = parse(text, 0x4000).unwrap();
        assert_eq!(map.current_pos, 0x24f35400);
        assert_eq!(map.status_at(0x2000), NonScraped);
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut map = StatusMap::new(0x4000);
        map.set(0, 0x1000, Finished);
        map.set(0x1000, 0x1200, BadSector);
        map.metadata
            .insert("device_size".into(), "16384".into());
        map.current_pos = 0x1200;

        let text = to_string(&map);
        let reloaded = parse(&text, 0x4000).unwrap();

        assert_eq!(reloaded.current_pos, map.current_pos);
        assert_eq!(reloaded.run_count(), map.run_count());
        for offset in (0..0x4000).step_by(0x100) {
            assert_eq!(reloaded.status_at(offset), map.status_at(offset));
        }
        assert_eq!(reloaded.metadata, map.metadata);
    }

    #[test]
    fn test_round_trip_is_byte_stable() {
        // A file already in our output format re-serialises identically.
        let text = "\
# imaging session for /dev/sr0
## blkcache: block_size=2048
# current_pos  current_status
0x00001200 -
#      pos        size  status
0x00000000 0x00001000 +
0x00001000 0x00000200 B
0x00001200 0x00002e00 ?
";
        let map = parse(text, 0x4000).unwrap();
        assert_eq!(to_string(&map), text);
    }

    #[test]
    fn test_load_missing_file_yields_fresh_map() {
        let dir = tempfile::tempdir().unwrap();
        let map = load(&dir.path().join("absent.map"), 0x4000).unwrap();
        assert_eq!(map.run_count(), 1);
        assert_eq!(map.status_at(0), Untried);
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.map");
        let mut map = StatusMap::new(0x2000);
        map.set(0, 0x1000, Finished);
        std::fs::write(&path, to_string(&map)).unwrap();

        let reloaded = load(&path, 0x2000).unwrap();
        assert_eq!(reloaded.status_at(0), Finished);
        assert_eq!(reloaded.status_at(0x1000), Untried);
    }

    #[test]
    fn test_save_block_runs_emit_single_spaces() {
        let mut map = StatusMap::new(0x2000);
        map.set(0, 0x1000, Finished);
        let text = to_string(&map);
        assert!(text.contains("0x00000000 0x00001000 +\n"));
        assert!(text.contains("0x00001000 0x00001000 ?\n"));
        assert!(text.ends_with('\n'));
        assert!(!text.ends_with("\n\n"));
    }
}
