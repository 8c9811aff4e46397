// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Blocking sysfs attribute access.
//!
//! Attributes are small text files. Reads strip a single trailing newline;
//! writes append one, so a successful store of `value` consumes exactly
//! `value.len() + 1` bytes. Callers verify that count with [`expected_len`].

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use crate::{MemError, Result};

/// Largest attribute payload accepted by [`read_attr`].
pub const ATTR_MAX: usize = 1024;

/// Number of bytes a successful [`write_attr`] of `value` reports.
#[inline]
pub fn expected_len(value: &str) -> usize {
    value.len() + 1
}

/// Reads an attribute, stripping one trailing newline.
pub fn read_attr(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| MemError::sysfs(path, e))?;
    let mut buf = Vec::with_capacity(64);
    let n = Read::by_ref(&mut file)
        .take(ATTR_MAX as u64)
        .read_to_end(&mut buf)
        .map_err(|e| MemError::sysfs(path, e))?;
    if n >= ATTR_MAX {
        return Err(MemError::sysfs(
            path,
            std::io::Error::new(ErrorKind::InvalidData, "attribute exceeds 1024 bytes"),
        ));
    }

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

/// Writes `value` plus a newline in a single `write(2)` and returns the byte
/// count the kernel reported.
pub fn write_attr(path: &Path, value: &str) -> Result<usize> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| MemError::sysfs(path, e))?;
    let payload = format!("{value}\n");
    file.write(payload.as_bytes())
        .map_err(|e| MemError::sysfs(path, e))
}

/// Writes `value` and fails with [`MemError::ShortWrite`] unless exactly
/// `value.len() + 1` bytes were consumed.
pub fn write_attr_verified(path: &Path, value: &str) -> Result<()> {
    let written = write_attr(path, value)?;
    verify_written(path, value, written)
}

/// Checks a reported write count against the expected store length.
pub fn verify_written(path: &Path, value: &str, written: usize) -> Result<()> {
    let expected = expected_len(value);
    if written != expected {
        return Err(MemError::ShortWrite {
            path: path.to_path_buf(),
            written,
            expected,
        });
    }
    Ok(())
}

/// Parses an unsigned integer with C `strtoul(s, NULL, 0)` semantics.
///
/// Leading whitespace and `+` are skipped, `0x`/`0X` selects hex and a leading
/// `0` selects octal. Parsing stops at the first invalid digit; no digits
/// yields 0.
pub fn parse_ulong(s: &str) -> u64 {
    let s = s.trim_start();
    let s = s.strip_prefix('+').unwrap_or(s);
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return parse_radix_prefix(hex, 16);
    }
    if s.len() > 1 && s.starts_with('0') {
        return parse_radix_prefix(&s[1..], 8);
    }
    parse_radix_prefix(s, 10)
}

/// Parses a hexadecimal value with or without a `0x` prefix.
pub fn parse_hex(s: &str) -> u64 {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    parse_radix_prefix(s, 16)
}

fn parse_radix_prefix(s: &str, radix: u32) -> u64 {
    s.chars()
        .map_while(|c| c.to_digit(radix))
        .fold(0u64, |acc, d| {
            acc.saturating_mul(radix as u64).saturating_add(d as u64)
        })
}

/// Reads a hex-encoded attribute such as `block_size_bytes`.
pub fn read_hex(path: &Path) -> Result<u64> {
    read_attr(path).map(|s| parse_hex(&s))
}

/// Reads an attribute with [`parse_ulong`] semantics.
pub fn read_ulong(path: &Path) -> Result<u64> {
    read_attr(path).map(|s| parse_ulong(&s))
}

/// Returns the final path component of a symlink target.
pub fn link_name(path: &Path) -> Option<String> {
    let target = fs::read_link(path).ok()?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1", 1)]
    #[case("  42", 42)]
    #[case("0x10", 16)]
    #[case("0X1f", 31)]
    #[case("010", 8)]
    #[case("0", 0)]
    #[case("12abc", 12)]
    #[case("", 0)]
    #[case("abc", 0)]
    fn test_parse_ulong(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_ulong(input), expected);
    }

    #[rstest]
    #[case("10000000", 0x1000_0000)]
    #[case("0x8000000", 0x800_0000)]
    #[case("8000000\n", 0x800_0000)]
    #[case("zz", 0)]
    fn test_parse_hex(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_hex(input), expected);
    }

    #[test]
    fn test_read_strips_single_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, "online\n").unwrap();
        assert_eq!(read_attr(&path).unwrap(), "online");

        std::fs::write(&path, "online\n\n").unwrap();
        assert_eq!(read_attr(&path).unwrap(), "online\n");
    }

    #[test]
    fn test_read_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_attr(&dir.path().join("missing")).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_read_oversized_attr_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, "x".repeat(ATTR_MAX + 10)).unwrap();
        assert!(read_attr(&path).unwrap_err().is_io());
    }

    #[test]
    fn test_write_reports_value_plus_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, "offline\n").unwrap();

        let n = write_attr(&path, "online_movable").unwrap();
        assert_eq!(n, 15);
        assert_eq!(read_attr(&path).unwrap(), "online_movable");

        // truncation keeps shorter values readable
        write_attr_verified(&path, "0").unwrap();
        assert_eq!(read_attr(&path).unwrap(), "0");
    }

    #[test]
    fn test_write_to_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_attr(dir.path(), "0").unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_verify_written_mismatch() {
        let err = verify_written(Path::new("/x/online"), "0", 1).unwrap_err();
        match err {
            MemError::ShortWrite {
                written, expected, ..
            } => {
                assert_eq!(written, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        verify_written(Path::new("/x/online"), "0", 2).unwrap();
    }
}
