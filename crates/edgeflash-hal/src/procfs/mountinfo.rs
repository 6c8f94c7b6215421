//! Parsing helpers for `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub fstype: String,
    pub source: String,
}

/// Parse mountinfo lines. Malformed lines are skipped.
///
/// Layout: `id parent maj:min root mount-point opts [optional...] - fstype source superopts`.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountInfo> {
    let (mount_side, fs_side) = line.split_once(" - ")?;
    let mount_point = mount_side.split_whitespace().nth(4)?;
    let mut fs_fields = fs_side.split_whitespace();
    let fstype = fs_fields.next()?;
    let source = fs_fields.next()?;
    Some(MountInfo {
        mount_point: PathBuf::from(unescape_mount_path(mount_point)),
        fstype: fstype.to_string(),
        source: unescape_mount_path(source),
    })
}

pub fn is_mounted_from_info(path: &Path, entries: &[MountInfo]) -> bool {
    // Path equality ignores a trailing slash.
    entries.iter().any(|entry| entry.mount_point == path)
}

/// Mount points whose source is `dev_path` or one of its partitions.
pub fn mounted_under_device(entries: &[MountInfo], dev_path: &Path) -> Vec<PathBuf> {
    let disk = dev_path.to_string_lossy();
    let mut mounts: Vec<PathBuf> = entries
        .iter()
        .filter(|e| source_on_disk(&e.source, &disk))
        .map(|e| e.mount_point.clone())
        .collect();
    mounts.sort();
    mounts.dedup();
    mounts
}

/// `/dev/sda1` is on `/dev/sda`, `/dev/nvme0n1p2` is on `/dev/nvme0n1`,
/// but `/dev/sdaa1` is not on `/dev/sda`.
pub fn source_on_disk(source: &str, disk: &str) -> bool {
    let Some(rest) = source.strip_prefix(disk) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(d) => d,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Source of the mount at `/`. The last entry wins, matching the kernel's view
/// when something was mounted over the initial root.
pub fn root_mount_source(entries: &[MountInfo]) -> Option<String> {
    entries
        .iter()
        .rev()
        .find(|e| e.mount_point == Path::new("/"))
        .map(|e| e.source.clone())
}

/// Mount entry with the longest mount point that is a prefix of `path`.
pub fn mount_containing<'a>(entries: &'a [MountInfo], path: &Path) -> Option<&'a MountInfo> {
    entries
        .iter()
        .filter(|e| path.starts_with(&e.mount_point))
        .max_by_key(|e| e.mount_point.components().count())
}

/// Undo the kernel's `\ooo` octal escapes (space, tab, newline, backslash).
pub fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|d| {
            bytes[i] == b'\\' && d.iter().all(|c| (b'0'..=b'7').contains(c))
        });
        match octal {
            Some(d) => {
                let value = d.iter().fold(0u32, |acc, c| acc * 8 + u32::from(c - b'0'));
                out.push(u8::try_from(value).unwrap_or(b'?'));
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "36 28 0:31 / / rw,relatime - ext4 /dev/nvme0n1p1 rw\n\
                          37 28 0:32 / /boot/efi rw,relatime - vfat /dev/nvme0n1p10 rw\n\
                          38 28 0:33 / /media/usb\\040stick rw,relatime - vfat /dev/sdb1 rw\n";

    #[test]
    fn parse_mountinfo_extracts_fields() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[0].fstype, "ext4");
        assert_eq!(entries[0].source, "/dev/nvme0n1p1");
        assert_eq!(entries[2].mount_point, PathBuf::from("/media/usb stick"));
    }

    #[test]
    fn octal_escapes_are_decoded_and_stray_backslashes_kept() {
        assert_eq!(unescape_mount_path("/media/op/L4T\\040R36\\134x"), "/media/op/L4T R36\\x");
        assert_eq!(unescape_mount_path("/tab\\011here"), "/tab\there");
        assert_eq!(unescape_mount_path("/odd\\9"), "/odd\\9");
    }

    #[test]
    fn is_mounted_from_info_matches_paths() {
        let entries = parse_mountinfo(SAMPLE);
        assert!(is_mounted_from_info(Path::new("/boot/efi/"), &entries));
        assert!(!is_mounted_from_info(Path::new("/mnt"), &entries));
    }

    #[test]
    fn mounted_under_device_finds_matching_sources() {
        let entries = parse_mountinfo(SAMPLE);
        let mounts = mounted_under_device(&entries, Path::new("/dev/nvme0n1"));
        assert_eq!(
            mounts,
            vec![PathBuf::from("/"), PathBuf::from("/boot/efi")]
        );
    }

    #[test]
    fn source_on_disk_rejects_lookalike_names() {
        assert!(source_on_disk("/dev/sda1", "/dev/sda"));
        assert!(source_on_disk("/dev/sda", "/dev/sda"));
        assert!(source_on_disk("/dev/nvme0n1p2", "/dev/nvme0n1"));
        assert!(!source_on_disk("/dev/sdaa1", "/dev/sda"));
        assert!(!source_on_disk("/dev/nvme0n10", "/dev/nvme0n1"));
    }

    #[test]
    fn root_mount_source_extracts_device() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(root_mount_source(&entries), Some("/dev/nvme0n1p1".to_string()));
    }

    #[test]
    fn mount_containing_prefers_deepest_mount() {
        let entries = parse_mountinfo(SAMPLE);
        let m = mount_containing(&entries, Path::new("/media/usb stick/toolkit")).unwrap();
        assert_eq!(m.source, "/dev/sdb1");
        let m = mount_containing(&entries, Path::new("/home/user")).unwrap();
        assert_eq!(m.source, "/dev/nvme0n1p1");
    }
}
