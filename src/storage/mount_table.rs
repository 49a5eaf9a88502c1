//! Parsing of the kernel mount table (`/proc/self/mounts`).

use camino::{Utf8Path, Utf8PathBuf};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: Utf8PathBuf,
    pub fstype: String,
    pub options: String,
}

/// Decodes the octal escapes the kernel uses for space, tab, newline and
/// backslash (`\040`, `\011`, `\012`, `\134`).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses mount table text. Malformed lines are ignored.
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next()?;
            Some(MountEntry {
                source: unescape(source),
                target: Utf8PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Returns true if something is mounted exactly at `target`.
pub fn is_mounted(entries: &[MountEntry], target: &Utf8Path) -> bool {
    entries.iter().any(|e| e.target == target)
}

/// Returns the distinct mount targets strictly below any of `roots`,
/// deepest first.
pub fn nested_mounts(entries: &[MountEntry], roots: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let mut nested: Vec<Utf8PathBuf> = entries
        .iter()
        .filter(|e| {
            roots
                .iter()
                .any(|root| e.target != *root && e.target.starts_with(root))
        })
        .map(|e| e.target.clone())
        .collect();
    nested.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    nested.dedup();
    nested
}

/// Returns the mount targets below `root` that are not in `planned`,
/// deepest first.
pub fn stray_mounts(
    entries: &[MountEntry],
    root: &Utf8Path,
    planned: &[Utf8PathBuf],
) -> Vec<Utf8PathBuf> {
    let mut stray = nested_mounts(entries, &[root.to_owned()]);
    stray.retain(|target| !planned.contains(target));
    stray
}
