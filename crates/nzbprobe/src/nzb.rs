//! NZB manifest parsing and normalization
//!
//! An NZB file is an XML index of files published on Usenet, each carrying
//! the newsgroups it was posted to and one `<segment>` per article. Parsing
//! returns a [`Manifest`] that is already normalized: duplicate segment
//! numbers are dropped, segments are sorted by number, display names are
//! derived from the posting subject, and aggregate totals are precomputed.
//! Callers treat the manifest as read-only afterwards.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ProbeError, Result};

/// One article reference inside a file.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Article message-id, without angle brackets.
    pub message_id: String,
    /// Expected size of the article body.
    pub bytes: u64,
    /// Position within the file.
    pub number: u32,
}

/// One file entry of a manifest.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    /// Display name derived from the subject.
    pub name: String,
    /// Raw posting subject.
    pub subject: String,
    /// Sum of segment sizes.
    pub bytes: u64,
    /// Newsgroups the file was posted to.
    pub groups: Vec<String>,
    /// Segments ordered by number, duplicates removed.
    pub segments: Vec<Segment>,
}

/// A parsed, normalized NZB manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub files: Vec<ManifestFile>,
    pub total_segments: u64,
    pub total_bytes: u64,
}

impl Manifest {
    pub fn total_files(&self) -> usize {
        self.files.len()
    }
}

// Raw deserialization targets; `normalize` turns these into the public model.

#[derive(Debug, Deserialize)]
struct RawNzb {
    #[serde(rename = "file", default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "@subject", default)]
    subject: String,
    #[serde(default)]
    groups: RawGroups,
    #[serde(default)]
    segments: RawSegments,
}

#[derive(Debug, Default, Deserialize)]
struct RawGroups {
    #[serde(rename = "group", default)]
    group: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSegments {
    #[serde(rename = "segment", default)]
    segment: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(rename = "@bytes", default)]
    bytes: u64,
    #[serde(rename = "@number", default)]
    number: u32,
    #[serde(rename = "$text", default)]
    message_id: String,
}

/// Load and parse an NZB file from disk.
pub fn parse_file(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ProbeError::ManifestLoad(format!("{}: {e}", path.display())))?;
    parse(&content).map_err(|e| ProbeError::ManifestLoad(format!("{}: {e}", path.display())))
}

/// Parse an NZB document from a string.
pub fn parse(content: &str) -> std::result::Result<Manifest, quick_xml::DeError> {
    let raw: RawNzb = quick_xml::de::from_str(content)?;
    Ok(normalize(raw))
}

fn normalize(raw: RawNzb) -> Manifest {
    let mut manifest = Manifest::default();

    for raw_file in raw.files {
        let mut seen = HashSet::new();
        let mut segments: Vec<Segment> = raw_file
            .segments
            .segment
            .into_iter()
            .filter_map(|s| {
                let message_id = s.message_id.trim().to_string();
                if message_id.is_empty() || !seen.insert(s.number) {
                    return None;
                }
                Some(Segment {
                    message_id,
                    bytes: s.bytes,
                    number: s.number,
                })
            })
            .collect();
        segments.sort_by_key(|s| s.number);

        let groups: Vec<String> = raw_file
            .groups
            .group
            .into_iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();

        let bytes: u64 = segments.iter().map(|s| s.bytes).sum();
        manifest.total_segments += segments.len() as u64;
        manifest.total_bytes += bytes;

        manifest.files.push(ManifestFile {
            name: subject_filename(&raw_file.subject),
            subject: raw_file.subject,
            bytes,
            groups,
            segments,
        });
    }

    manifest
}

/// Posting subjects usually quote the filename: `desc "name.ext" yEnc (1/5)`.
fn subject_filename(subject: &str) -> String {
    if let Some(start) = subject.find('"') {
        let rest = &subject[start + 1..];
        if let Some(len) = rest.find('"') {
            let name = rest[..len].trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    subject.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="iso-8859-1" ?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="title">example</meta>
  </head>
  <file poster="poster@example.com" date="1706000000" subject="big release [1/2] - &quot;archive.part1.rar&quot; yEnc (1/3)">
    <groups>
      <group>alt.binaries.test</group>
      <group>alt.binaries.misc</group>
    </groups>
    <segments>
      <segment bytes="700000" number="1">part1-seg1@example.com</segment>
      <segment bytes="700000" number="2">part1-seg2@example.com</segment>
      <segment bytes="120000" number="3">part1-seg3@example.com</segment>
    </segments>
  </file>
  <file poster="poster@example.com" date="1706000000" subject="big release [2/2] - &quot;archive.part2.rar&quot; yEnc (1/2)">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="700000" number="2">part2-seg2@example.com</segment>
      <segment bytes="700000" number="1">part2-seg1@example.com</segment>
      <segment bytes="999" number="1">duplicate@example.com</segment>
    </segments>
  </file>
</nzb>
"#;

    #[test]
    fn parses_files_groups_and_segments() {
        let manifest = parse(SAMPLE).unwrap();

        assert_eq!(manifest.total_files(), 2);
        assert_eq!(manifest.total_segments, 5);

        let first = &manifest.files[0];
        assert_eq!(first.name, "archive.part1.rar");
        assert_eq!(first.groups.len(), 2);
        assert_eq!(first.segments.len(), 3);
        assert_eq!(first.bytes, 1_520_000);
        assert_eq!(first.segments[0].message_id, "part1-seg1@example.com");
    }

    #[test]
    fn deduplicates_and_sorts_segments() {
        let manifest = parse(SAMPLE).unwrap();
        let second = &manifest.files[1];

        // The duplicate number 1 entry is dropped, order is by number.
        assert_eq!(second.segments.len(), 2);
        assert_eq!(second.segments[0].number, 1);
        assert_eq!(second.segments[0].message_id, "part2-seg1@example.com");
        assert_eq!(second.segments[1].number, 2);
    }

    #[test]
    fn filename_falls_back_to_subject() {
        assert_eq!(subject_filename(r#"x "name.rar" y"#), "name.rar");
        assert_eq!(subject_filename("no quotes here"), "no quotes here");
        assert_eq!(subject_filename(r#"empty "" quotes"#), r#"empty "" quotes"#);
    }

    #[test]
    fn totals_cover_all_files() {
        let manifest = parse(SAMPLE).unwrap();
        assert_eq!(manifest.total_bytes, 1_520_000 + 1_400_000);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse("<nzb><file></nzb>").is_err());
        assert!(parse("not xml at all").is_err());
    }

    #[test]
    fn empty_nzb_parses_to_empty_manifest() {
        let manifest =
            parse(r#"<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb"></nzb>"#).unwrap();
        assert_eq!(manifest.total_files(), 0);
        assert_eq!(manifest.total_segments, 0);
    }
}
