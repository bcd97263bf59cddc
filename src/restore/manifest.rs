// pgphase/src/restore/manifest.rs
//! Parsing and partitioning of a `pg_restore --list --verbose` listing.
//!
//! Listing lines look like
//! `215; 1259 16386 TABLE public users app`; verbose listings follow an entry
//! with `;\tdepends on: 3 214`. Everything else starting with `;` is a comment.
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    PreData,
    Data,
    PostData,
}

impl Section {
    /// Value accepted by `pg_restore --section`.
    pub fn as_flag(&self) -> &'static str {
        match self {
            Section::PreData => "pre-data",
            Section::Data => "data",
            Section::PostData => "post-data",
        }
    }
}

/// Classification the phase plan works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTag {
    Schema,
    Index,
    Data,
    OtherPostData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub dump_id: u32,
    pub kind: String,
    pub section: Section,
    pub tag: EntryTag,
    pub namespace: String,
    pub name: String,
    pub owner: String,
    pub dependencies: Vec<u32>,
    /// The listing line as pg_restore printed it; reused verbatim in use-lists.
    pub line: String,
}

/// Object counts derived from a manifest, used to check a finished restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub tables: usize,
    pub indexes: usize,
    pub constraints: usize,
}

impl fmt::Display for ObjectCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tables, {} indexes, {} constraints",
            self.tables, self.indexes, self.constraints
        )
    }
}

/// Post-data entries split for the INDEX and POST_DATA phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostDataPartition {
    pub index_only: Vec<ManifestEntry>,
    pub other_post_data: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

// Longest names first so "TABLE DATA" wins over "TABLE".
const KINDS: &[(&str, Option<Section>)] = &[
    ("PUBLICATION TABLES IN SCHEMA", Some(Section::PostData)),
    ("TEXT SEARCH CONFIGURATION", Some(Section::PreData)),
    ("TEXT SEARCH DICTIONARY", Some(Section::PreData)),
    ("MATERIALIZED VIEW DATA", Some(Section::PostData)),
    ("TEXT SEARCH TEMPLATE", Some(Section::PreData)),
    ("FOREIGN DATA WRAPPER", Some(Section::PreData)),
    ("PROCEDURAL LANGUAGE", Some(Section::PreData)),
    ("SUBSCRIPTION TABLE", Some(Section::PostData)),
    ("TEXT SEARCH PARSER", Some(Section::PreData)),
    ("PUBLICATION TABLE", Some(Section::PostData)),
    ("SEQUENCE OWNED BY", Some(Section::PreData)),
    ("MATERIALIZED VIEW", Some(Section::PreData)),
    ("OPERATOR FAMILY", Some(Section::PreData)),
    ("CHECK CONSTRAINT", Some(Section::PostData)),
    ("OPERATOR CLASS", Some(Section::PreData)),
    ("SECURITY LABEL", None),
    ("FOREIGN SERVER", Some(Section::PreData)),
    ("BLOB METADATA", Some(Section::PreData)),
    ("ACCESS METHOD", Some(Section::PreData)),
    ("FOREIGN TABLE", Some(Section::PreData)),
    ("EVENT TRIGGER", Some(Section::PostData)),
    ("FK CONSTRAINT", Some(Section::PostData)),
    ("LARGE OBJECT", Some(Section::PreData)),
    ("INDEX ATTACH", Some(Section::PostData)),
    ("SEQUENCE SET", Some(Section::Data)),
    ("USER MAPPING", Some(Section::PreData)),
    ("ROW SECURITY", Some(Section::PostData)),
    ("SUBSCRIPTION", Some(Section::PostData)),
    ("TABLE ATTACH", Some(Section::PreData)),
    ("DEFAULT ACL", None),
    ("PUBLICATION", Some(Section::PostData)),
    ("TABLE DATA", Some(Section::Data)),
    ("SHELL TYPE", Some(Section::PreData)),
    ("SEARCHPATH", Some(Section::PreData)),
    ("STATISTICS", Some(Section::PostData)),
    ("CONSTRAINT", Some(Section::PostData)),
    ("CONVERSION", Some(Section::PreData)),
    ("STDSTRINGS", Some(Section::PreData)),
    ("AGGREGATE", Some(Section::PreData)),
    ("COLLATION", Some(Section::PreData)),
    ("EXTENSION", Some(Section::PreData)),
    ("PROCEDURE", Some(Section::PreData)),
    ("TRANSFORM", Some(Section::PreData)),
    ("SEQUENCE", Some(Section::PreData)),
    ("DATABASE", Some(Section::PreData)),
    ("ENCODING", Some(Section::PreData)),
    ("FUNCTION", Some(Section::PreData)),
    ("OPERATOR", Some(Section::PreData)),
    ("COMMENT", None),
    ("DEFAULT", Some(Section::PreData)),
    ("TRIGGER", Some(Section::PostData)),
    ("DOMAIN", Some(Section::PreData)),
    ("POLICY", Some(Section::PostData)),
    ("SCHEMA", Some(Section::PreData)),
    ("SERVER", Some(Section::PreData)),
    ("BLOBS", Some(Section::Data)),
    ("INDEX", Some(Section::PostData)),
    ("TABLE", Some(Section::PreData)),
    ("BLOB", Some(Section::PreData)),
    ("CAST", Some(Section::PreData)),
    ("RULE", Some(Section::PostData)),
    ("TYPE", Some(Section::PreData)),
    ("VIEW", Some(Section::PreData)),
    ("ACL", None),
];

const INDEX_KINDS: &[&str] = &["INDEX", "INDEX ATTACH"];
// pg_dump only lists a CHECK constraint on its own when it is NOT VALID.
const CONSTRAINT_KINDS: &[&str] = &["CONSTRAINT", "FK CONSTRAINT", "CHECK CONSTRAINT"];

fn entry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+);\s+(\d+)\s+(\d+)\s+(.+)$").expect("static regex is valid")
    })
}

fn depends_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^;\s*depends on:\s*(.*)$").expect("static regex is valid")
    })
}

impl Manifest {
    /// Parses a listing. A listing without an archive header or without any
    /// entry, or with a line that is neither a comment nor an entry, is rejected.
    pub fn parse(listing: &str) -> Result<Self> {
        if listing.trim().is_empty() {
            return Err(AppError::Manifest("archive listing is empty".into()));
        }

        let mut saw_header = false;
        let mut entries: Vec<ManifestEntry> = Vec::new();
        let mut current_section = Section::PreData;

        for (line_no, raw) in listing.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if let Some(caps) = depends_pattern().captures(line) {
                let line_no = line_no + 1;
                let entry = entries.last_mut().ok_or_else(|| {
                    AppError::Manifest(format!(
                        "line {}: dependency list before any entry",
                        line_no
                    ))
                })?;
                entry.dependencies = parse_ids(&caps[1]).map_err(|bad| {
                    AppError::Manifest(format!("line {}: invalid dependency id '{}'", line_no, bad))
                })?;
                continue;
            }
            if line.starts_with(';') {
                if line.contains("Archive created at") || line.contains("Selected TOC Entries") {
                    saw_header = true;
                }
                continue;
            }

            let entry = parse_entry(line, current_section).map_err(|reason| {
                AppError::Manifest(format!("line {}: {}: '{}'", line_no + 1, reason, line))
            })?;
            current_section = entry.section;
            entries.push(entry);
        }

        if !saw_header {
            return Err(AppError::Manifest(
                "listing has no archive header; is this a pg_dump custom-format archive?".into(),
            ));
        }
        if entries.is_empty() {
            return Err(AppError::Manifest(
                "archive lists no entries; an empty database still lists its encoding settings"
                    .into(),
            ));
        }
        Ok(Manifest { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Splits post-data entries into index and non-index lists, keeping the
    /// listing order inside each list.
    pub fn partition(&self) -> PostDataPartition {
        let (index_only, other_post_data) = self
            .entries
            .iter()
            .filter(|e| e.section == Section::PostData)
            .cloned()
            .partition(|e| e.tag == EntryTag::Index);
        PostDataPartition { index_only, other_post_data }
    }

    pub fn counts(&self) -> ObjectCounts {
        let count = |kinds: &[&str]| {
            self.entries
                .iter()
                .filter(|e| kinds.contains(&e.kind.as_str()))
                .count()
        };
        ObjectCounts {
            tables: count(&["TABLE"]),
            indexes: count(&["INDEX"]),
            constraints: count(CONSTRAINT_KINDS),
        }
    }
}

fn parse_ids(raw: &str) -> std::result::Result<Vec<u32>, String> {
    raw.split_whitespace()
        .map(|id| id.parse::<u32>().map_err(|_| id.to_string()))
        .collect()
}

fn parse_entry(
    line: &str,
    previous_section: Section,
) -> std::result::Result<ManifestEntry, String> {
    let caps = entry_pattern()
        .captures(line)
        .ok_or_else(|| "not a listing entry".to_string())?;
    let dump_id = caps[1]
        .parse::<u32>()
        .map_err(|_| "dump id out of range".to_string())?;
    let described = &caps[4];

    let (kind, section, rest) = match KINDS
        .iter()
        .find(|(kind, _)| described == *kind || described.starts_with(&format!("{} ", kind)))
    {
        Some((kind, section)) => (
            kind.to_string(),
            section.unwrap_or(previous_section),
            described[kind.len()..].trim_start(),
        ),
        None => {
            // Kinds newer than this table: keep going with the surrounding section.
            let (kind, rest) = described.split_once(' ').unwrap_or((described, ""));
            tracing::warn!(
                "Unknown manifest entry kind '{}' (id {}), treating it as {:?}",
                kind,
                dump_id,
                previous_section
            );
            (kind.to_string(), previous_section, rest)
        }
    };

    let (namespace, name, owner) = split_identity(rest, line.ends_with(' '));
    let tag = match section {
        Section::PreData => EntryTag::Schema,
        Section::Data => EntryTag::Data,
        Section::PostData if INDEX_KINDS.contains(&kind.as_str()) => EntryTag::Index,
        Section::PostData => EntryTag::OtherPostData,
    };

    Ok(ManifestEntry {
        dump_id,
        kind,
        section,
        tag,
        namespace,
        name,
        owner,
        dependencies: Vec::new(),
        line: line.to_string(),
    })
}

/// `<namespace> <tag words...> <owner>`; the owner is blank when the line ends in a space.
fn split_identity(rest: &str, owner_blank: bool) -> (String, String, String) {
    let mut words: Vec<&str> = rest.split(' ').filter(|w| !w.is_empty()).collect();
    if words.is_empty() {
        return ("-".into(), String::new(), String::new());
    }
    let namespace = words.remove(0).to_string();
    let owner = if owner_blank || words.len() < 2 {
        String::new()
    } else {
        words.pop().unwrap_or_default().to_string()
    };
    (namespace, words.join(" "), owner)
}
