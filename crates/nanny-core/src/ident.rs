//! Identifier extraction and the load-bearing naming conventions.
//!
//! Datastore paths look like `[<ds-name>] <volume-uuid>/<volume-uuid>.vmdk`,
//! instance VM names like `<human-name> (<instance-uuid>)`, array LUN paths
//! like `/vol/<flexvol>/naa.<uuid>.vmdk` (VVOL) or `/vol/<flexvol>/<ds-name>`
//! (VMFS).

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use uuid::Uuid;

/// Suffix appended to orphaned datastore folders in the first cleanup phase.
pub const RENAMED_SUFFIX: &str = ".renamed_by_nanny";

fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .expect("static uuid regex")
    })
}

/// All distinct UUIDs embedded in `text`.
pub fn uuids_in(text: &str) -> BTreeSet<Uuid> {
    uuid_regex()
        .find_iter(text)
        .filter_map(|m| Uuid::parse_str(m.as_str()).ok())
        .collect()
}

/// The single UUID embedded in a backing filename.
///
/// Returns `None` when the name carries no UUID or more than one distinct
/// UUID, since either way the id is not recoverable.
pub fn uuid_in_filename(filename: &str) -> Option<Uuid> {
    let found = uuids_in(filename);
    if found.len() == 1 {
        found.into_iter().next()
    } else {
        None
    }
}

/// True when `name` is exactly a UUID (optionally with a trailing suffix
/// such as `.vmx`).
pub fn is_uuid_shaped(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    Uuid::parse_str(stem).is_ok()
}

/// `[ds] <uuid>/<uuid>.vmdk`
pub fn shadow_vm_disk_path(datastore: &str, volume: &Uuid) -> String {
    format!("[{}] {}/{}.vmdk", datastore, volume, volume)
}

/// Split `[ds] folder/file` into `(ds, "folder/file")`.
pub fn split_datastore_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('[')?;
    let close = rest.find(']')?;
    let ds = &rest[..close];
    let tail = rest[close + 1..].trim_start();
    Some((ds, tail))
}

pub fn datastore_path(datastore: &str, relative: &str) -> String {
    format!("[{}] {}", datastore, relative)
}

/// Parse `<human-name> (<instance-uuid>)`.
pub fn parse_instance_display_name(name: &str) -> Option<(String, Uuid)> {
    let name = name.trim_end();
    let inner = name.strip_suffix(')')?;
    let open = inner.rfind(" (")?;
    let id = Uuid::parse_str(&inner[open + 2..]).ok()?;
    Some((inner[..open].to_string(), id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LunPath {
    Vvol { flexvol: String, uuid: Uuid },
    Vmfs { flexvol: String, datastore: String },
}

impl LunPath {
    pub fn flexvol(&self) -> &str {
        match self {
            LunPath::Vvol { flexvol, .. } | LunPath::Vmfs { flexvol, .. } => flexvol,
        }
    }
}

pub fn parse_lun_path(path: &str) -> Option<LunPath> {
    let rest = path.strip_prefix("/vol/")?;
    let (flexvol, leaf) = rest.split_once('/')?;
    if flexvol.is_empty() || leaf.is_empty() || leaf.contains('/') {
        return None;
    }
    if let Some(naa) = leaf.strip_prefix("naa.") {
        let id = naa.strip_suffix(".vmdk").unwrap_or(naa);
        let uuid = Uuid::parse_str(id).ok()?;
        return Some(LunPath::Vvol {
            flexvol: flexvol.to_string(),
            uuid,
        });
    }
    Some(LunPath::Vmfs {
        flexvol: flexvol.to_string(),
        datastore: leaf.to_string(),
    })
}

/// Outcome of mapping a datastore name to its storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMapping {
    Unique(String),
    NoMatch,
    Ambiguous(Vec<String>),
}

impl BackendMapping {
    pub fn backend(&self) -> Option<&str> {
        match self {
            BackendMapping::Unique(b) => Some(b),
            _ => None,
        }
    }
}

/// Maps datastore names to storage backends through a regex with a named
/// `backend` capture group.
#[derive(Debug, Clone)]
pub struct BackendMapper {
    regex: Regex,
}

pub const DEFAULT_BACKEND_PATTERN: &str = r"(?P<backend>bb\d+)";

impl BackendMapper {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        if !regex.capture_names().flatten().any(|n| n == "backend") {
            return Err(regex::Error::Syntax(format!(
                "pattern {} lacks a (?P<backend>...) group",
                pattern
            )));
        }
        Ok(Self { regex })
    }

    pub fn map(&self, datastore_name: &str) -> BackendMapping {
        let found: BTreeSet<String> = self
            .regex
            .captures_iter(datastore_name)
            .filter_map(|c| c.name("backend").map(|m| m.as_str().to_string()))
            .collect();
        match found.len() {
            0 => BackendMapping::NoMatch,
            1 => BackendMapping::Unique(found.into_iter().next().unwrap_or_default()),
            _ => BackendMapping::Ambiguous(found.into_iter().collect()),
        }
    }
}

impl Default for BackendMapper {
    fn default() -> Self {
        Self {
            regex: Regex::new(DEFAULT_BACKEND_PATTERN).expect("static backend regex"),
        }
    }
}
