//! Per-environment state record.
//!
//! The record lives at `<env>/.imagesmith-state` and uses a line-oriented
//! `KEY=VALUE` format with a version header comment:
//!
//! ```text
//! # imagesmith-state v1
//! SCHEMA_VERSION=1
//! OWNER_VARIANT=gnome
//! STAGE_BOOTSTRAP_AT=2026-10-19T08:12:44Z
//! STAGE_CHROOT_AT=adopted@2026-10-19T08:12:44Z
//! ```
//!
//! Every write replaces the whole file through a temporary file in the same
//! directory followed by a rename, so readers only ever see a complete
//! record. Absence of the file or of a field is a normal state, not an error.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// File name of the record inside an environment.
pub const STATE_FILENAME: &str = ".imagesmith-state";

/// Highest record format this build understands and the one it writes.
pub const SCHEMA_VERSION: u32 = 1;

const HEADER_PREFIX: &str = "# imagesmith-state v";
const ADOPTED_PREFIX: &str = "adopted@";

/// Known record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    SchemaVersion,
    OwnerVariant,
    StageBootstrapAt,
    StageChrootAt,
    StageTrackSwitchAt,
    PackageSelectionHash,
    Track,
    KernelMetaPackage,
    KernelVersion,
    InvalidatedAt,
}

impl Field {
    /// Canonical on-disk order.
    pub const ALL: [Field; 10] = [
        Field::SchemaVersion,
        Field::OwnerVariant,
        Field::StageBootstrapAt,
        Field::StageChrootAt,
        Field::StageTrackSwitchAt,
        Field::PackageSelectionHash,
        Field::Track,
        Field::KernelMetaPackage,
        Field::KernelVersion,
        Field::InvalidatedAt,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Field::SchemaVersion => "SCHEMA_VERSION",
            Field::OwnerVariant => "OWNER_VARIANT",
            Field::StageBootstrapAt => "STAGE_BOOTSTRAP_AT",
            Field::StageChrootAt => "STAGE_CHROOT_AT",
            Field::StageTrackSwitchAt => "STAGE_TRACK_SWITCH_AT",
            Field::PackageSelectionHash => "PACKAGE_SELECTION_HASH",
            Field::Track => "TRACK",
            Field::KernelMetaPackage => "KERNEL_META_PACKAGE",
            Field::KernelVersion => "KERNEL_VERSION",
            Field::InvalidatedAt => "INVALIDATED_AT",
        }
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.key() == key)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A point in time at which a stage completed.
///
/// `adopted` marks stages that were inferred from an environment's contents
/// rather than observed completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMark {
    pub at: OffsetDateTime,
    pub adopted: bool,
}

impl StageMark {
    pub fn now() -> Self {
        Self {
            at: now_utc_seconds(),
            adopted: false,
        }
    }

    pub fn adopted_now() -> Self {
        Self {
            at: now_utc_seconds(),
            adopted: true,
        }
    }

    /// Parse a stored value. Unparseable values yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (adopted, stamp) = match raw.strip_prefix(ADOPTED_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let at = OffsetDateTime::parse(stamp, &Rfc3339).ok()?;
        Some(Self { at, adopted })
    }
}

impl fmt::Display for StageMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = self.at.format(&Rfc3339).map_err(|_| fmt::Error)?;
        if self.adopted {
            write!(f, "{ADOPTED_PREFIX}{stamp}")
        } else {
            f.write_str(&stamp)
        }
    }
}

fn now_utc_seconds() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// Typed view of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentState {
    /// Unparseable versions are reported as `u32::MAX` so they are never
    /// considered understood.
    pub schema_version: u32,
    pub owner_variant: Option<String>,
    pub stage_bootstrap_at: Option<StageMark>,
    pub stage_chroot_at: Option<StageMark>,
    pub stage_track_switch_at: Option<StageMark>,
    pub package_selection_hash: Option<String>,
    pub track: Option<String>,
    pub kernel_meta_package: Option<String>,
    pub kernel_version: Option<String>,
    pub invalidated_at: Option<StageMark>,
}

impl EnvironmentState {
    fn from_record(record: &Record) -> Self {
        let schema_version = match record.get(Field::SchemaVersion.key()) {
            Some(raw) => raw.trim().parse().unwrap_or(u32::MAX),
            None => record.header_version.unwrap_or(0),
        };
        let text = |field: Field| record.get(field.key()).map(str::to_string);
        let mark = |field: Field| record.get(field.key()).and_then(StageMark::parse);

        Self {
            schema_version,
            owner_variant: text(Field::OwnerVariant),
            stage_bootstrap_at: mark(Field::StageBootstrapAt),
            stage_chroot_at: mark(Field::StageChrootAt),
            stage_track_switch_at: mark(Field::StageTrackSwitchAt),
            package_selection_hash: text(Field::PackageSelectionHash),
            track: text(Field::Track),
            kernel_meta_package: text(Field::KernelMetaPackage),
            kernel_version: text(Field::KernelVersion),
            invalidated_at: mark(Field::InvalidatedAt),
        }
    }

    /// Present fields with their raw values, in canonical record order.
    pub fn present_fields(&self) -> Vec<(Field, String)> {
        Field::ALL
            .into_iter()
            .filter_map(|field| self.field_value(field).map(|value| (field, value)))
            .collect()
    }

    /// Raw field value as it would appear on disk.
    pub fn field_value(&self, field: Field) -> Option<String> {
        let mark = |m: &Option<StageMark>| m.as_ref().map(|m| m.to_string());
        match field {
            Field::SchemaVersion => Some(self.schema_version.to_string()),
            Field::OwnerVariant => self.owner_variant.clone(),
            Field::StageBootstrapAt => mark(&self.stage_bootstrap_at),
            Field::StageChrootAt => mark(&self.stage_chroot_at),
            Field::StageTrackSwitchAt => mark(&self.stage_track_switch_at),
            Field::PackageSelectionHash => self.package_selection_hash.clone(),
            Field::Track => self.track.clone(),
            Field::KernelMetaPackage => self.kernel_meta_package.clone(),
            Field::KernelVersion => self.kernel_version.clone(),
            Field::InvalidatedAt => mark(&self.invalidated_at),
        }
    }
}

/// Untyped record preserving unknown keys and their order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Record {
    header_version: Option<u32>,
    entries: Vec<(String, String)>,
}

impl Record {
    fn fresh() -> Self {
        Self {
            header_version: Some(SCHEMA_VERSION),
            entries: vec![(
                Field::SchemaVersion.key().to_string(),
                SCHEMA_VERSION.to_string(),
            )],
        }
    }

    fn parse(text: &str) -> Self {
        let mut record = Record::default();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix(HEADER_PREFIX) {
                record.header_version = rest.trim().parse().ok();
                continue;
            }
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            record.set(key.trim(), value);
        }
        record
    }

    /// Empty values read as absent.
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    fn render(&self) -> String {
        let version = self
            .get(Field::SchemaVersion.key())
            .and_then(|v| v.trim().parse::<u32>().ok())
            .or(self.header_version)
            .unwrap_or(SCHEMA_VERSION);

        let mut out = format!("{HEADER_PREFIX}{version}\n");
        for field in Field::ALL {
            if let Some(value) = self.get(field.key()) {
                out.push_str(&format!("{}={}\n", field.key(), value));
            }
        }
        for (key, value) in &self.entries {
            if Field::from_key(key).is_none() && !value.is_empty() {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        out
    }
}

/// Durable field store for one environment.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn for_env(env_dir: &Path) -> Self {
        Self {
            path: env_dir.join(STATE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn load_record(&self) -> Result<Option<(Record, String)>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some((Record::parse(&text), text))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("reading state record '{}'", self.path.display()))
            }
        }
    }

    /// Load the typed record, or `None` when the environment has none.
    pub fn load(&self) -> Result<Option<EnvironmentState>> {
        Ok(self
            .load_record()?
            .map(|(record, _)| EnvironmentState::from_record(&record)))
    }

    /// Read a single field. Never fails: unreadable records read as absent.
    pub fn read(&self, field: Field) -> Option<String> {
        match self.load_record() {
            Ok(Some((record, _))) => record.get(field.key()).map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "state record unreadable");
                None
            }
        }
    }

    pub fn write(&self, field: Field, value: &str) -> Result<()> {
        self.write_fields(&[(field, value.to_string())])
    }

    /// Apply several field updates as one atomic replacement.
    pub fn write_fields(&self, updates: &[(Field, String)]) -> Result<()> {
        for (field, value) in updates {
            validate_value(*field, value)?;
        }

        let dir = self.path.parent().ok_or_else(|| {
            anyhow::anyhow!("state record has no parent: {}", self.path.display())
        })?;
        if !dir.is_dir() {
            bail!(
                "cannot write state record: environment '{}' does not exist",
                dir.display()
            );
        }

        // A record-less environment starts from a fresh header; nothing reaches
        // disk until every check below has passed.
        let (mut record, previous) = self
            .load_record()?
            .unwrap_or_else(|| (Record::fresh(), String::new()));

        let current = EnvironmentState::from_record(&record);
        if current.schema_version > SCHEMA_VERSION {
            bail!(
                "refusing to modify state record '{}': schema version {} is newer than supported {}",
                self.path.display(),
                current.schema_version,
                SCHEMA_VERSION
            );
        }

        for (field, value) in updates {
            if *field == Field::SchemaVersion {
                let requested: u32 = value.trim().parse()?;
                if requested < current.schema_version {
                    bail!(
                        "refusing to lower state schema version from {} to {}",
                        current.schema_version,
                        requested
                    );
                }
            }
            record.set(field.key(), value);
        }

        if record.get(Field::StageChrootAt.key()).is_some()
            && record.get(Field::StageBootstrapAt.key()).is_none()
        {
            bail!(
                "refusing to record {} without {} in '{}'",
                Field::StageChrootAt,
                Field::StageBootstrapAt,
                self.path.display()
            );
        }

        let rendered = record.render();
        if rendered == previous {
            return Ok(());
        }
        self.persist(dir, &rendered)
    }

    fn persist(&self, dir: &Path, text: &str) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".imagesmith-state.")
            .tempfile_in(dir)
            .with_context(|| format!("creating temporary state file in '{}'", dir.display()))?;
        tmp.write_all(text.as_bytes())
            .with_context(|| format!("writing temporary state file '{}'", tmp.path().display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("syncing temporary state file '{}'", tmp.path().display()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing state record '{}'", self.path.display()))?;

        // Directory fsync makes the rename itself durable; not all filesystems support it.
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
        Ok(())
    }
}

fn validate_value(field: Field, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("empty value for {field}; leave the field absent instead");
    }
    if value.contains('\n') || value.contains('\r') {
        bail!("value for {field} contains a line break");
    }
    if field == Field::SchemaVersion && value.trim().parse::<u32>().is_err() {
        bail!("{field} must be an unsigned integer, got '{value}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env() -> (TempDir, StateStore) {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::for_env(tmp.path());
        (tmp, store)
    }

    #[test]
    fn test_read_missing_record_is_absent() {
        let (_tmp, store) = env();
        assert_eq!(store.read(Field::OwnerVariant), None);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_first_write_materializes_header() {
        let (_tmp, store) = env();
        store.write(Field::OwnerVariant, "gnome").unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            text,
            "# imagesmith-state v1\nSCHEMA_VERSION=1\nOWNER_VARIANT=gnome\n"
        );
    }

    #[test]
    fn test_read_after_write() {
        let (_tmp, store) = env();
        store.write(Field::Track, "latest").unwrap();
        assert_eq!(store.read(Field::Track).as_deref(), Some("latest"));
        store.write(Field::Track, "rc").unwrap();
        assert_eq!(store.read(Field::Track).as_deref(), Some("rc"));
    }

    #[test]
    fn test_repeated_write_is_byte_stable() {
        let (_tmp, store) = env();
        store.write(Field::KernelVersion, "6.12.3-1").unwrap();
        let first = fs::read(store.path()).unwrap();
        store.write(Field::KernelVersion, "6.12.3-1").unwrap();
        let second = fs::read(store.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_temporary_files_left_behind() {
        let (tmp, store) = env();
        store.write(Field::OwnerVariant, "kde").unwrap();
        store.write(Field::Track, "next").unwrap();
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STATE_FILENAME.to_string()]);
    }

    #[test]
    fn test_chroot_stage_requires_bootstrap() {
        let (_tmp, store) = env();
        let err = store
            .write(Field::StageChrootAt, &StageMark::now().to_string())
            .unwrap_err();
        assert!(err.to_string().contains("STAGE_BOOTSTRAP_AT"));
        assert!(!store.exists());

        store
            .write_fields(&[
                (Field::StageBootstrapAt, StageMark::now().to_string()),
                (Field::StageChrootAt, StageMark::now().to_string()),
            ])
            .unwrap();
        let state = store.load().unwrap().unwrap();
        assert!(state.stage_bootstrap_at.is_some());
        assert!(state.stage_chroot_at.is_some());
    }

    #[test]
    fn test_rejected_write_keeps_existing_record() {
        let (_tmp, store) = env();
        store.write(Field::OwnerVariant, "gnome").unwrap();
        let before = fs::read(store.path()).unwrap();

        assert!(store
            .write(Field::StageChrootAt, &StageMark::now().to_string())
            .is_err());
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_present_fields_follow_record_order() {
        let (_tmp, store) = env();
        store.write(Field::Track, "latest").unwrap();
        store.write(Field::OwnerVariant, "gnome").unwrap();
        store.write(Field::KernelVersion, "6.11.5-1").unwrap();

        let keys: Vec<_> = store
            .load()
            .unwrap()
            .unwrap()
            .present_fields()
            .into_iter()
            .map(|(field, _)| field.key())
            .collect();
        assert_eq!(
            keys,
            vec!["SCHEMA_VERSION", "OWNER_VARIANT", "TRACK", "KERNEL_VERSION"]
        );
    }

    #[test]
    fn test_schema_version_never_decreases() {
        let (_tmp, store) = env();
        store.write(Field::SchemaVersion, "1").unwrap();
        assert!(store.write(Field::SchemaVersion, "0").is_err());
    }

    #[test]
    fn test_newer_schema_is_not_modified() {
        let (_tmp, store) = env();
        let original = "# imagesmith-state v2\nSCHEMA_VERSION=2\nOWNER_VARIANT=gnome\n";
        fs::write(store.path(), original).unwrap();

        assert!(store.write(Field::Track, "stable").is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), original);
        assert_eq!(store.load().unwrap().unwrap().schema_version, 2);
    }

    #[test]
    fn test_unknown_keys_are_preserved() {
        let (_tmp, store) = env();
        fs::write(
            store.path(),
            "# imagesmith-state v1\nSCHEMA_VERSION=1\nBUILDER_NOTE=keep me\n",
        )
        .unwrap();
        store.write(Field::OwnerVariant, "xfce").unwrap();
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("BUILDER_NOTE=keep me\n"));
        assert!(text.contains("OWNER_VARIANT=xfce\n"));
    }

    #[test]
    fn test_field_order_is_insignificant_on_read() {
        let (_tmp, store) = env();
        fs::write(
            store.path(),
            "# imagesmith-state v1\nTRACK=rc\nOWNER_VARIANT=gnome\nSCHEMA_VERSION=1\n",
        )
        .unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.track.as_deref(), Some("rc"));
        assert_eq!(state.owner_variant.as_deref(), Some("gnome"));
        assert_eq!(state.schema_version, 1);
    }

    #[test]
    fn test_missing_version_field_falls_back_to_header() {
        let record = Record::parse("# imagesmith-state v1\nOWNER_VARIANT=gnome\n");
        assert_eq!(EnvironmentState::from_record(&record).schema_version, 1);

        let garbled = Record::parse("SCHEMA_VERSION=banana\n");
        assert_eq!(EnvironmentState::from_record(&garbled).schema_version, u32::MAX);
    }

    #[test]
    fn test_stage_mark_roundtrip() {
        let mark = StageMark::adopted_now();
        let text = mark.to_string();
        assert!(text.starts_with("adopted@"));
        assert_eq!(StageMark::parse(&text), Some(mark));

        let plain = StageMark::parse("2026-10-19T08:12:44Z").unwrap();
        assert!(!plain.adopted);
        assert_eq!(StageMark::parse("yesterday"), None);
    }

    #[test]
    fn test_garbled_timestamp_reads_as_absent() {
        let (_tmp, store) = env();
        fs::write(
            store.path(),
            "# imagesmith-state v1\nSCHEMA_VERSION=1\nSTAGE_BOOTSTRAP_AT=not-a-time\n",
        )
        .unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.stage_bootstrap_at, None);
        assert_eq!(
            store.read(Field::StageBootstrapAt).as_deref(),
            Some("not-a-time")
        );
    }

    #[test]
    fn test_rejects_empty_and_multiline_values() {
        let (_tmp, store) = env();
        assert!(store.write(Field::Track, "").is_err());
        assert!(store.write(Field::Track, "a\nb").is_err());
        assert!(!store.exists());
    }

    #[test]
    fn test_write_requires_environment_dir() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::for_env(&tmp.path().join("missing"));
        assert!(store.write(Field::Track, "stable").is_err());
    }
}
