//! Configuration file handling.
//!
//! The file is TOML, e.g.:
//!
//! ```toml
//! [paths]
//! mount_dir = "/var/tmp/osimg/mnt"
//! image_dir = "/var/tmp/osimg/images"
//! distfiles_dir = "/var/cache/distfiles"
//!
//! [checksum]
//! canonical_permissions = true
//! ```

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

/// Used when neither `--config` nor the environment name a file.
pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/osimg/config.toml";
/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub(crate) const CONFIG_ENV: &str = "OSIMG_CONFIG";

/// Lookups by dotted key, e.g. `paths.mount_dir`.
pub(crate) trait ConfigAccessor {
    /// The string at `key`, if present and a string.
    fn get_string(&self, key: &str) -> Option<String>;
    /// The boolean at `key`, if present and a boolean.
    fn get_bool(&self, key: &str) -> Option<bool>;
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct PathsConfig {
    pub(crate) mount_dir: Utf8PathBuf,
    pub(crate) image_dir: Utf8PathBuf,
    pub(crate) distfiles_dir: Option<Utf8PathBuf>,
    pub(crate) binpkgs_dir: Option<Utf8PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            mount_dir: "/var/tmp/osimg/mnt".into(),
            image_dir: "/var/tmp/osimg/images".into(),
            distfiles_dir: None,
            binpkgs_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct ChecksumConfig {
    pub(crate) canonical_permissions: bool,
    pub(crate) ignore_xattrs: bool,
}

/// The typed view of the settings this tool uses.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct ImagerConfig {
    pub(crate) paths: PathsConfig,
    pub(crate) checksum: ChecksumConfig,
}

impl ImagerConfig {
    /// Resolve a relative `path` against `paths.mount_dir`.
    pub(crate) fn in_mount_dir(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.paths.mount_dir.join(path)
    }

    /// Resolve a relative `path` against `paths.image_dir`.
    pub(crate) fn in_image_dir(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.paths.image_dir.join(path)
    }
}

/// A loaded configuration file.
#[derive(Debug, Default)]
pub(crate) struct Config {
    table: toml::Table,
    pub(crate) imager: ImagerConfig,
}

impl Config {
    pub(crate) fn from_toml(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let imager: ImagerConfig = toml::from_str(content)?;
        Ok(Self { table, imager })
    }

    /// Load `path`. A missing file is an error unless `optional` is set, in
    /// which case the defaults are used.
    #[context("Loading config {path}")]
    pub(crate) fn load_from(path: &Utf8Path, optional: bool) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if optional && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {path}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_toml(&content)
    }

    /// Load the file named by `--config`, then `$OSIMG_CONFIG`, falling back
    /// to the optional default path.
    pub(crate) fn load(explicit: Option<&Utf8Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p, false);
        }
        match std::env::var(CONFIG_ENV) {
            Ok(p) if !p.is_empty() => Self::load_from(Utf8Path::new(&p), false),
            _ => Self::load_from(Utf8Path::new(DEFAULT_CONFIG_PATH), true),
        }
        .context("Reading configuration")
    }

    fn lookup(&self, key: &str) -> Option<&toml::Value> {
        let mut parts = key.split('.');
        let mut cur = self.table.get(parts.next()?)?;
        for part in parts {
            cur = cur.as_table()?.get(part)?;
        }
        Some(cur)
    }
}

impl ConfigAccessor for Config {
    fn get_string(&self, key: &str) -> Option<String> {
        self.lookup(key)?.as_str().map(ToOwned::to_owned)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.lookup(key)?.as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    const FIXTURE: &str = indoc! { r#"
        [paths]
        mount_dir = "/srv/mnt"
        distfiles_dir = "/srv/distfiles"

        [checksum]
        canonical_permissions = true

        [extra.nested]
        name = "value"
    "# };

    #[test]
    fn test_parse() {
        let c = Config::from_toml(FIXTURE).unwrap();
        assert_eq!(c.imager.paths.mount_dir, "/srv/mnt");
        // Unset keys keep their defaults
        assert_eq!(c.imager.paths.image_dir, "/var/tmp/osimg/images");
        assert_eq!(
            c.imager.paths.distfiles_dir.as_deref(),
            Some(Utf8Path::new("/srv/distfiles"))
        );
        assert_eq!(c.imager.paths.binpkgs_dir, None);
        assert!(c.imager.checksum.canonical_permissions);
        assert!(!c.imager.checksum.ignore_xattrs);
    }

    #[test]
    fn test_accessor() {
        let c = Config::from_toml(FIXTURE).unwrap();
        assert_eq!(c.get_string("paths.mount_dir").as_deref(), Some("/srv/mnt"));
        assert_eq!(c.get_string("extra.nested.name").as_deref(), Some("value"));
        assert_eq!(c.get_bool("checksum.canonical_permissions"), Some(true));
        // Wrong type, missing, or walking through a non-table
        assert_eq!(c.get_bool("paths.mount_dir"), None);
        assert_eq!(c.get_string("paths.nope"), None);
        assert_eq!(c.get_string("paths.mount_dir.deeper"), None);
        assert_eq!(c.get_string(""), None);
    }

    #[test]
    fn test_empty() {
        let c = Config::from_toml("").unwrap();
        assert_eq!(c.imager, ImagerConfig::default());
        assert_eq!(c.get_string("paths.mount_dir"), None);
    }

    #[test]
    fn test_invalid() {
        assert!(Config::from_toml("[paths]\nmount_dir = 42\n").is_err());
        assert!(Config::from_toml("not toml").is_err());
    }

    #[test]
    fn test_load_from() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let missing = dir.join("missing.toml");
        assert_eq!(
            Config::load_from(&missing, true).unwrap().imager,
            ImagerConfig::default()
        );
        assert!(Config::load_from(&missing, false).is_err());
        let p = dir.join("config.toml");
        std::fs::write(&p, FIXTURE).unwrap();
        let c = Config::load(Some(p.as_path())).unwrap();
        assert_eq!(c.imager.paths.mount_dir, "/srv/mnt");
    }

    #[test]
    fn test_resolve() {
        let c = ImagerConfig::default();
        assert_eq!(
            c.in_image_dir(Utf8Path::new("disk.img")),
            "/var/tmp/osimg/images/disk.img"
        );
        // Absolute paths are kept
        assert_eq!(c.in_mount_dir(Utf8Path::new("/mnt/x")), "/mnt/x");
    }
}
