//! Persisted session state: cookie, cached tokens, TOTP secret, preferences.
//!
//! One JSON document, read-modify-write. Every mutation is flushed to disk
//! immediately (temp file + rename), so a crash never leaves a half-written
//! file. There is no cross-process locking: the tool assumes it is the only
//! writer, which is fine for a single-user CLI.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_json::Error),
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io: {e}"),
            ConfigError::Json(e) => write!(f, "config json: {e}"),
            ConfigError::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Rotating TOTP secret in its at-rest encoded form, tagged with the
/// generation the server expects. The version is only ever increased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpState {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub quality: String,
    /// Long-lived login cookie. Everything else can be rebuilt from it.
    #[serde(default)]
    pub sp_dc: String,
    #[serde(rename = "accessToken", default)]
    pub access_token: String,
    #[serde(rename = "clientId", default)]
    pub client_id: String,
    #[serde(rename = "clientToken", default)]
    pub client_token: String,
    /// Epoch milliseconds; -1 means no token has ever been stored.
    #[serde(rename = "accessTokenExpire", default)]
    pub access_token_expire: i64,
    #[serde(rename = "accept-language", default)]
    pub accept_language: Vec<String>,
    #[serde(default)]
    pub totp: TotpState,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            quality: "MP4_128".into(),
            sp_dc: String::new(),
            access_token: String::new(),
            client_id: String::new(),
            client_token: String::new(),
            access_token_expire: -1,
            accept_language: Vec::new(),
            totp: TotpState::default(),
        }
    }
}

impl Config {
    /// Merge `src` into `self`, skipping unset source fields: empty strings,
    /// zero integers, and empty lists never overwrite an existing value.
    pub fn merge_from(&mut self, src: &Config) {
        merge_string(&mut self.quality, &src.quality);
        merge_string(&mut self.sp_dc, &src.sp_dc);
        merge_string(&mut self.access_token, &src.access_token);
        merge_string(&mut self.client_id, &src.client_id);
        merge_string(&mut self.client_token, &src.client_token);
        if src.access_token_expire != 0 {
            self.access_token_expire = src.access_token_expire;
        }
        if !src.accept_language.is_empty() {
            self.accept_language = src.accept_language.clone();
        }
        merge_string(&mut self.totp.secret, &src.totp.secret);
        if src.totp.version != 0 {
            self.totp.version = src.totp.version;
        }
    }
}

fn merge_string(dest: &mut String, src: &str) {
    if !src.is_empty() {
        *dest = src.to_string();
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable home of a [`Config`], pinned to one file path.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    config: Config,
}

impl Store {
    /// Default location: `<config dir>/sptoken.json`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("sptoken.json"))
    }

    /// Open the store at `path`, creating the file with defaults if it does
    /// not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Store {
            path: path.into(),
            config: Config::default(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-read the file, merging its contents over the defaults. The merged
    /// result is written back so the on-disk document always carries the
    /// full field set.
    pub fn reload(&mut self) -> Result<()> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => {
                let file_config: Config = serde_json::from_str(&data)?;
                let mut merged = Config::default();
                merged.merge_from(&file_config);
                self.config = merged;
                self.save()?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("[config] no file at {}, creating one", self.path.display());
                self.save()
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self) -> &Config {
        &self.config
    }

    /// Mutate the in-memory document and flush it to disk in one step.
    pub fn update(&mut self, mutate: impl FnOnce(&mut Config)) -> Result<()> {
        mutate(&mut self.config);
        self.save()
    }

    /// Replace the whole document and flush.
    pub fn set(&mut self, config: Config) -> Result<()> {
        self.config = config;
        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write atomically: temp file in the same directory, then rename.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.quality, "MP4_128");
        assert_eq!(c.access_token_expire, -1);
        assert!(c.sp_dc.is_empty());
        assert_eq!(c.totp, TotpState::default());
    }

    #[test]
    fn test_merge_skips_unset_fields() {
        let mut dest = Config {
            sp_dc: "cookie".into(),
            access_token: "tok".into(),
            access_token_expire: 12345,
            totp: TotpState {
                secret: "SECRET".into(),
                version: 9,
            },
            ..Config::default()
        };
        let src = Config {
            quality: String::new(),
            access_token: "newer".into(),
            access_token_expire: 0,
            sp_dc: String::new(),
            ..Config::default()
        };
        dest.merge_from(&src);

        assert_eq!(dest.sp_dc, "cookie", "empty source must not clear cookie");
        assert_eq!(dest.access_token, "newer");
        assert_eq!(dest.access_token_expire, 12345, "zero expire is unset");
        assert_eq!(dest.totp.secret, "SECRET");
        assert_eq!(dest.totp.version, 9);
        assert_eq!(dest.quality, "MP4_128");
    }

    #[test]
    fn test_merge_overwrites_set_fields() {
        let mut dest = Config::default();
        let src = Config {
            sp_dc: "abc".into(),
            accept_language: vec!["en".into(), "de".into()],
            totp: TotpState {
                secret: "S".into(),
                version: 3,
            },
            ..Config::default()
        };
        dest.merge_from(&src);
        assert_eq!(dest.sp_dc, "abc");
        assert_eq!(
            dest.accept_language,
            vec!["en".to_string(), "de".to_string()]
        );
        assert_eq!(dest.totp.version, 3);
    }

    #[test]
    fn test_open_creates_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sptoken.json");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.get(), &Config::default());
    }

    #[test]
    fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sptoken.json");

        let mut store = Store::open(&path).unwrap();
        store
            .update(|c| {
                c.sp_dc = "cookie-value".into();
                c.totp.version = 12;
            })
            .unwrap();

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.get().sp_dc, "cookie-value");
        assert_eq!(reopened.get().totp.version, 12);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sptoken.json");
        std::fs::write(&path, r#"{"sp_dc": "only-cookie"}"#).unwrap();

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get().sp_dc, "only-cookie");
        assert_eq!(store.get().quality, "MP4_128");
        assert_eq!(store.get().access_token_expire, -1);
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        for key in [
            "quality",
            "sp_dc",
            "accessToken",
            "clientId",
            "clientToken",
            "accessTokenExpire",
            "accept-language",
            "totp",
        ] {
            assert!(json.contains(key), "missing key {key} in {json}");
        }
    }
}
