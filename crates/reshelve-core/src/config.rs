use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Folder name under the root that receives relocated duplicates.
pub const DEFAULT_DUPLICATES_DIR: &str = "_duplicates";
/// Engine state (SQLite store, journal, graveyard) lives here, relative to the root.
pub const DEFAULT_STATE_DIR: &str = ".reshelve";
pub const DEFAULT_EXTRACTION_DIR: &str = "extracted";
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.75;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 200;
pub const DEFAULT_STREAMING_THRESHOLD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub root_paths: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub state_dir: String,
    pub duplicates_dir: String,
    pub extraction_dir: String,
    pub max_chunk_size: usize,
    pub confidence_floor: f64,
    pub streaming_threshold: u64,
    /// 0 lets rayon pick one worker per core.
    pub hash_workers: usize,
    pub hash_batch_size: usize,
    pub guard_markers: Vec<String>,
    pub guarded_roots: Vec<String>,
    pub protected_patterns: Vec<String>,
    pub mixed_origin: MixedOriginPolicy,
    pub organize_nested: bool,
    pub archive_after_days: Option<u64>,
    pub dry_run: bool,
    pub categories: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CategoryRule {
    pub name: String,
    pub folder: String,
    pub extensions: Vec<String>,
}

/// Which member wins when an archive-extracted file and a pre-existing file
/// share the same content.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MixedOriginPolicy {
    #[default]
    PreferUntracked,
    PreferExtracted,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_paths: Vec::new(),
            ignore_patterns: Vec::new(),
            state_dir: DEFAULT_STATE_DIR.to_string(),
            duplicates_dir: DEFAULT_DUPLICATES_DIR.to_string(),
            extraction_dir: DEFAULT_EXTRACTION_DIR.to_string(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            hash_workers: 0,
            hash_batch_size: 256,
            guard_markers: default_guard_markers(),
            guarded_roots: Vec::new(),
            protected_patterns: vec![
                "important_*".to_string(),
                "*.key".to_string(),
                "*.license".to_string(),
            ],
            mixed_origin: MixedOriginPolicy::default(),
            organize_nested: false,
            archive_after_days: None,
            dry_run: false,
            categories: default_categories(),
        }
    }
}

impl AppConfig {
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        Self {
            root_paths: vec![root.as_ref().to_string_lossy().into_owned()],
            ..Self::default()
        }
    }

    pub fn state_dir_for(&self, root: &Path) -> PathBuf {
        resolve_under(root, &self.state_dir)
    }

    pub fn duplicates_dir_for(&self, root: &Path) -> PathBuf {
        resolve_under(root, &self.duplicates_dir)
    }

    pub fn extraction_dir_for(&self, root: &Path) -> PathBuf {
        resolve_under(root, &self.extraction_dir)
    }

    /// Folder for a category name. Unknown categories map to themselves.
    pub fn folder_for(&self, category: &str) -> String {
        self.categories
            .iter()
            .find(|rule| rule.name.eq_ignore_ascii_case(category))
            .map(|rule| rule.folder.clone())
            .unwrap_or_else(|| category.to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(ConfigError::Message(format!(
                "confidence_floor must be within 0.0..=1.0, got {}",
                self.confidence_floor
            )));
        }
        if self.max_chunk_size == 0 {
            return Err(ConfigError::Message(
                "max_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.hash_batch_size == 0 {
            return Err(ConfigError::Message(
                "hash_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_under(root: &Path, dir: &str) -> PathBuf {
    let dir = Path::new(dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}

pub fn default_guard_markers() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        "Cargo.toml",
        "package.json",
        "pyproject.toml",
        "go.mod",
        ".reshelve-keep",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_categories() -> Vec<CategoryRule> {
    let rule = |name: &str, folder: &str, exts: &[&str]| CategoryRule {
        name: name.to_string(),
        folder: folder.to_string(),
        extensions: exts.iter().map(|e| e.to_string()).collect(),
    };
    vec![
        rule(
            "Documents",
            "Documents",
            &[".pdf", ".doc", ".docx", ".txt", ".odt", ".rtf", ".tex", ".wpd"],
        ),
        rule(
            "Images",
            "Images",
            &[".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".bmp", ".tiff"],
        ),
        rule(
            "Videos",
            "Videos",
            &[".mp4", ".avi", ".mkv", ".mov", ".wmv", ".flv", ".webm", ".mpeg", ".mpg"],
        ),
        rule(
            "Audio",
            "Audio",
            &[".mp3", ".wav", ".flac", ".aac", ".ogg", ".wma", ".m4a", ".opus"],
        ),
        rule(
            "Archives",
            "Archives",
            &[".zip", ".rar", ".7z", ".tar", ".gz", ".tgz", ".bz2", ".xz", ".iso"],
        ),
        rule(
            "Code",
            "Code",
            &[".py", ".js", ".html", ".css", ".cpp", ".java", ".c", ".rs", ".go", ".php"],
        ),
        rule(
            "Data",
            "Data",
            &[".json", ".xml", ".csv", ".sql", ".db", ".sqlite"],
        ),
        rule(
            "Executables",
            "Software",
            &[".exe", ".msi", ".app", ".deb", ".rpm", ".dmg", ".pkg"],
        ),
    ]
}

/// Load `Reshelve.toml` (optional) layered with `RESHELVE_*` environment variables.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Reshelve").required(false))
        .add_source(
            Environment::with_prefix("RESHELVE")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("root_paths")
                .with_list_parse_key("ignore_patterns")
                .with_list_parse_key("guarded_roots")
                .with_list_parse_key("protected_patterns"),
        )
        .build()?;
    let config = builder.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        if result
            .iter()
            .any(|existing| dir_path.starts_with(Path::new(existing)))
        {
            continue;
        }
        result.retain(|existing| !Path::new(existing).starts_with(dir_path));
        result.push(dir);
    }

    result
}
