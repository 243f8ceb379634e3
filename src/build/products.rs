//! Declared build products and how they are found in a prefix.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::audit::normalize_name;
use crate::object;
use crate::platform::Platform;

/// Something the build script must install into the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ProductSpec {
    /// A shared library matching any of `names` (`libfoo`, `libfoo.so.1`
    /// and `libfoo-1.dll` all normalize to `libfoo`).
    Library {
        names: Vec<String>,
        /// Directory relative to the prefix; `lib` (`bin` on Windows) by default.
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    Executable {
        names: Vec<String>,
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    /// Any file at `path` relative to the prefix.
    File { path: PathBuf },
}

impl ProductSpec {
    pub fn label(&self) -> String {
        match self {
            Self::Library { names, .. } | Self::Executable { names, .. } => {
                names.first().cloned().unwrap_or_default()
            }
            Self::File { path } => path.display().to_string(),
        }
    }

    fn search_dir(&self, platform: &Platform) -> PathBuf {
        match self {
            Self::Library { dir: Some(dir), .. } | Self::Executable { dir: Some(dir), .. } => {
                dir.clone()
            }
            Self::Library { dir: None, .. } if !platform.is_windows() => PathBuf::from("lib"),
            Self::Library { .. } | Self::Executable { .. } => PathBuf::from("bin"),
            Self::File { path } => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for ProductSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library { .. } => write!(f, "library {}", self.label()),
            Self::Executable { .. } => write!(f, "executable {}", self.label()),
            Self::File { .. } => write!(f, "file {}", self.label()),
        }
    }
}

/// Where a product was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductMatch {
    pub product: String,
    /// Relative to the prefix.
    pub path: PathBuf,
}

/// Find `spec` under `prefix`. Libraries and executables must be objects
/// built for `platform`; the error names the closest miss.
pub fn locate(spec: &ProductSpec, prefix: &Path, platform: &Platform) -> Result<ProductMatch, String> {
    let found = |path: &Path| ProductMatch {
        product: spec.to_string(),
        path: path
            .strip_prefix(prefix)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf()),
    };

    let names = match spec {
        ProductSpec::File { path } => {
            let full = prefix.join(path);
            return if full.exists() {
                Ok(found(&full))
            } else {
                Err(format!("{} does not exist", path.display()))
            };
        }
        ProductSpec::Library { names, .. } | ProductSpec::Executable { names, .. } => names,
    };
    let wanted: Vec<String> = names.iter().map(|n| normalize_name(n)).collect();

    let dir = prefix.join(spec.search_dir(platform));
    if !dir.is_dir() {
        return Err(format!("{} does not exist", dir.display()));
    }

    let mut miss = None;
    for entry in WalkDir::new(&dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !path.is_file() || !looks_like(spec, path, platform) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !wanted.contains(&normalize_name(&name)) {
            continue;
        }
        match object::open(path) {
            Ok(obj) if obj.is_for_platform(platform) => return Ok(found(path)),
            Ok(obj) => {
                miss = Some(format!(
                    "{name} is a {} {} object, not {platform}",
                    obj.machine_type(),
                    obj.format()
                ))
            }
            Err(e) => miss = Some(e.to_string()),
        }
    }
    Err(miss.unwrap_or_else(|| {
        format!("no file named {} in {}", names.join(" or "), dir.display())
    }))
}

/// Extension filter: a library on Windows is a `.dll`, an executable a `.exe`.
fn looks_like(spec: &ProductSpec, path: &Path, platform: &Platform) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    match spec {
        ProductSpec::Library { .. } => {
            let ext = platform.dlext();
            name.ends_with(&format!(".{ext}")) || name.contains(&format!(".{ext}."))
        }
        ProductSpec::Executable { .. } => platform.exeext().is_empty() || name.ends_with(platform.exeext()),
        ProductSpec::File { .. } => true,
    }
}
