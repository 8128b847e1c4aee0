use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::LocateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    /// Install directory, or the target file itself when given by hand.
    pub location: PathBuf,
    /// `None` when the version could not be determined.
    pub version: Option<String>,
}

pub trait InstallLocator {
    fn locate(&self) -> Result<Installation, LocateError>;
}

/// Uninstall entry written by the WeChat installer (32-bit view on x64 hosts).
pub const UNINSTALL_KEY: &str =
    r"SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall\WeChat";

/// Reads `InstallLocation` and `DisplayVersion` from the uninstall key.
pub struct RegistryLocator {
    pub key: String,
}

impl Default for RegistryLocator {
    fn default() -> Self {
        Self {
            key: UNINSTALL_KEY.to_string(),
        }
    }
}

#[cfg(windows)]
impl InstallLocator for RegistryLocator {
    fn locate(&self) -> Result<Installation, LocateError> {
        use windows_registry::LOCAL_MACHINE;

        let key = LOCAL_MACHINE
            .open(&self.key)
            .map_err(|e| registry_error(&self.key, e.code().0, e))?;
        let location = key
            .get_string("InstallLocation")
            .map_err(|e| registry_error("InstallLocation", e.code().0, e))?;
        let version = key
            .get_string("DisplayVersion")
            .map_err(|e| registry_error("DisplayVersion", e.code().0, e))?;

        log::debug!("registry reports WeChat {version} at {location}");
        Ok(Installation {
            location: PathBuf::from(location),
            version: Some(version),
        })
    }
}

#[cfg(windows)]
fn registry_error(what: &str, code: i32, detail: impl std::fmt::Display) -> LocateError {
    const E_FILE_NOT_FOUND: u32 = 0x8007_0002;
    const E_ACCESS_DENIED: u32 = 0x8007_0005;

    log::debug!("registry error on {what}: {detail}");
    match code as u32 {
        E_ACCESS_DENIED => LocateError::AccessDenied(what.to_string()),
        E_FILE_NOT_FOUND => LocateError::NotFound("WeChat not found in registry.".to_string()),
        _ => LocateError::NotFound(format!("{what}: {detail}")),
    }
}

#[cfg(not(windows))]
impl InstallLocator for RegistryLocator {
    fn locate(&self) -> Result<Installation, LocateError> {
        Err(LocateError::NotFound(format!(
            "registry key {} is only readable on Windows; pass --dll <PATH>",
            self.key
        )))
    }
}

/// A target named on the command line, bypassing the registry.
pub struct ManualLocator {
    pub path: PathBuf,
    pub version: Option<String>,
}

impl InstallLocator for ManualLocator {
    fn locate(&self) -> Result<Installation, LocateError> {
        if !self.path.exists() {
            return Err(LocateError::NotFound(format!(
                "Cannot find {}",
                self.path.display()
            )));
        }
        Ok(Installation {
            location: self.path.clone(),
            version: self.version.clone(),
        })
    }
}

/// Resolve the file to patch inside an installation.
///
/// The DLL normally sits next to the executable, but newer installers keep it
/// in a `[<version>]` sub-directory, so fall back to a shallow search.
pub fn find_target(install: &Installation, file_name: &str) -> Result<PathBuf, LocateError> {
    if install.location.is_file() {
        return Ok(install.location.clone());
    }

    let direct = install.location.join(file_name);
    if direct.is_file() {
        return Ok(direct);
    }

    search(&install.location, file_name, install.version.as_deref()).ok_or_else(|| {
        LocateError::NotFound(format!("Cannot find {} under {}", file_name, install.location.display()))
    })
}

fn search(root: &Path, file_name: &str, version: Option<&str>) -> Option<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().eq_ignore_ascii_case(file_name))
        .map(|e| e.into_path())
        .collect();

    // Prefer the copy under the directory named after the installed version.
    if let Some(version) = version {
        let tagged = format!("[{version}]");
        if let Some(pos) = found.iter().position(|p| {
            p.parent()
                .and_then(Path::file_name)
                .is_some_and(|d| d == tagged.as_str())
        }) {
            return Some(found.swap_remove(pos));
        }
    }

    if found.len() > 1 {
        log::warn!(
            "Found {} copies of {}, using {}",
            found.len(),
            file_name,
            found[0].display()
        );
    }
    found.into_iter().next()
}
