use std::fs::OpenOptions;
use std::io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::catalog::{Catalog, PatchSite};
use crate::error::PatchError;
use crate::util;
use crate::verify::{self, MatchResult};

#[derive(Debug)]
pub enum SiteStatus {
    /// The transform at this index was matched and its replacement written.
    Applied { transform: usize },
    /// None of the `before` patterns are on disk. Expected on a second run.
    SkippedMismatch,
    IoError(io::Error),
}

#[derive(Debug)]
pub struct PatchOutcome<'a> {
    pub site: &'a PatchSite,
    pub status: SiteStatus,
    pub observed: Vec<u8>,
}

impl PatchOutcome<'_> {
    pub fn is_applied(&self) -> bool {
        matches!(self.status, SiteStatus::Applied { .. })
    }

    /// Transform whose replacement was found on a skipped site, i.e. a site
    /// patched by an earlier run.
    pub fn patched_by(&self) -> Option<usize> {
        match self.status {
            SiteStatus::SkippedMismatch => self.site.patched_by(&self.observed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    FullyApplied,
    Partial,
}

#[derive(Debug)]
pub struct PatchReport<'a> {
    pub outcomes: Vec<PatchOutcome<'a>>,
    /// Set when the final flush to disk failed after the per-site writes.
    pub sync_error: Option<io::Error>,
}

impl PatchReport<'_> {
    pub fn status(&self) -> RunStatus {
        if self.sync_error.is_none() && self.outcomes.iter().all(PatchOutcome::is_applied) {
            RunStatus::FullyApplied
        } else {
            RunStatus::Partial
        }
    }

    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, SiteStatus::SkippedMismatch))
            .count()
    }

    pub fn errors(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, SiteStatus::IoError(_)))
            .count()
    }
}

/// Open `target` once and run every site of `catalog` against it.
///
/// Only a missing file or a permission failure aborts. Any other open failure
/// (a sharing violation from a running instance, for one) is reported as an
/// I/O error on every site so the caller still gets a full breakdown.
pub fn apply_all<'a>(target: &Path, catalog: &'a Catalog) -> Result<PatchReport<'a>, PatchError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(target) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(PatchError::NotFound(target.to_path_buf()))
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(PatchError::AccessDenied(target.to_path_buf()))
        }
        Err(e) => {
            log::warn!("Could not open {} for writing: {}", target.display(), e);
            let outcomes = catalog
                .sites()
                .iter()
                .map(|site| PatchOutcome {
                    site,
                    status: SiteStatus::IoError(io::Error::new(e.kind(), e.to_string())),
                    observed: Vec::new(),
                })
                .collect();
            return Ok(PatchReport {
                outcomes,
                sync_error: None,
            });
        }
    };

    log::debug!("Opened {} for patching", target.display());
    let outcomes = apply_sites(&mut file, catalog.sites());

    let sync_error = file.sync_all().err();
    if let Some(e) = &sync_error {
        log::error!("Failed to flush {}: {}", target.display(), e);
    }

    Ok(PatchReport {
        outcomes,
        sync_error,
    })
}

/// Verify and patch each site in order on an already-open handle.
pub fn apply_sites<'a, F: Read + Write + Seek>(
    handle: &mut F,
    sites: &'a [PatchSite],
) -> Vec<PatchOutcome<'a>> {
    sites
        .iter()
        .map(|site| {
            let (status, observed) = match apply_site(handle, site) {
                Ok(pair) => pair,
                Err(e) => (SiteStatus::IoError(e), Vec::new()),
            };
            log::trace!("{} @0x{:08X}: {:?}", site.label(), site.offset(), status);
            PatchOutcome {
                site,
                status,
                observed,
            }
        })
        .collect()
}

fn apply_site<F: Read + Write + Seek>(
    handle: &mut F,
    site: &PatchSite,
) -> io::Result<(SiteStatus, Vec<u8>)> {
    match verify::verify(handle, site.offset(), site.transforms())? {
        MatchResult::Matched { index, mut observed } => {
            let after = &site.transforms()[index].after;
            handle.seek(SeekFrom::Start(site.offset()))?;
            handle.write_all(after)?;
            observed.truncate(after.len());
            Ok((SiteStatus::Applied { transform: index }, observed))
        }
        MatchResult::NoMatch { observed } => Ok((SiteStatus::SkippedMismatch, observed)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    Patchable { transform: usize },
    AlreadyPatched { transform: usize },
    Unrecognised,
}

#[derive(Debug)]
pub struct SiteInspection<'a> {
    pub site: &'a PatchSite,
    pub state: SiteState,
    pub observed: Vec<u8>,
}

/// Read-only pass over `target`: what would `apply_all` do at each site?
pub fn inspect<'a>(target: &Path, catalog: &'a Catalog) -> anyhow::Result<Vec<SiteInspection<'a>>> {
    let map = util::mmap_file(target)?;
    let mut reader = Cursor::new(&map[..]);

    catalog
        .sites()
        .iter()
        .map(|site| -> anyhow::Result<SiteInspection<'a>> {
            let (state, mut observed) =
                match verify::verify(&mut reader, site.offset(), site.transforms())? {
                    MatchResult::Matched { index, observed } => {
                        (SiteState::Patchable { transform: index }, observed)
                    }
                    MatchResult::NoMatch { observed } => match site.patched_by(&observed) {
                        Some(transform) => (SiteState::AlreadyPatched { transform }, observed),
                        None => (SiteState::Unrecognised, observed),
                    },
                };
            match state {
                SiteState::Patchable { transform } | SiteState::AlreadyPatched { transform } => {
                    observed.truncate(site.transforms()[transform].len())
                }
                SiteState::Unrecognised => {}
            }
            Ok(SiteInspection {
                site,
                state,
                observed,
            })
        })
        .collect()
}
