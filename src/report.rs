use std::fmt;

use crate::apply::{PatchOutcome, PatchReport, RunStatus, SiteInspection, SiteState, SiteStatus};
use crate::catalog::PatchSite;
use crate::util::hex;

fn expected(site: &PatchSite) -> String {
    site.transforms()
        .iter()
        .map(|t| hex(&t.before))
        .collect::<Vec<_>>()
        .join(" | ")
}

impl fmt::Display for PatchOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, offset) = (self.site.label(), self.site.offset());
        match &self.status {
            SiteStatus::Applied { transform } => write!(
                f,
                "patch {} @0x{:08X}: {} -> {}",
                label,
                offset,
                hex(&self.observed),
                hex(&self.site.transforms()[*transform].after)
            ),
            SiteStatus::SkippedMismatch => match self.patched_by() {
                Some(t) => write!(
                    f,
                    "skip  {} @0x{:08X}: found {} (already patched)",
                    label,
                    offset,
                    hex(&self.observed[..self.site.transforms()[t].len()])
                ),
                None => write!(
                    f,
                    "skip  {} @0x{:08X}: found {}, expected {}",
                    label,
                    offset,
                    hex(&self.observed),
                    expected(self.site)
                ),
            },
            SiteStatus::IoError(e) => write!(f, "error {} @0x{:08X}: {}", label, offset, e),
        }
    }
}

impl fmt::Display for SiteInspection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, offset) = (self.site.label(), self.site.offset());
        let found = hex(&self.observed);
        match self.state {
            SiteState::Patchable { transform } => write!(
                f,
                "{} @0x{:08X}: found {}, would write {}",
                label,
                offset,
                found,
                hex(&self.site.transforms()[transform].after)
            ),
            SiteState::AlreadyPatched { .. } => {
                write!(f, "{} @0x{:08X}: found {}, already patched", label, offset, found)
            }
            SiteState::Unrecognised => write!(
                f,
                "{} @0x{:08X}: found {}, expected {} (unrecognised)",
                label,
                offset,
                found,
                expected(self.site)
            ),
        }
    }
}

impl fmt::Display for PatchReport<'_> {
    /// Per-site lines followed by the totals.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            writeln!(f, "  {}", outcome)?;
        }
        if let Some(e) = &self.sync_error {
            writeln!(f, "  error flushing changes to disk: {}", e)?;
        }
        writeln!(f)?;
        match self.status() {
            RunStatus::FullyApplied => writeln!(f, "Patch applied successfully!")?,
            RunStatus::Partial => writeln!(f, "Patch did not apply cleanly.")?,
        }
        writeln!(f, "  Sites applied: {}", self.applied())?;
        writeln!(f, "  Sites skipped: {}", self.skipped())?;
        write!(f, "  Sites failed: {}", self.errors())
    }
}
