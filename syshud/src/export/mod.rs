//! Profile export functionality
//!
//! Writes a JSON summary of a [`Profile`]: the total sample weight and the
//! flat object list, heaviest first. Meant for scripts and CI checks; the
//! full tree goes through [`crate::profile::file_format`] instead.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::ExportError;
use crate::profile::{Profile, ProfileObject};

/// JSON summary container
#[derive(Debug, Serialize)]
pub struct ProfileSummary {
    /// Total sample weight
    pub size: u64,
    /// Self and total weight per symbol, heaviest total first
    pub objects: Vec<ProfileObject>,
}

impl ProfileSummary {
    /// Summarise `profile`, keeping at most `limit` objects (all if `None`)
    #[must_use]
    pub fn new(profile: &Profile, limit: Option<usize>) -> Self {
        let mut objects = profile.objects();
        if let Some(limit) = limit {
            objects.truncate(limit);
        }
        Self { size: profile.size(), objects }
    }
}

/// Serialize the summary of `profile` to `writer`
///
/// # Errors
/// Returns an error if serialization or writing fails.
pub fn write_json_summary<W: Write>(
    profile: &Profile,
    limit: Option<usize>,
    writer: W,
) -> Result<(), ExportError> {
    let summary = ProfileSummary::new(profile, limit);
    serde_json::to_writer_pretty(writer, &summary)?;
    Ok(())
}

/// Write the summary of `profile` to the file at `path`
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn export_json_summary(
    profile: &Profile,
    limit: Option<usize>,
    path: &Path,
) -> Result<(), ExportError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_json_summary(profile, limit, &mut writer)?;
    writer.flush()?;
    Ok(())
}
