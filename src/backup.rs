use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::DB_FILE;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "studytrack.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "studytrack-workspace-v1";

/// A workspace bundle is a two-entry zip: `manifest.json` describing the
/// bundle, and the sqlite database under its workspace filename.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    app_version: String,
    exported_at: String,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        bail!("no database in workspace {}", workspace_path.display());
    }
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let out_file =
        File::create(out_path).with_context(|| format!("creating {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = Manifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
    };
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("writing manifest entry")?;
    serde_json::to_writer_pretty(&mut zip, &manifest).context("writing manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("writing database entry")?;
    let mut db_file =
        File::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    io::copy(&mut db_file, &mut zip).context("writing database entry")?;

    zip.finish().context("finishing bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    fs::create_dir_all(workspace_path)
        .with_context(|| format!("creating {}", workspace_path.display()))?;
    let dst = workspace_path.join(DB_FILE);

    // Pre-bundle backups were a straight copy of the sqlite file; still
    // accepted on import.
    if !is_zip_file(in_path)? {
        fs::copy(in_path, &dst)
            .with_context(|| format!("copying {} into the workspace", in_path.display()))?;
        return Ok(ImportSummary {
            bundle_format_detected: "legacy-sqlite3".to_string(),
        });
    }

    let in_file = File::open(in_path).with_context(|| format!("opening {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("reading bundle")?;

    let manifest: Manifest = serde_json::from_reader(
        archive
            .by_name(MANIFEST_ENTRY)
            .context("bundle has no manifest.json")?,
    )
    .context("manifest.json is not valid JSON")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        bail!("unrecognized bundle format {:?}", manifest.format);
    }

    // Extract next to the destination, then swap, so a truncated or
    // half-read bundle never clobbers the live database.
    let staging = workspace_path.join(format!("{}.partial", DB_FILE));
    {
        let mut staged = File::create(&staging)
            .with_context(|| format!("creating {}", staging.display()))?;
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .with_context(|| format!("bundle has no {}", DB_ENTRY))?;
        io::copy(&mut db_entry, &mut staged).context("extracting database entry")?;
        staged.flush().context("extracting database entry")?;
    }
    fs::rename(&staging, &dst)
        .with_context(|| format!("installing database at {}", dst.display()))?;

    Ok(ImportSummary {
        bundle_format_detected: manifest.format,
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut sig = [0u8; 2];
    match f.read_exact(&mut sig) {
        Ok(()) => Ok(&sig == b"PK"),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
