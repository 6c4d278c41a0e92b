/* This file is part of cryptobak.
 *
 * cryptobak is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * cryptobak is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with cryptobak.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Filename sanitization and atomic persistence of verified uploads
//! (spec §7). Rejection is preferred over silent mangling: any input that
//! cannot be reduced to a single safe path component is an error, not a
//! best-effort rewrite.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tempfile::NamedTempFile;

/// Reduces a client-supplied filename to a single path component rooted
/// inside `storage_dir`, rejecting anything carrying a directory separator
/// or parent-directory traversal rather than stripping it.
pub fn sanitize_filename(storage_dir: &Path, raw_name: &str) -> Result<PathBuf> {
    if raw_name.is_empty() {
        return Err(anyhow!("filename is empty"));
    }
    if raw_name.contains('/') || raw_name.contains('\\') || raw_name.contains('\0') {
        return Err(anyhow!("filename '{raw_name}' contains a path separator"));
    }
    if raw_name == "." || raw_name == ".." {
        return Err(anyhow!("filename '{raw_name}' is a directory traversal"));
    }

    let candidate = storage_dir.join(raw_name);
    let canonical_root = storage_dir
        .canonicalize()
        .unwrap_or_else(|_| storage_dir.to_path_buf());
    let candidate_parent = candidate
        .parent()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
        .unwrap_or_else(|| canonical_root.clone());
    if candidate_parent != canonical_root {
        return Err(anyhow!("filename '{raw_name}' escapes the storage root"));
    }

    Ok(candidate)
}

/// Writes `plaintext` to `path` atomically: a temp file in the same
/// directory, synced, then renamed into place (spec §5 "filesystem write
/// (atomic rename at finalization)"; grounded on the same create-then-
/// rename pattern the teacher uses for its local identity keyfile).
pub fn persist_atomically(path: &Path, plaintext: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| anyhow!("storage path has no parent directory"))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(plaintext)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| anyhow!("failed to finalize '{}': {err}", path.display()))?;
    Ok(())
}
