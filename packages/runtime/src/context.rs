use std::fs;
use std::path::Path;

/// Name under which an out-of-tree Dockerfile is injected into the context
/// archive, so generated recipes build without mutating the snapshot.
pub const INJECTED_DOCKERFILE: &str = "Dockerfile.drydock";

/// Tar the build context and resolve the Dockerfile's in-archive path.
///
/// A Dockerfile living under the context keeps its relative path; one outside
/// the context (a synthesized recipe) is appended to the archive under
/// [`INJECTED_DOCKERFILE`].
pub fn build_context_tar(
    context_dir: &Path,
    dockerfile: &Path,
) -> std::io::Result<(Vec<u8>, String)> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", context_dir)?;

    let dockerfile_name = match dockerfile.strip_prefix(context_dir) {
        Ok(relative) => relative.to_string_lossy().to_string(),
        Err(_) => {
            let data = fs::read(dockerfile)?;
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            archive.append_data(&mut header, INJECTED_DOCKERFILE, data.as_slice())?;
            INJECTED_DOCKERFILE.to_string()
        }
    };

    let tar_data = archive.into_inner().map_err(std::io::Error::other)?;
    Ok((tar_data, dockerfile_name))
}
