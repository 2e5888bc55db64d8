//! Platform utilities: page sizes, random names, and temporary-directory
//! probing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Returns the VM page size of this platform.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if ret > 0 {
                return ret as usize;
            }
            4096
        }
        #[cfg(not(unix))]
        {
            4096
        }
    })
}

/// Returns the allocation granularity mapped-view offsets and lengths must
/// be multiples of.
///
/// On POSIX this is the page size; Windows requires mapping offsets to be
/// multiples of the 64 KiB kernel allocation granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(unix)]
    {
        page_size()
    }
    #[cfg(not(unix))]
    {
        64 * 1024
    }
}

/// Generates a random alphanumeric string of `len` characters.
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Lexical marker present in the probe result when no temporary directory
/// was writable.
pub const NO_TEMP_DIR_MARKER: &str = "no_temporary_directories_accessible";

/// Returns a directory reported by the operating system to be suitable for
/// temporary files.
///
/// Operating systems are known to sometimes lie about the validity of this
/// path, so each candidate is probed by creating a file in it until one
/// succeeds. If none of the candidates is writable, the result is a path
/// containing [`NO_TEMP_DIR_MARKER`], which makes downstream operations
/// fail with a diagnosable message. The probe runs once per process.
pub fn temporary_files_directory() -> &'static Path {
    static PROBED: OnceLock<PathBuf> = OnceLock::new();
    PROBED.get_or_init(probe_temporary_directories)
}

fn probe_temporary_directories() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = std::env::var_os("TMPDIR") {
        candidates.push(PathBuf::from(dir));
    }
    candidates.push(std::env::temp_dir());
    #[cfg(unix)]
    {
        candidates.push(PathBuf::from("/tmp"));
        candidates.push(PathBuf::from("/var/tmp"));
    }

    for candidate in candidates {
        if candidate.as_os_str().is_empty() {
            continue;
        }
        if probe_one(&candidate) {
            tracing::debug!(path = %candidate.display(), "temporary directory probe succeeded");
            return candidate;
        }
    }
    tracing::warn!("no writable temporary directory found");
    PathBuf::from(NO_TEMP_DIR_MARKER)
}

fn probe_one(dir: &Path) -> bool {
    let probe = dir.join(format!(".sluice-probe-{}", random_string(16)));
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
    {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
