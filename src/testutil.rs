#![forbid(unsafe_code)]

//! Helpers shared by the unit tests that drive external programs.

use std::fs;
use std::path::{Path, PathBuf};

/// Writes an executable bash script named `name` into `dir`.
pub fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let script_path = dir.join(name);
    let script = format!("#!/usr/bin/env bash\nset -u\n{body}\n");
    fs::write(&script_path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}
