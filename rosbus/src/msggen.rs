//! Glue for the `generate-messages` command. The schema-to-code generator is
//! a separate tool; this module only finds message packages on disk and runs
//! the generator executable over them.

use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Overrides the generator executable name (default `rosbus-msggen`).
pub const GENERATOR_ENV: &str = "ROSBUS_MSGGEN";

/// The search path for message packages, colon-separated directory roots.
pub const PACKAGE_PATH_ENV: &str = "ROS_PACKAGE_PATH";

/// A package is any directory with a `msg/` or `srv/` subdirectory, either a
///  search root itself or a direct child of one.
pub fn discover_packages() -> anyhow::Result<Vec<PathBuf>> {
    let search_path = std::env::var(PACKAGE_PATH_ENV)
        .with_context(|| format!("{} is not set", PACKAGE_PATH_ENV))?;

    let mut packages = Vec::new();
    for root in search_path.split(':').filter(|r| !r.is_empty()) {
        let root = Path::new(root);
        if is_package(root) {
            packages.push(root.to_path_buf());
        }
        let Ok(children) = std::fs::read_dir(root) else {
            debug!("skipping unreadable search root {:?}", root);
            continue;
        };
        for child in children.flatten() {
            let path = child.path();
            if is_package(&path) {
                packages.push(path);
            }
        }
    }
    packages.sort();
    packages.dedup();
    Ok(packages)
}

fn is_package(dir: &Path) -> bool {
    dir.is_dir() && (dir.join("msg").is_dir() || dir.join("srv").is_dir())
}

/// Run the external generator for one package directory.
pub async fn generate_package(package_dir: &Path) -> anyhow::Result<()> {
    let generator = std::env::var(GENERATOR_ENV).unwrap_or_else(|_| "rosbus-msggen".to_string());
    info!("generating messages for {:?}", package_dir);

    let status = Command::new(&generator)
        .arg(package_dir)
        .status()
        .await
        .with_context(|| format!("could not run the generator {:?}", generator))?;

    if !status.success() {
        bail!("generator {:?} failed for {:?} ({})", generator, package_dir, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_package() {
        let dir = std::env::temp_dir().join(format!("rosbus_msggen_test_{}", std::process::id()));
        let pkg = dir.join("some_msgs");
        std::fs::create_dir_all(pkg.join("msg")).unwrap();
        let plain = dir.join("not_a_package");
        std::fs::create_dir_all(&plain).unwrap();

        assert!(is_package(&pkg));
        assert!(!is_package(&plain));
        assert!(!is_package(&dir.join("missing")));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
