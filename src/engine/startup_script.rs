//! C8: the in-container shell script that hash-checks dependencies and
//! starts the dev server (§4.5).

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Yarn,
    Npm,
}

impl PackageManager {
    fn install_command(&self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm install --no-frozen-lockfile",
            PackageManager::Yarn => "yarn install",
            PackageManager::Npm => "npm install --legacy-peer-deps",
        }
    }

    fn dev_command(&self, port: u16) -> String {
        match self {
            PackageManager::Pnpm => format!("pnpm run dev --host 0.0.0.0 --port {}", port),
            PackageManager::Npm => format!("npm run dev -- --host 0.0.0.0 --port {}", port),
            PackageManager::Yarn => format!("yarn dev --host 0.0.0.0 --port {}", port),
        }
    }
}

/// Argv for installing `packages` with `pm`, or for a bare install when
/// `packages` is empty (§4.6.1/§4.6.2: `pnpm add <packages>` or the detected
/// manager's equivalent; a manual `package.json` edit falls back to a plain
/// install instead of an `add`).
pub fn install_argv(pm: PackageManager, packages: &[String]) -> Vec<String> {
    if packages.is_empty() {
        return pm.install_command().split_whitespace().map(String::from).collect();
    }
    let mut argv = match pm {
        PackageManager::Pnpm => vec!["pnpm".to_string(), "add".to_string()],
        PackageManager::Npm => vec!["npm".to_string(), "install".to_string(), "--legacy-peer-deps".to_string()],
        PackageManager::Yarn => vec!["yarn".to_string(), "add".to_string()],
    };
    argv.extend(packages.iter().cloned());
    argv
}

/// `pnpm` if `pnpm-lock.yaml` exists, `yarn` if `yarn.lock` exists, `npm` otherwise.
pub fn detect_package_manager(workspace_path: &str) -> PackageManager {
    let root = Path::new(workspace_path);
    if root.join("pnpm-lock.yaml").exists() {
        PackageManager::Pnpm
    } else if root.join("yarn.lock").exists() {
        PackageManager::Yarn
    } else {
        PackageManager::Npm
    }
}

/// Emits the shell script passed to the container as `sh -c <script>`.
///
/// `skip_install` is honored by the caller (C1's `RunContainerOptions`) by
/// omitting install from the decision entirely; the script still performs
/// its own hash check so a restarted container with unchanged deps never
/// reinstalls (P7).
pub fn generate_startup_script(
    workspace_path: &str,
    dev_port: u16,
    package_manager: PackageManager,
    skip_install: bool,
) -> String {
    let install_cmd = package_manager.install_command();
    let dev_cmd = package_manager.dev_command(dev_port);
    let skip_install_guard = if skip_install { "true" } else { "false" };

    format!(
        r#"set -e
echo '{{"event":"startup","workspace":"{workspace_path}","port":{dev_port}}}'
SKIP_INSTALL={skip_install_guard}
HASH_FILE=/app/.dependency-hash
NEW_HASH=$(sha256sum /app/package.json 2>/dev/null | awk '{{print $1}}')
OLD_HASH=$(cat "$HASH_FILE" 2>/dev/null || echo "")
NEEDS_INSTALL=false
if [ "$SKIP_INSTALL" = "false" ]; then
  if [ ! -d /app/node_modules ] || [ -z "$OLD_HASH" ] || [ "$NEW_HASH" != "$OLD_HASH" ]; then
    NEEDS_INSTALL=true
  fi
fi
if [ "$NEEDS_INSTALL" = "true" ]; then
  echo '{{"event":"dependencies:installing"}}'
  {install_cmd}
  echo "$NEW_HASH" > "$HASH_FILE"
  echo '{{"event":"dependencies:installed"}}'
fi
export CHOKIDAR_USEPOLLING=true
exec {dev_cmd}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn detects_pnpm_lockfile() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(detect_package_manager(temp.path().to_str().unwrap()), PackageManager::Pnpm);
    }

    #[test]
    fn detects_yarn_lockfile() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_package_manager(temp.path().to_str().unwrap()), PackageManager::Yarn);
    }

    #[test]
    fn defaults_to_npm() {
        let temp = TempDir::new().unwrap();
        assert_eq!(detect_package_manager(temp.path().to_str().unwrap()), PackageManager::Npm);
    }

    #[test]
    fn script_contains_dev_command_and_hash_check() {
        let script = generate_startup_script("/app", 32100, PackageManager::Pnpm, false);
        assert!(script.contains("pnpm run dev --host 0.0.0.0 --port 32100"));
        assert!(script.contains(".dependency-hash"));
        assert!(script.contains("CHOKIDAR_USEPOLLING=true"));
    }

    #[test]
    fn skip_install_guard_disables_install_branch() {
        let script = generate_startup_script("/app", 32100, PackageManager::Npm, true);
        assert!(script.contains("SKIP_INSTALL=true"));
    }

    #[test]
    fn install_argv_uses_add_subcommand_for_named_packages() {
        let argv = install_argv(PackageManager::Pnpm, &["left-pad".to_string()]);
        assert_eq!(argv, vec!["pnpm", "add", "left-pad"]);
    }

    #[test]
    fn install_argv_falls_back_to_plain_install_with_no_packages() {
        let argv = install_argv(PackageManager::Npm, &[]);
        assert_eq!(argv, vec!["npm", "install", "--legacy-peer-deps"]);
    }
}
