//! Shared setup for the harness integration tests: a scripted stand-in for
//! the `skill-hub` binary and a throwaway sandbox base directory.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use skh_common::HarnessConfig;
use skh_common::testing::init_global_test_logging;
use tempfile::TempDir;

#[ctor::ctor]
fn setup() {
    init_global_test_logging();
}

#[allow(dead_code)]
pub const NO_ARGS: [&str; 0] = [];

/// Version line printed by the fake binary.
#[allow(dead_code)]
pub const FAKE_VERSION: &str = "skill-hub version 0.0.0-fake";

/// Behaves like the parts of `skill-hub` the tests exercise.
const FAKE_SKILL_HUB: &str = r##"#!/bin/sh
HUB="$HOME/.skill-hub"
case "$1" in
  --version)
    echo "skill-hub version 0.0.0-fake"
    ;;
  init)
    mkdir -p "$HUB/repo/skills" && echo "repo: local" > "$HUB/config.yaml"
    echo "initialized $HUB"
    ;;
  status)
    if [ ! -d "$HUB" ]; then
      echo "skill-hub is not initialized, run 'skill-hub init'"
      exit 0
    fi
    ls .agents/skills 2>/dev/null
    ;;
  use)
    mkdir -p ".agents/skills/$2"
    printf '%s\n' '---' "name: $2" 'description: enabled by use' '---' "# $2" \
      > ".agents/skills/$2/SKILL.md"
    echo "using $2"
    ;;
  apply)
    echo "applied"
    ;;
  remove)
    rm -rf ".agents/skills/$2"
    echo "removed $2"
    ;;
  echo-env)
    printf '%s=%s\n' "$2" "$(printenv "$2")"
    ;;
  cat)
    cat
    ;;
  sleep)
    exec sleep "$2"
    ;;
  background)
    sleep "$2" &
    echo "started"
    exit 0
    ;;
  flaky)
    n=$(cat "$2" 2>/dev/null || echo 0)
    n=$((n + 1))
    echo "$n" > "$2"
    if [ "$n" -ge "$3" ]; then
      echo "succeeded on attempt $n"
      exit 0
    fi
    echo "attempt $n failed" >&2
    exit 1
    ;;
  fail)
    echo "boom" >&2
    exit 3
    ;;
  *)
    echo "unknown command: $1" >&2
    exit 2
    ;;
esac
"##;

/// A fake binary plus a private sandbox base, removed on drop.
pub struct TestBed {
    _bin_dir: TempDir,
    base_dir: TempDir,
    pub executable: PathBuf,
    pub config: HarnessConfig,
}

impl TestBed {
    pub fn new() -> Self {
        let bin_dir = TempDir::new().expect("bin dir");
        let executable = bin_dir.path().join("skill-hub");
        fs::write(&executable, FAKE_SKILL_HUB).expect("write fake binary");
        fs::set_permissions(&executable, fs::Permissions::from_mode(0o755))
            .expect("chmod fake binary");

        let base_dir = TempDir::new().expect("sandbox base");
        let config = HarnessConfig {
            temp_dir: base_dir.path().to_path_buf(),
            default_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(10),
            keep_on_failure: false,
            binary_override: Some(executable.clone()),
            local_bin_dirs: Vec::new(),
            ..HarnessConfig::default()
        };

        Self {
            _bin_dir: bin_dir,
            base_dir,
            executable,
            config,
        }
    }

    #[allow(dead_code)]
    pub fn base(&self) -> &Path {
        self.base_dir.path()
    }
}
