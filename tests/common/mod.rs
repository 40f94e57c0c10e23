//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tfworkspace::deleter::{Deleter, RetryPolicy, RobustDeleter};
use tfworkspace::orchestrator::{Orchestrator, OutputStream, Toolchain};
use tfworkspace::state::{Clock, WorkspaceStore};
use tfworkspace::variables::HclParser;
use tfworkspace::Workspaces;

/// Stand-in for the terraform binary. Behaviour is steered by marker files
/// in the working directory.
const FAKE_TERRAFORM: &str = r#"
case "$1" in
  init)
    echo "Initializing the backend..."
    if [ -f fail-init ]; then
      echo "Error: init broke" >&2
      exit 1
    fi
    mkdir -p .terraform
    echo "Terraform has been successfully initialized!"
    ;;
  plan)
    if [ -f kill-plan ]; then
      kill -TERM $$
    fi
    echo "plan args: $*"
    echo "TERM=$TERM"
    echo "warning on stderr" >&2
    echo "Plan: 1 to add"
    touch plan-ran
    exit 2
    ;;
  apply)
    touch apply-running
    echo "apply started"
    sleep 1
    rm -f apply-running
    echo "apply complete"
    ;;
  destroy)
    if [ -f apply-running ]; then
      echo "overlap"
    fi
    echo "destroy started"
    if [ -f slow-destroy ]; then
      sleep 1
      touch destroy-finished
    fi
    ;;
esac
"#;

/// Write the fake binary into `dir` and return a toolchain that runs it via `sh`.
pub fn fake_toolchain(dir: &Path) -> Toolchain {
    let script = dir.join("fake-terraform.sh");
    std::fs::write(&script, FAKE_TERRAFORM).unwrap();
    Toolchain::new("sh").with_leading_args(vec![script.display().to_string()])
}

/// Clock tests can move forward by hand.
pub struct TestClock(Mutex<Instant>);

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.0.lock().unwrap()
    }
}

/// Deleter that never deletes anything, counting how often it was asked.
#[derive(Default)]
pub struct StubbornDeleter {
    pub calls: Mutex<Vec<std::path::PathBuf>>,
}

impl Deleter for StubbornDeleter {
    fn delete(&self, path: &Path) {
        self.calls.lock().unwrap().push(path.to_path_buf());
    }
}

pub struct Fixture {
    pub tmp: tempfile::TempDir,
    pub clock: Arc<TestClock>,
    pub workspaces: Arc<Workspaces>,
}

impl Fixture {
    pub fn uploads_root(&self) -> std::path::PathBuf {
        self.tmp.path().join("sessions")
    }
}

pub fn fixture() -> Fixture {
    fixture_with_deleter(Arc::new(RobustDeleter::new(RetryPolicy::immediate(3))))
}

pub fn fixture_with_deleter(deleter: Arc<dyn Deleter>) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let toolchain = fake_toolchain(tmp.path());
    fixture_with(tmp, toolchain, deleter)
}

pub fn fixture_with(
    tmp: tempfile::TempDir,
    toolchain: Toolchain,
    deleter: Arc<dyn Deleter>,
) -> Fixture {
    let clock = TestClock::new();
    let root = tmp.path().join("sessions");
    std::fs::create_dir_all(&root).unwrap();

    let workspaces = Workspaces::new(
        WorkspaceStore::new(&root, clock.clone()).unwrap(),
        deleter,
        Orchestrator::new(toolchain),
        Arc::new(HclParser),
    );

    Fixture {
        tmp,
        clock,
        workspaces: Arc::new(workspaces),
    }
}

pub async fn collect(output: OutputStream) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(20), output.collect::<Vec<_>>())
        .await
        .expect("command output did not finish")
}

pub const DECLARATIONS: &str = r#"
variable "x" {
  type        = string
  description = "An input"
  default     = "1"
}

variable "region" {
  type = string
}
"#;
