use std::time::Duration;

pub const DEFAULT_HTTP_PORT: u16 = 3001;
pub const DEFAULT_FIRST_PREVIEW_PORT: u16 = 3100;
pub const DEFAULT_WORKSPACES_DIR: &str = "/workspaces";

pub const READINESS_PROBE_INTERVAL: Duration = Duration::from_millis(250);
pub const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub const IDLE_CHECK_INTERVAL_DEBUG: Duration = Duration::from_secs(1);
pub const IDLE_CHECK_INTERVAL_RELEASE: Duration = Duration::from_secs(30);

pub const MAX_API_BODY_BYTES: usize = 10 * 1024 * 1024;

pub const DEFAULT_COMMIT_MESSAGE: &str = "Apply preview changes";
pub const DEFAULT_PR_BODY: &str = "Changes promoted from a live preview.";
pub const PR_BRANCH_PREFIX: &str = "preview-changes-";
