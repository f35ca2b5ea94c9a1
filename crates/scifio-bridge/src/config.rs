//! Worker launch description and bridge tuning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::ErrorMarker;

pub const DEFAULT_JAVA_FLAGS: &str = "-Xmx512m -Djava.awt.headless=true";
pub const ENTRY_POINT: &str = "io.scif.itk.SCIFIOITKBridge";

#[cfg(windows)]
const CLASS_PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const CLASS_PATH_SEPARATOR: &str = ":";

/// Program, arguments and extra environment for the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Java worker resolved from the process environment.
    pub fn from_env() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self::from_lookup(|key| std::env::var(key).ok(), exe_dir.as_deref())
    }

    /// Java worker resolved through `lookup` instead of the real environment.
    ///
    /// - interpreter: `$JAVA_HOME/bin/java`, else `java` from `PATH`
    /// - class path: `$SCIFIO_PATH/*`, else the first existing jar directory
    ///   next to the executable or under the install prefix
    /// - flags: `$JAVA_FLAGS`, whitespace separated
    pub fn from_lookup<F>(lookup: F, exe_dir: Option<&Path>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let program = match lookup("JAVA_HOME").filter(|home| !home.is_empty()) {
            Some(home) => Path::new(&home).join("bin").join("java"),
            None => PathBuf::from("java"),
        };

        let jar_dirs: Vec<PathBuf> = match lookup("SCIFIO_PATH").filter(|p| !p.is_empty()) {
            Some(path) => path
                .split(CLASS_PATH_SEPARATOR)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            None => default_jar_dir(exe_dir).into_iter().collect(),
        };
        if jar_dirs.is_empty() {
            tracing::warn!("No SCIFIO jar directory found; set SCIFIO_PATH");
        }
        let class_path = jar_dirs
            .iter()
            .map(|dir| dir.join("*").to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(CLASS_PATH_SEPARATOR);

        let flags = lookup("JAVA_FLAGS").unwrap_or_else(|| DEFAULT_JAVA_FLAGS.to_string());

        Self::new(program)
            .with_args(flags.split_whitespace())
            .with_arg("-cp")
            .with_arg(class_path)
            .with_arg(ENTRY_POINT)
    }

    pub(crate) fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command
    }
}

fn default_jar_dir(exe_dir: Option<&Path>) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = exe_dir {
        candidates.push(dir.join("lib").join("jars"));
        candidates.push(dir.join("..").join("lib").join("jars"));
    }
    if let Some(prefix) = option_env!("SCIFIO_INSTALL_PREFIX") {
        candidates.push(Path::new(prefix).join("lib").join("jars"));
    }
    candidates.into_iter().find(|dir| dir.is_dir())
}

/// Everything a bridge needs to start and talk to its worker.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub launch: LaunchSpec,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub stop_grace: Duration,
    pub error_marker: ErrorMarker,
}

impl BridgeConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            handshake_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(300),
            stop_grace: Duration::from_secs(5),
            error_marker: ErrorMarker::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(LaunchSpec::from_env())
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Upper bound on each individual read from the worker.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_error_marker(mut self, marker: ErrorMarker) -> Self {
        self.error_marker = marker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn java_home_and_scifio_path_are_honoured() {
        let spec = LaunchSpec::from_lookup(
            lookup(&[("JAVA_HOME", "/opt/jdk"), ("SCIFIO_PATH", "/opt/scifio/jars")]),
            None,
        );
        assert_eq!(spec.program, Path::new("/opt/jdk").join("bin").join("java"));
        let class_path = Path::new("/opt/scifio/jars").join("*");
        assert_eq!(
            spec.args,
            vec![
                "-Xmx512m".to_string(),
                "-Djava.awt.headless=true".to_string(),
                "-cp".to_string(),
                class_path.to_string_lossy().into_owned(),
                ENTRY_POINT.to_string(),
            ]
        );
    }

    #[test]
    fn java_flags_replace_defaults() {
        let spec = LaunchSpec::from_lookup(
            lookup(&[("JAVA_FLAGS", "  -Xmx2g   -Dfoo=bar "), ("SCIFIO_PATH", "/j")]),
            None,
        );
        assert_eq!(spec.program, PathBuf::from("java"));
        assert_eq!(&spec.args[..2], &["-Xmx2g", "-Dfoo=bar"]);
        assert_eq!(spec.args.last().map(String::as_str), Some(ENTRY_POINT));
    }

    #[test]
    fn jar_dir_next_to_executable_is_found() {
        let root = tempfile::tempdir().unwrap();
        let jars = root.path().join("lib").join("jars");
        std::fs::create_dir_all(&jars).unwrap();
        let bin = root.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();

        let spec = LaunchSpec::from_lookup(lookup(&[]), Some(bin.as_path()));
        let cp_index = spec.args.iter().position(|a| a == "-cp").unwrap();
        assert_eq!(
            PathBuf::from(&spec.args[cp_index + 1]),
            bin.join("..").join("lib").join("jars").join("*")
        );
    }

    #[test]
    fn config_defaults_and_builders() {
        let config = BridgeConfig::new(LaunchSpec::new("worker"));
        assert_eq!(config.handshake_timeout, Duration::from_secs(60));
        assert_eq!(config.read_timeout, Duration::from_secs(300));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.error_marker.as_str(), "ERROR:");

        let config = config
            .with_read_timeout(Duration::from_millis(250))
            .with_error_marker(ErrorMarker::new("FAIL"));
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.error_marker.as_str(), "FAIL");
    }

    #[test]
    fn launch_spec_builders() {
        let spec = LaunchSpec::new("/bin/worker")
            .with_arg("--quiet")
            .with_env("SCIFIO_FAKE_MODE", "silent");
        assert_eq!(spec.args, vec!["--quiet"]);
        assert_eq!(spec.env, vec![("SCIFIO_FAKE_MODE".to_string(), "silent".to_string())]);
    }
}
