use std::collections::BTreeMap;
use std::path::PathBuf;

use sandbox::BootSpec;
use serde::{Deserialize, Serialize};

/// How to launch the sandbox program.
///
/// Arguments may contain placeholders filled from the boot spec:
/// `{id}`, `{image}`, `{cpus}`, `{memory_mb}`, `{storage_mb}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program path or a bare name looked up on `PATH`.
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Grace period between SIGTERM and SIGKILL on stop.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

impl ProcessConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments with placeholders replaced from `spec`.
    pub(crate) fn expand_args(&self, spec: &BootSpec) -> Vec<String> {
        let id = spec.id.to_string();
        let image = spec.image.display().to_string();
        let cpus = spec.resources.cpu_count.to_string();
        let memory = spec.resources.memory_mb.to_string();
        let storage = spec.resources.storage_mb.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{id}", &id)
                    .replace("{image}", &image)
                    .replace("{cpus}", &cpus)
                    .replace("{memory_mb}", &memory)
                    .replace("{storage_mb}", &storage)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use sandbox::ResourceLimits;

    use super::*;

    #[test]
    fn placeholders_are_expanded() {
        let spec = BootSpec {
            id: uuid::Uuid::nil(),
            image: PathBuf::from("/images/dev.img"),
            mounts: Vec::new(),
            resources: ResourceLimits {
                cpu_count: 4,
                memory_mb: 2048,
                storage_mb: 8192,
            },
            persistent: false,
            network: false,
        };
        let config = ProcessConfig::new("vm-launch").args([
            "--disk={image}",
            "--mem",
            "{memory_mb}M",
            "--smp={cpus}",
            "--name=sbx-{id}",
            "--verbose",
        ]);

        assert_eq!(
            config.expand_args(&spec),
            vec![
                "--disk=/images/dev.img",
                "--mem",
                "2048M",
                "--smp=4",
                "--name=sbx-00000000-0000-0000-0000-000000000000",
                "--verbose",
            ]
        );
    }
}
