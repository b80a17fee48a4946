//! Renders the registry into the agent's prometheus input config.
//!
//! A render is written only when its bytes differ from what is on disk, and
//! only when the agent can be found to reload it afterwards.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::config::TlsFiles;
use crate::process::{ProcessController, ProcessError};
use crate::registry::{Entry, Registry};

/// Name of the input block in the rendered config.
const INPUT_NAME: &str = "prometheus";
const METRIC_VERSION: u8 = 2;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("serialize config failed, {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("agent process not found, {0}")]
    Process(#[source] ProcessError),
    #[error("write config {path:?} failed, {err}")]
    Write {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

#[derive(Debug, Serialize)]
struct AgentConfig<'a> {
    inputs: BTreeMap<&'static str, PrometheusInput<'a>>,
}

#[derive(Debug, Serialize)]
struct PrometheusInput<'a> {
    urls: Vec<String>,
    tls_ca: &'a Path,
    tls_cert: &'a Path,
    tls_key: &'a Path,
    insecure_skip_verify: bool,
    metric_version: u8,
}

/// What a materialization tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Rendered content matches the file, nothing written.
    Unchanged,
    /// Config written and the agent signalled.
    Reloaded { pid: i32, urls: usize },
    /// Config written but the reload signal could not be delivered.
    WrittenWithoutReload { pid: i32, urls: usize },
}

/// Build the sorted, deduplicated scrape URL list.
///
/// Targets whose host equals `local_address` are skipped, only the host is
/// compared so every port of this instance is excluded.
pub fn build_urls<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
    local_address: Option<&str>,
) -> Vec<String> {
    let mut urls = vec![];

    for entry in entries {
        let param_id = entry.target.param_id();

        for target in &entry.target.targets {
            if let Some(local) = local_address {
                if split_host(target) == Some(local) {
                    continue;
                }
            }

            match param_id {
                Some(id) => urls.push(format!("https://{target}?id={id}")),
                None => urls.push(format!("https://{target}")),
            }
        }
    }

    urls.sort_unstable();
    urls.dedup();
    urls
}

/// Host part of `host:port`, with brackets of an IPv6 literal removed.
/// `None` when there is no port.
fn split_host(target: &str) -> Option<&str> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return (!port.is_empty() && !port.contains(':')).then_some(host);
    }

    let (host, port) = target.rsplit_once(':')?;
    if host.contains(':') || port.is_empty() {
        return None;
    }

    Some(host)
}

/// Serialize the config document for `urls`.
pub fn render(urls: Vec<String>, tls: &TlsFiles) -> Result<String, RenderError> {
    let input = PrometheusInput {
        urls,
        tls_ca: &tls.ca,
        tls_cert: &tls.cert,
        tls_key: &tls.key,
        insecure_skip_verify: true,
        metric_version: METRIC_VERSION,
    };

    let config = AgentConfig {
        inputs: BTreeMap::from([(INPUT_NAME, input)]),
    };

    toml::to_string(&config).map_err(Into::into)
}

/// Replace `path` with `content` so readers see either the old or the new
/// file, never a partial one.
fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = std::fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(content)?;
            file.sync_all()
        })
        .and_then(|_| std::fs::rename(&tmp, path));

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }

    result
}

pub struct Materializer<P> {
    output: PathBuf,
    tls: TlsFiles,
    local_address: Option<String>,
    controller: P,
}

impl<P: ProcessController> Materializer<P> {
    pub fn new(
        output: impl Into<PathBuf>,
        tls: TlsFiles,
        local_address: Option<String>,
        controller: P,
    ) -> Self {
        Self {
            output: output.into(),
            tls,
            local_address,
            controller,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Render the registry and, if the result differs from the file on disk,
    /// write it and reload the agent.
    pub fn tick(&self, registry: &Registry) -> Result<Outcome, MaterializeError> {
        let snapshot = registry.snapshot();
        let urls = build_urls(&snapshot, self.local_address.as_deref());
        let count = urls.len();
        let content = render(urls, &self.tls)?;

        // a missing or unreadable file counts as empty, so it always differs
        let previous = std::fs::read(&self.output).unwrap_or_default();
        if previous == content.as_bytes() {
            return Ok(Outcome::Unchanged);
        }

        // without a process to reload, rewriting the config is pointless
        let pid = self
            .controller
            .current_pid()
            .map_err(MaterializeError::Process)?;

        write_atomically(&self.output, content.as_bytes()).map_err(|err| {
            MaterializeError::Write {
                path: self.output.clone(),
                err,
            }
        })?;

        info!(
            message = "Config written",
            path = ?self.output,
            urls = count,
        );

        match self.controller.reload(pid) {
            Ok(()) => {
                info!(message = "Agent reloaded", pid);

                Ok(Outcome::Reloaded { pid, urls: count })
            }
            Err(err) => {
                warn!(message = "Reload agent failed", pid, %err);

                Ok(Outcome::WrittenWithoutReload { pid, urls: count })
            }
        }
    }
}
