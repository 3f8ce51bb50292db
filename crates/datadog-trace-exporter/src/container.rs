// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Detection of the container the tracer runs in, sent to the agent as `Datadog-Container-ID`.

use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, trace};

const CGROUP_PATH: &str = "/proc/self/cgroup";

/// Shortest id accepted. Docker ids are 64 hex characters, short ids 12.
const MIN_ID_LEN: usize = 12;

static CONTAINER_ID: OnceLock<Option<String>> = OnceLock::new();

/// Container id of the current process, read once from `/proc/self/cgroup`.
pub fn container_id() -> Option<&'static str> {
    CONTAINER_ID
        .get_or_init(|| read_container_id(Path::new(CGROUP_PATH)))
        .as_deref()
}

pub fn read_container_id(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let id = parse_container_id(&content);
            debug!("Detected container id: {id:?}");
            id
        }
        Err(e) => {
            trace!("Could not read cgroup file {}: {e}", path.display());
            None
        }
    }
}

/// Finds a container id in cgroup file content.
///
/// Recognized layouts:
/// - `12:pids:/docker/<id>`
/// - `0::/system.slice/docker-<id>.scope`
/// - `0::/kubepods/<qos>/pod<uid>/<id>`
/// - `1:name=systemd:/ecs/<task>/<id>`
pub fn parse_container_id(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        docker_id(line)
            .or_else(|| kubernetes_id(line))
            .or_else(|| ecs_id(line))
            .map(str::to_string)
    })
}

fn is_container_id(id: &str) -> bool {
    id.len() >= MIN_ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn docker_id(line: &str) -> Option<&str> {
    if let Some((_, rest)) = line.split_once("/docker/") {
        let id = rest.split('/').next()?;
        if is_container_id(id) {
            return Some(id);
        }
    }

    if let Some((_, rest)) = line.split_once("docker-") {
        let (id, _) = rest.split_once(".scope")?;
        if is_container_id(id) {
            return Some(id);
        }
    }

    None
}

fn kubernetes_id(line: &str) -> Option<&str> {
    if !line.contains("/kubepods") {
        return None;
    }
    let last = line.rsplit('/').next()?;
    // systemd driver: cri-containerd-<id>.scope
    let id = last
        .strip_suffix(".scope")
        .and_then(|scope| scope.rsplit('-').next())
        .unwrap_or(last);
    is_container_id(id).then_some(id)
}

fn ecs_id(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once("/ecs/")?;
    let id = rest.split('/').nth(1)?;
    is_container_id(id).then_some(id)
}
