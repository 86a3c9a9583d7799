use std::path::Path;

use anyhow::Context;
use tracing::warn;

use gatehouse_core::flow::FlowDefinition;
use gatehouse_engine::FlowEngine;

fn read_definition(path: &Path) -> anyhow::Result<FlowDefinition> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(FlowDefinition::from_json(&json)?)
}

/// Parse and compile one definition file, returning its id.
pub fn validate_file(engine: &FlowEngine, path: &Path) -> anyhow::Result<String> {
    let def = read_definition(path)?;
    engine.validate(&def)?;
    Ok(def.id)
}

/// Register every `*.json` definition in `dir`. Invalid files are skipped.
pub async fn register_dir(engine: &FlowEngine, dir: &Path) -> anyhow::Result<usize> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading flows dir {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    paths.sort();

    let mut registered = 0;
    for path in paths {
        let def = match read_definition(&path) {
            Ok(def) => def,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable flow definition");
                continue;
            }
        };
        match engine.register_definition(def).await {
            Ok(()) => registered += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid flow definition"),
        }
    }
    Ok(registered)
}
