use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand, PackageId};

/// A package and the crates it must never reach through its dependency graph.
struct BoundaryRule {
    package: &'static str,
    forbidden: &'static [&'static str],
}

// Query reaches metadata only through its collaborator traits. Policy
// evaluation performs no I/O.
const RULES: &[BoundaryRule] = &[
    BoundaryRule {
        package: "docvault-query",
        forbidden: &["docvault-ledger", "docvault-registry", "sqlx"],
    },
    BoundaryRule {
        package: "docvault-policy",
        forbidden: &[
            "docvault-ledger",
            "docvault-blobstore",
            "reqwest",
            "sqlx",
            "tokio",
        ],
    },
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let graph = DependencyGraph::from_metadata(&metadata)?;

    let mut failed = false;
    for rule in RULES {
        let violations = graph.violations(rule)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                rule.package,
                rule.forbidden.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                rule.package,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

struct DependencyGraph<'a> {
    metadata: &'a Metadata,
    id_to_name: HashMap<PackageId, &'a str>,
    adjacency: HashMap<PackageId, Vec<PackageId>>,
}

impl<'a> DependencyGraph<'a> {
    fn from_metadata(metadata: &'a Metadata) -> Result<Self> {
        let resolve = metadata
            .resolve
            .as_ref()
            .context("`cargo metadata` did not include a resolved dependency graph")?;

        let id_to_name = metadata
            .packages
            .iter()
            .map(|p| (p.id.clone(), p.name.as_str()))
            .collect();

        // Normal edges only.
        let adjacency = resolve
            .nodes
            .iter()
            .map(|node| {
                let deps = node
                    .deps
                    .iter()
                    .filter(|dep| {
                        dep.dep_kinds.is_empty()
                            || dep
                                .dep_kinds
                                .iter()
                                .any(|k| k.kind == cargo_metadata::DependencyKind::Normal)
                    })
                    .map(|dep| dep.pkg.clone())
                    .collect();
                (node.id.clone(), deps)
            })
            .collect();

        Ok(Self {
            metadata,
            id_to_name,
            adjacency,
        })
    }

    fn violations(&self, rule: &BoundaryRule) -> Result<Vec<String>> {
        let root = self
            .metadata
            .packages
            .iter()
            .find(|p| p.name == rule.package)
            .with_context(|| format!("package `{}` not found in workspace", rule.package))?;

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(root.id.clone());
        visited.insert(root.id.clone());

        let mut violations = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(deps) = self.adjacency.get(&current) else {
                continue;
            };

            for dep in deps.iter().cloned() {
                if !visited.insert(dep.clone()) {
                    continue;
                }

                if let Some(name) = self.id_to_name.get(&dep)
                    && rule.forbidden.contains(name)
                {
                    violations.push((*name).to_string());
                }

                queue.push_back(dep);
            }
        }

        violations.sort();
        violations.dedup();
        Ok(violations)
    }
}
