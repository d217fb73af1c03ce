//! Dependency ordering of module definitions.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{DeployError, DeployResult},
    module::ModuleDefinition,
};

/// Order `definitions` so that every module comes after all of its dependencies.
///
/// Modules with no ordering constraint between them are emitted by name, so the order is
/// identical across runs for the same input.
pub fn deployment_order(definitions: &[ModuleDefinition]) -> DeployResult<Vec<String>> {
    let mut dependencies: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for definition in definitions {
        if dependencies
            .insert(&definition.name, definition.dependencies())
            .is_some()
        {
            return Err(DeployError::DuplicateModule(definition.name.clone()));
        }
    }

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (&name, deps) in &dependencies {
        in_degree.entry(name).or_insert(0);
        for dependency in deps {
            let Some((&dependency, _)) = dependencies.get_key_value(dependency.as_str()) else {
                return Err(DeployError::UnknownDependency {
                    module: name.to_string(),
                    dependency: dependency.clone(),
                });
            };
            *in_degree.entry(name).or_insert(0) += 1;
            dependents.entry(dependency).or_default().push(name);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < dependencies.len() {
        let remaining: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(&name, _)| name)
            .collect();
        return Err(DeployError::CyclicDependency {
            cycle: find_cycle(&dependencies, &remaining),
        });
    }

    Ok(order)
}

/// Walk dependency edges among `remaining` until a module repeats.
///
/// Every module left over by Kahn's algorithm has a dependency that is also left over, so the
/// walk always closes a cycle.
fn find_cycle(
    dependencies: &BTreeMap<&str, Vec<String>>,
    remaining: &BTreeSet<&str>,
) -> Vec<String> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = dependencies[current]
            .iter()
            .map(String::as_str)
            .find(|dependency| remaining.contains(dependency));

        let Some(next) = next else {
            return path.into_iter().map(str::to_string).collect();
        };

        if let Some(position) = path.iter().position(|&seen| seen == next) {
            let mut cycle: Vec<String> = path[position..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }

        path.push(next);
        current = next;
    }
}
