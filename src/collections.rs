//! `vectorify collections`: resolve every configured plan and report whether it is usable.

use crate::config::Config;
use crate::error::ConfigError;
use crate::plan::CollectionPlan;
use crate::resource::ResourceRegistry;

#[derive(Debug)]
pub struct CollectionCheck {
    pub slug: String,
    pub source: Option<String>,
    pub result: Result<CollectionPlan, ConfigError>,
}

pub fn check_collections(config: &Config, resources: &ResourceRegistry) -> Vec<CollectionCheck> {
    config
        .collections
        .keys()
        .map(|slug| {
            let result = CollectionPlan::for_collection(config, slug, resources);
            CollectionCheck {
                slug: slug.clone(),
                source: result.as_ref().ok().map(|p| p.source_name.clone()),
                result,
            }
        })
        .collect()
}

/// Print the health table. Returns the number of collections that failed to resolve.
pub fn list_collections(config: &Config, resources: &ResourceRegistry) -> usize {
    let checks = check_collections(config, resources);
    if checks.is_empty() {
        println!("No collections configured.");
        return 0;
    }

    println!("{:<20} {:<16} {:<8} STATUS", "COLLECTION", "SOURCE", "COLUMNS");
    for check in &checks {
        match &check.result {
            Ok(plan) => {
                let columns = if plan.resource.is_some() {
                    "resource".to_string()
                } else {
                    plan.select.len().to_string()
                };
                println!(
                    "{:<20} {:<16} {:<8} OK",
                    check.slug,
                    check.source.as_deref().unwrap_or("-"),
                    columns
                );
            }
            Err(e) => println!("{:<20} {:<16} {:<8} ERROR: {}", check.slug, "-", "-", e),
        }
    }

    checks.iter().filter(|c| c.result.is_err()).count()
}
