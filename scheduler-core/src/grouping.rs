use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Per-method dedup-grouping configuration (spec §3 "Grouping Strategy").
///
/// `time_format` is a chrono `strftime` pattern, not spec.md's literal
/// example (`"2006-01-02 15"`, which is Go's reference-time layout — see
/// SPEC_FULL.md's "TimeFormat layout" open question). Use `"%Y-%m-%d %H"`
/// for the equivalent hourly bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingStrategy {
    pub method: String,
    pub time_format: String,
    pub params: Vec<String>,
}

/// A method -> strategy lookup, built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct GroupingTable {
    strategies: HashMap<String, GroupingStrategy>,
}

impl GroupingTable {
    pub fn new(strategies: Vec<GroupingStrategy>) -> Self {
        Self {
            strategies: strategies.into_iter().map(|s| (s.method.clone(), s)).collect(),
        }
    }

    pub fn get(&self, method: &str) -> Option<&GroupingStrategy> {
        self.strategies.get(method)
    }
}

/// Builds the grouping key for a task under a strategy (spec §4.4 step 2).
///
/// The components — method, each configured param value in order, then the
/// quantized time — are joined with a literal `_`. No escaping is performed:
/// this is a documented limitation (spec §9 open question 1), preserved as
/// specified. Two distinct param tuples can collide (e.g. `{"_", "x"}` vs.
/// `{"", "_x"}`); tightening this would require an escaping scheme the spec
/// explicitly says not to add unless downstream tests require it.
pub fn build_key(task: &Task, strategy: &GroupingStrategy) -> Vec<u8> {
    let mut parts = Vec::with_capacity(strategy.params.len() + 2);
    parts.push(task.method.as_str());
    let param_values: Vec<&str> = strategy
        .params
        .iter()
        .map(|name| task.params.get(name).map(String::as_str).unwrap_or(""))
        .collect();
    parts.extend(param_values);
    let formatted_time = task.at.format(&strategy.time_format).to_string();
    let joined = parts.join("_") + "_" + &formatted_time;
    joined.into_bytes()
}
