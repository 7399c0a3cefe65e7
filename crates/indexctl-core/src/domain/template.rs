use crate::domain::flow::{MissingAction, WaitMask};
use crate::CoreError;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

lazy_static! {
    // `${name}` placeholders inside template text
    static ref PLACEHOLDER_REGEX: Regex = Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").unwrap();
}

/// Flows and tasks produced by instantiating one graph template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Flows in declaration order
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
}

/// One flow inside a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Name, unique within the template
    pub name: String,

    /// Lookup tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Initial flow properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Names of sibling flows allowed to run alongside
    #[serde(default)]
    pub friends: Vec<String>,

    /// Tasks bound to the flow
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,

    /// Upstream wait conditions
    #[serde(default)]
    pub upstream: Vec<UpstreamSpec>,
}

/// One task inside a flow template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name, unique within the flow
    pub name: String,

    /// Registered task kind
    pub kind: String,

    /// Parameters handed to workers
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// One upstream reference inside a flow template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSpec {
    /// Sibling flow in the same template, by name
    #[serde(default)]
    pub flow: Option<String>,

    /// Flow already present in the graph, by id
    #[serde(default)]
    pub flow_id: Option<String>,

    /// Upstream statuses that release the dependency
    #[serde(default = "default_wait")]
    pub wait: Vec<String>,

    /// Behaviour when the upstream has disappeared
    #[serde(default)]
    pub missing: MissingAction,
}

fn default_wait() -> Vec<String> {
    vec!["finish".to_string()]
}

impl UpstreamSpec {
    /// Parsed wait mask
    pub fn wait_mask(&self) -> Result<WaitMask, CoreError> {
        WaitMask::from_names(&self.wait)
    }
}

impl GraphSpec {
    /// Validate names, references and acyclicity
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut names = HashSet::new();
        for flow in &self.flows {
            if flow.name.is_empty() {
                return Err(CoreError::TemplateError("flow name must not be empty".to_string()));
            }
            if !names.insert(flow.name.as_str()) {
                return Err(CoreError::TemplateError(format!(
                    "duplicate flow name: {}",
                    flow.name
                )));
            }

            let mut task_names = HashSet::new();
            for task in &flow.tasks {
                if !task_names.insert(task.name.as_str()) {
                    return Err(CoreError::TemplateError(format!(
                        "duplicate task {} in flow {}",
                        task.name, flow.name
                    )));
                }
            }
        }

        for flow in &self.flows {
            for upstream in &flow.upstream {
                upstream.wait_mask()?;
                match (&upstream.flow, &upstream.flow_id) {
                    (Some(name), None) => {
                        if !names.contains(name.as_str()) {
                            return Err(CoreError::TemplateError(format!(
                                "flow {} references unknown upstream: {}",
                                flow.name, name
                            )));
                        }
                    }
                    (None, Some(_)) => {}
                    _ => {
                        return Err(CoreError::TemplateError(format!(
                            "upstream of flow {} must name exactly one of flow or flow_id",
                            flow.name
                        )))
                    }
                }
            }
            for friend in &flow.friends {
                if !names.contains(friend.as_str()) {
                    return Err(CoreError::TemplateError(format!(
                        "flow {} references unknown friend: {}",
                        flow.name, friend
                    )));
                }
            }
        }

        self.check_for_cycles()
    }

    fn check_for_cycles(&self) -> Result<(), CoreError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        let mut dep_map: HashMap<&str, Vec<&str>> = HashMap::new();
        for flow in &self.flows {
            let deps = flow
                .upstream
                .iter()
                .filter_map(|u| u.flow.as_deref())
                .collect();
            dep_map.insert(flow.name.as_str(), deps);
        }

        for flow in &self.flows {
            if Self::is_cyclic(flow.name.as_str(), &dep_map, &mut visited, &mut rec_stack) {
                return Err(CoreError::TemplateError(format!(
                    "cycle detected in upstream dependencies involving flow: {}",
                    flow.name
                )));
            }
        }
        Ok(())
    }

    fn is_cyclic<'a>(
        name: &'a str,
        dep_map: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if !visited.contains(name) {
            visited.insert(name);
            rec_stack.insert(name);

            if let Some(deps) = dep_map.get(name) {
                for &dep in deps {
                    if (!visited.contains(dep) && Self::is_cyclic(dep, dep_map, visited, rec_stack))
                        || rec_stack.contains(dep)
                    {
                        return true;
                    }
                }
            }
        }

        rec_stack.remove(name);
        false
    }
}

/// Resolves template files relative to a root search path
pub trait TemplateLoader: Send + Sync {
    /// Return the template text of `file`
    fn load(&self, root: &str, file: &str) -> Result<String, CoreError>;
}

/// Turns template text plus parameters into a [`GraphSpec`]
pub trait TemplateInterpreter: Send + Sync {
    /// Instantiate the template
    fn instantiate(
        &self,
        script: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<GraphSpec, CoreError>;
}

/// YAML templates with `${param}` substitution
///
/// The template is parsed first and placeholders are replaced inside string
/// scalars only, so a parameter value can never change the document
/// structure. Mapping keys are not substituted.
#[derive(Debug, Default, Clone)]
pub struct YamlTemplateInterpreter;

impl YamlTemplateInterpreter {
    /// Create an interpreter
    pub fn new() -> Self {
        Self
    }

    /// Replace every `${name}` in `text` with its parameter value
    pub fn substitute(
        &self,
        text: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, CoreError> {
        if let Some(missing) = PLACEHOLDER_REGEX
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .find(|name| !params.contains_key(name))
        {
            return Err(CoreError::TemplateError(format!(
                "unbound template parameter: {}",
                missing
            )));
        }

        Ok(PLACEHOLDER_REGEX
            .replace_all(text, |caps: &Captures| {
                params.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }

    fn substitute_value(
        &self,
        value: &mut Value,
        params: &BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        match value {
            Value::String(text) if PLACEHOLDER_REGEX.is_match(text) => {
                *text = self.substitute(text, params)?;
            }
            Value::Sequence(items) => {
                for item in items {
                    self.substitute_value(item, params)?;
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.substitute_value(item, params)?;
                }
            }
            Value::Tagged(tagged) => self.substitute_value(&mut tagged.value, params)?,
            _ => {}
        }
        Ok(())
    }
}

impl TemplateInterpreter for YamlTemplateInterpreter {
    fn instantiate(
        &self,
        script: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<GraphSpec, CoreError> {
        let mut document: Value = serde_yaml::from_str(script)?;
        self.substitute_value(&mut document, params)?;
        let spec: GraphSpec = serde_yaml::from_value(document)?;
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
flows:
  - name: a
    tags: ["stage:init"]
    tasks:
      - name: build
        kind: build
        params:
          cluster: ${cluster}
  - name: b
    upstream:
      - flow: a
  - name: c
    upstream:
      - flow: b
        wait: [finish, stop]
        missing: ignore
"#;

    fn params() -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("cluster".to_string(), "c1".to_string());
        params
    }

    #[test]
    fn test_instantiate_pipeline() {
        let spec = YamlTemplateInterpreter::new()
            .instantiate(PIPELINE, &params())
            .unwrap();

        assert_eq!(spec.flows.len(), 3);
        assert_eq!(spec.flows[0].tasks[0].params["cluster"], "c1");
        assert_eq!(spec.flows[1].upstream[0].wait, vec!["finish".to_string()]);
        assert_eq!(spec.flows[1].upstream[0].missing, MissingAction::AutoStop);
        assert_eq!(
            spec.flows[2].upstream[0].wait_mask().unwrap(),
            WaitMask::FINISH.union(WaitMask::STOP)
        );
        assert_eq!(spec.flows[2].upstream[0].missing, MissingAction::Ignore);
    }

    #[test]
    fn test_parameter_values_stay_scalars() {
        let script = r#"
flows:
  - name: publish
    tags: ["cluster:${cluster}"]
    properties: {root: "${index_root}"}
    tasks:
      - name: publish
        kind: publish
        params:
          cluster: ${cluster}
"#;
        let mut params = BTreeMap::new();
        params.insert("cluster".to_string(), "c1\", \"stage:init".to_string());
        params.insert("index_root".to_string(), "/data/\"odd], x\n  - name: extra".to_string());

        let spec = YamlTemplateInterpreter::new().instantiate(script, &params).unwrap();

        assert_eq!(spec.flows.len(), 1);
        assert_eq!(spec.flows[0].tags, vec!["cluster:c1\", \"stage:init".to_string()]);
        assert_eq!(
            spec.flows[0].properties["root"],
            "/data/\"odd], x\n  - name: extra"
        );
        assert_eq!(spec.flows[0].tasks[0].params["cluster"], "c1\", \"stage:init");
    }

    #[test]
    fn test_placeholder_in_comment_is_ignored() {
        let script = "# uses ${nothing}\nflows:\n  - name: a\n";
        let spec = YamlTemplateInterpreter::new()
            .instantiate(script, &BTreeMap::new())
            .unwrap();
        assert_eq!(spec.flows[0].name, "a");
    }

    #[test]
    fn test_unbound_parameter() {
        let result = YamlTemplateInterpreter::new().instantiate(PIPELINE, &BTreeMap::new());
        assert!(matches!(result, Err(CoreError::TemplateError(msg)) if msg.contains("cluster")));
    }

    #[test]
    fn test_duplicate_flow_name() {
        let script = "flows:\n  - name: a\n  - name: a\n";
        let result = YamlTemplateInterpreter::new().instantiate(script, &BTreeMap::new());
        assert!(matches!(result, Err(CoreError::TemplateError(_))));
    }

    #[test]
    fn test_cycle_rejected() {
        let script = r#"
flows:
  - name: a
    upstream: [{flow: b}]
  - name: b
    upstream: [{flow: a}]
"#;
        let result = YamlTemplateInterpreter::new().instantiate(script, &BTreeMap::new());
        assert!(matches!(result, Err(CoreError::TemplateError(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_upstream_needs_one_reference() {
        let script = "flows:\n  - name: a\n    upstream: [{wait: [finish]}]\n";
        let result = YamlTemplateInterpreter::new().instantiate(script, &BTreeMap::new());
        assert!(matches!(result, Err(CoreError::TemplateError(_))));
    }

    #[test]
    fn test_unknown_wait_condition() {
        let script = "flows:\n  - name: a\n    upstream: [{flow_id: \"3\", wait: [error]}]\n";
        let result = YamlTemplateInterpreter::new().instantiate(script, &BTreeMap::new());
        assert!(matches!(result, Err(CoreError::TemplateError(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let result =
            YamlTemplateInterpreter::new().instantiate("flows: [name: {", &BTreeMap::new());
        assert!(matches!(result, Err(CoreError::TemplateError(_))));
    }
}
