use std::collections::HashMap;

/// Protocol key carrying the job id.
pub const KEY_JOB_ID: &str = "jobid";
/// Protocol key carrying the algorithm descriptor.
pub const KEY_ALGORITHM: &str = "algorithm";
/// Protocol key carrying the parser descriptor.
pub const KEY_PARSER: &str = "parser";
/// Protocol key carrying the input graph id in the artifact store.
pub const KEY_GRAPH: &str = "graph";
/// Legacy component key for algorithm parameters.
pub const KEY_PARAMETERS: &str = "parameters";

/// Parameters for one component, keyed by parameter name.
pub type ParameterMap = HashMap<String, String>;

/// Everything the control server tells the worker about a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    pub id: String,
    pub algorithm: String,
    pub parser: String,
    pub graph: String,
    /// Component key to that component's parameters.
    pub parameters: HashMap<String, ParameterMap>,
}

impl JobSpec {
    pub fn new(
        id: impl Into<String>,
        algorithm: impl Into<String>,
        parser: impl Into<String>,
        graph: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            algorithm: algorithm.into(),
            parser: parser.into(),
            graph: graph.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(
        mut self,
        component: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.parameters
            .entry(component.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Parameters for the given component, empty if none were sent.
    pub fn component_parameters(&self, component: &str) -> ParameterMap {
        self.parameters.get(component).cloned().unwrap_or_default()
    }

    /// Parameters handed to the algorithm plugin. Older control servers send
    /// them under `parameters` instead of `algorithm`.
    pub fn algorithm_parameters(&self) -> ParameterMap {
        let mut merged = self.component_parameters(KEY_PARAMETERS);
        merged.extend(self.component_parameters(KEY_ALGORITHM));
        merged
    }

    pub fn parser_parameters(&self) -> ParameterMap {
        self.component_parameters(KEY_PARSER)
    }
}
